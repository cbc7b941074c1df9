/// Exact nearest-neighbor matching of a query embedding against the reference corpus,
/// and the confidence rule that turns the best distance into a decision.
///
/// Every request scans the full corpus as it is stored at that moment; there is no index.
///
/// Distance is the cosine distance, `1 - cos(q, v)`, ranging from 0 (same direction)
/// through 1 (no correlation) to 2 (opposite).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::store::FeatureRecord;

/// Product name reported whenever no stored label is confident enough.
pub const NOT_DETERMINED: &str = "Not Determined";

/// The outcome of classifying one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult
{
    /// A stored label, or `NOT_DETERMINED`.
    pub product_name: String,
    /// Always within `[0, 100]`.
    pub confidence: f64,
}

impl ClassificationResult
{
    pub fn not_determined(confidence: f64) -> Self
    {
        ClassificationResult { product_name: NOT_DETERMINED.to_string(), confidence }
    }

    pub fn is_determined(&self) -> bool
    {
        self.product_name != NOT_DETERMINED
    }
}

/// How a confidence value falls against the two thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict
{
    /// Below `report`: not even the number is worth returning.
    Rejected,
    /// In `[report, assert)`: the confidence is reported but no label is asserted.
    Uncertain,
    /// At or above `assert`: the best label is the answer.
    Identified,
}

impl Thresholds
{
    pub fn verdict(&self, confidence: f64) -> Verdict
    {
        if confidence < self.report {
            Verdict::Rejected
        } else if confidence < self.assert {
            Verdict::Uncertain
        } else {
            Verdict::Identified
        }
    }
}

/// A stored record scored against the query. Produced fresh for every query.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate<'a>
{
    pub record: &'a FeatureRecord,
    /// Cosine distance to the query; `+inf` when the dimensions differ.
    pub distance: f64,
    /// Position of the record in the snapshot, i.e. its insertion order.
    pub position: usize,
}

impl RankedCandidate<'_>
{
    /// Candidates with a dimension mismatch can never be selected.
    pub fn is_qualified(&self) -> bool
    {
        self.distance.is_finite()
    }

    pub fn confidence(&self) -> f64
    {
        confidence_from_distance(self.distance)
    }
}

/// Cosine distance between two embeddings.
///
/// - Different dimensions: `+inf`, which disqualifies the candidate.
/// - A zero-magnitude vector makes the similarity undefined; that counts as
///   "no correlation", i.e. a distance of exactly `1`.
///
/// Accumulates in f64 so that a vector compared with itself gives exactly `0`.
pub fn cosine_distance(query: &[f32], candidate: &[f32]) -> f64
{
    if query.len() != candidate.len() {
        return f64::INFINITY;
    }

    let (mut dot, mut query_norm, mut candidate_norm) = (0.0f64, 0.0f64, 0.0f64);
    for (&q, &v) in query.iter().zip(candidate) {
        let (q, v) = (q as f64, v as f64);
        dot += q * v;
        query_norm += q * q;
        candidate_norm += v * v;
    }

    // sqrt(a * b) rather than sqrt(a) * sqrt(b): for a == b this is exact.
    let similarity = dot / (query_norm * candidate_norm).sqrt();
    if similarity.is_nan() {
        return 1.0;
    }

    1.0 - similarity.clamp(-1.0, 1.0)
}

/// Maps a cosine distance to a confidence in `[0, 100]`: `(1 - distance) * 100`, clamped.
/// Non-increasing in the distance; `NaN` is read as distance `1` (confidence 0).
pub fn confidence_from_distance(distance: f64) -> f64
{
    let distance = if distance.is_nan() { 1.0 } else { distance };
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

/// Scores the query against every record and sorts the candidates, closest first.
///
/// Ties on distance are broken by label, then by insertion order, so the ranking
/// is fully determined by the corpus contents.
pub fn rank<'a>(query: &[f32], records: &'a [FeatureRecord]) -> Vec<RankedCandidate<'a>>
{
    let mut candidates: Vec<RankedCandidate<'a>> = records
        .iter()
        .enumerate()
        .map(|(position, record)| RankedCandidate {
            record,
            distance: cosine_distance(query, &record.vector),
            position,
        })
        .collect();

    candidates.sort_by(compare_candidates);
    candidates
}

fn compare_candidates(a: &RankedCandidate<'_>, b: &RankedCandidate<'_>) -> Ordering
{
    a.distance.total_cmp(&b.distance)
        .then_with(|| a.record.label.cmp(&b.record.label))
        .then_with(|| a.position.cmp(&b.position))
}

/// Applies the two-threshold decision rule to the best candidate.
///
/// | best candidate | confidence | product name |
/// |---|---|---|
/// | none qualified | 0 | Not Determined |
/// | `< report` | 0 | Not Determined |
/// | `[report, assert)` | computed | Not Determined |
/// | `>= assert` | computed | best label |
pub fn decide(best: Option<&RankedCandidate<'_>>, thresholds: &Thresholds) -> ClassificationResult
{
    let Some(best) = best.filter(|c| c.is_qualified()) else {
        return ClassificationResult::not_determined(0.0);
    };

    let confidence = best.confidence();
    match thresholds.verdict(confidence) {
        Verdict::Rejected => ClassificationResult::not_determined(0.0),
        Verdict::Uncertain => ClassificationResult::not_determined(confidence),
        Verdict::Identified => ClassificationResult {
            product_name: best.record.label.clone(),
            confidence,
        },
    }
}

/// Ranks the corpus against `query` and decides. An empty corpus, or one where no
/// record has the query's dimension, yields `Not Determined` with confidence 0.
pub fn classify(query: &[f32], records: &[FeatureRecord], thresholds: &Thresholds) -> ClassificationResult
{
    let candidates = rank(query, records);
    decide(candidates.first(), thresholds)
}

#[cfg(test)]
mod tests
{
    use approx::assert_abs_diff_eq;

    use super::*;

    fn record(label: &str, vector: &[f32]) -> FeatureRecord
    {
        FeatureRecord { label: label.to_string(), vector: vector.to_vec() }
    }

    /// A unit vector at the given cosine to `[1, 0]`.
    fn at_cosine(cosine: f64) -> Vec<f32>
    {
        vec![cosine as f32, (1.0 - cosine * cosine).sqrt() as f32]
    }

    #[test]
    fn identical_vectors_have_zero_distance_and_full_confidence()
    {
        let v = [0.3f32, -1.7, 2.25, 1e-3, 42.0];
        assert_eq!(cosine_distance(&v, &v), 0.0);
        assert_eq!(confidence_from_distance(cosine_distance(&v, &v)), 100.0);
    }

    #[test]
    fn scaling_does_not_change_the_distance()
    {
        let v = [1.0f32, 2.0, 3.0];
        let scaled = [10.0f32, 20.0, 30.0];
        assert_abs_diff_eq!(cosine_distance(&v, &scaled), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn orthogonal_vectors_have_zero_confidence()
    {
        let d = cosine_distance(&[1.0, 0.0], &[0.0, 3.0]);
        assert_eq!(d, 1.0);
        assert_eq!(confidence_from_distance(d), 0.0);
    }

    #[test]
    fn opposite_vectors_are_clamped_to_zero_confidence()
    {
        let d = cosine_distance(&[1.0, 1.0], &[-1.0, -1.0]);
        assert_abs_diff_eq!(d, 2.0, epsilon = 1e-12);
        assert_eq!(confidence_from_distance(d), 0.0);
    }

    #[test]
    fn dimension_mismatch_is_infinitely_far()
    {
        assert_eq!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0, 0.0]), f64::INFINITY);
        assert_eq!(confidence_from_distance(f64::INFINITY), 0.0);
    }

    #[test]
    fn zero_vector_counts_as_uncorrelated()
    {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 2.0]), 1.0);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(confidence_from_distance(f64::NAN), 0.0);
    }

    #[test]
    fn confidence_is_monotone_and_bounded()
    {
        let mut previous = f64::INFINITY;
        for step in 0..=400 {
            let distance = -1.0 + step as f64 * 0.01;
            let confidence = confidence_from_distance(distance);
            assert!((0.0..=100.0).contains(&confidence), "{confidence} out of range");
            assert!(confidence <= previous);
            previous = confidence;
        }
    }

    #[test]
    fn single_record_exact_match_is_identified()
    {
        let v = [0.5f32, 0.1, -0.4, 0.9];
        let corpus = vec![record("A", &v)];
        let result = classify(&v, &corpus, &Thresholds::default());
        assert_eq!(result, ClassificationResult { product_name: "A".to_string(), confidence: 100.0 });
    }

    #[test]
    fn empty_corpus_is_not_determined()
    {
        let result = classify(&[1.0, 2.0], &[], &Thresholds::default());
        assert_eq!(result, ClassificationResult::not_determined(0.0));
        assert!(!result.is_determined());
    }

    #[test]
    fn all_candidates_disqualified_behaves_like_empty_corpus()
    {
        let corpus = vec![record("A", &[1.0, 0.0, 0.0]), record("B", &[1.0])];
        let result = classify(&[1.0, 0.0], &corpus, &Thresholds::default());
        assert_eq!(result, classify(&[1.0, 0.0], &[], &Thresholds::default()));
    }

    #[test]
    fn mismatched_records_do_not_stop_the_scan()
    {
        let corpus = vec![record("wrong-dim", &[1.0, 0.0, 0.0]), record("ok", &[1.0, 0.0])];
        let ranked = rank(&[1.0, 0.0], &corpus);
        assert_eq!(ranked[0].record.label, "ok");
        assert!(!ranked[1].is_qualified());
        assert_eq!(classify(&[1.0, 0.0], &corpus, &Thresholds::default()).product_name, "ok");
    }

    #[test]
    fn closest_record_wins()
    {
        let corpus = vec![
            record("far", &at_cosine(0.7)),
            record("near", &at_cosine(0.95)),
            record("mid", &at_cosine(0.8)),
        ];
        let ranked = rank(&[1.0, 0.0], &corpus);
        let labels: Vec<&str> = ranked.iter().map(|c| c.record.label.as_str()).collect();
        assert_eq!(labels, vec!["near", "mid", "far"]);
        assert_eq!(classify(&[1.0, 0.0], &corpus, &Thresholds::default()).product_name, "near");
    }

    #[test]
    fn ties_break_by_label_then_insertion_order()
    {
        let v = [1.0f32, 1.0];
        let corpus = vec![record("zeta", &v), record("alpha", &v), record("alpha", &v)];
        let ranked = rank(&v, &corpus);
        let order: Vec<(&str, usize)> = ranked.iter().map(|c| (c.record.label.as_str(), c.position)).collect();
        assert_eq!(order, vec![("alpha", 1), ("alpha", 2), ("zeta", 0)]);
    }

    #[test]
    fn verdict_boundaries()
    {
        let thresholds = Thresholds::default();
        assert_eq!(thresholds.verdict(49.9), Verdict::Rejected);
        assert_eq!(thresholds.verdict(50.0), Verdict::Uncertain);
        assert_eq!(thresholds.verdict(59.9), Verdict::Uncertain);
        assert_eq!(thresholds.verdict(60.0), Verdict::Identified);
    }

    #[test]
    fn below_report_threshold_reports_zero()
    {
        let corpus = vec![record("A", &at_cosine(0.499))];
        let result = classify(&[1.0, 0.0], &corpus, &Thresholds::default());
        assert_eq!(result, ClassificationResult::not_determined(0.0));
    }

    #[test]
    fn exactly_report_threshold_is_uncertain()
    {
        // cos = 1 / 2 exactly.
        let corpus = vec![record("A", &[1.0, 1.0, 1.0, 1.0])];
        let result = classify(&[1.0, 0.0, 0.0, 0.0], &corpus, &Thresholds::default());
        assert_eq!(result, ClassificationResult::not_determined(50.0));
    }

    #[test]
    fn just_below_assert_threshold_is_uncertain()
    {
        let corpus = vec![record("A", &at_cosine(0.599))];
        let result = classify(&[1.0, 0.0], &corpus, &Thresholds::default());
        assert_eq!(result.product_name, NOT_DETERMINED);
        assert_abs_diff_eq!(result.confidence, 59.9, epsilon = 1e-4);
    }

    #[test]
    fn exactly_assert_threshold_is_identified()
    {
        // cos = 3 / 5 exactly.
        let corpus = vec![record("A", &[3.0, 4.0])];
        let result = classify(&[1.0, 0.0], &corpus, &Thresholds::default());
        assert_eq!(result.product_name, "A");
        assert_eq!(result.confidence, 60.0);
    }

    #[test]
    fn custom_thresholds_are_honored()
    {
        let corpus = vec![record("A", &at_cosine(0.55))];
        let strict = Thresholds { report: 0.0, assert: 90.0 };
        let lenient = Thresholds { report: 10.0, assert: 20.0 };
        assert_eq!(classify(&[1.0, 0.0], &corpus, &strict).product_name, NOT_DETERMINED);
        assert_eq!(classify(&[1.0, 0.0], &corpus, &lenient).product_name, "A");
    }

    #[test]
    fn result_serializes_with_product_name_key()
    {
        let json = serde_json::to_value(ClassificationResult::not_determined(0.0)).unwrap();
        assert_eq!(json, serde_json::json!({ "productName": "Not Determined", "confidence": 0.0 }));
    }
}
