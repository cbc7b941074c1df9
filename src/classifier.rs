use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::Thresholds;
use crate::error::{Error, Result};
use crate::matcher::{self, ClassificationResult};
use crate::model::FeatureExtractor;
use crate::preprocessing;
use crate::state::ModelState;
use crate::store::{EmbeddingVector, FeatureStore};

/// How many reference images are decoded and held in memory at once during ingestion.
pub const INGEST_CHUNK_SIZE: usize = 32;

/// A candidate as shown to a caller inspecting the ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredLabel
{
    pub label: String,
    pub distance: f64,
    pub confidence: f64,
}

/// Outcome of a batch of reference ingestions.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport
{
    pub stored: usize,
    pub per_label: FxHashMap<String, usize>,
    /// Files that could not be decoded or embedded, with the reason.
    pub failures: Vec<(PathBuf, String)>,
}

impl IngestReport
{
    fn merge(&mut self, other: IngestReport)
    {
        self.stored += other.stored;
        for (label, count) in other.per_label {
            *self.per_label.entry(label).or_default() += count;
        }
        self.failures.extend(other.failures);
    }
}

/// Runs one image through preprocessing, embedding and matching.
///
/// Holds no per-request state: every call re-reads the whole corpus, so records
/// appended by one call are visible to the next. Calls may run concurrently.
#[derive(Clone)]
pub struct Classifier
{
    model: Arc<ModelState>,
    store: Arc<dyn FeatureStore>,
    thresholds: Thresholds,
}

impl Classifier
{
    pub fn new(model: Arc<ModelState>, store: Arc<dyn FeatureStore>, thresholds: Thresholds) -> Self
    {
        Classifier { model, store, thresholds }
    }

    pub fn model_state(&self) -> &ModelState
    {
        &self.model
    }

    pub fn store(&self) -> &dyn FeatureStore
    {
        self.store.as_ref()
    }

    pub fn thresholds(&self) -> Thresholds
    {
        self.thresholds
    }

    /// Preprocesses and embeds one encoded image.
    /// Fails with `ModelNotReady` before touching the image if the model isn't loaded.
    pub fn embed(&self, image_bytes: &[u8]) -> Result<EmbeddingVector>
    {
        let extractor = self.model.extractor()?;
        let input = preprocessing::preprocess(image_bytes, extractor.input_size())?;
        extractor.extract(input)
    }

    /// Classifies one encoded image against the current corpus.
    ///
    /// Any failure (bad image, model not ready, inference error, unreadable store)
    /// is returned as-is; a low-confidence match is a successful `Not Determined`.
    pub fn classify(&self, image_bytes: &[u8]) -> Result<ClassificationResult>
    {
        let now = std::time::Instant::now();

        let query = self.embed(image_bytes)?;
        let corpus = self.store.snapshot()?;
        let result = matcher::classify(&query, &corpus, &self.thresholds);

        debug!(
            "Classified image as {:?} (confidence {:.2}) against {} reference(s) in {:?}",
            result.product_name, result.confidence, corpus.len(), now.elapsed()
        );
        Ok(result)
    }

    /// The `k` closest qualified references for an image, for diagnostics.
    pub fn top_matches(&self, image_bytes: &[u8], k: usize) -> Result<Vec<ScoredLabel>>
    {
        let query = self.embed(image_bytes)?;
        let corpus = self.store.snapshot()?;

        Ok(matcher::rank(&query, &corpus)
            .into_iter()
            .filter(|c| c.is_qualified())
            .take(k)
            .map(|c| ScoredLabel {
                label: c.record.label.clone(),
                distance: c.distance,
                confidence: c.confidence(),
            })
            .collect())
    }

    /// Embeds an image and stores it as a reference sample for `label`.
    pub fn ingest(&self, label: &str, image_bytes: &[u8]) -> Result<()>
    {
        let vector = self.embed(image_bytes)?;
        self.store.append(label, &vector)
    }

    /// Ingests image files under one label. Files are decoded in parallel,
    /// `INGEST_CHUNK_SIZE` at a time.
    ///
    /// Per-file problems (unreadable image, failed inference) are collected in the
    /// report; a missing model or an unavailable store aborts the batch.
    pub fn ingest_files(&self, label: &str, paths: &[PathBuf]) -> Result<IngestReport>
    {
        let extractor = self.model.extractor()?;
        let mut report = IngestReport::default();

        // Decode a bounded number of images at a time; each chunk is embedded and
        // stored before the next one is loaded.
        for chunk in paths.chunks(INGEST_CHUNK_SIZE)
        {
            for (path, image) in preprocessing::load_image_batch(chunk)
            {
                let vector = image.and_then(|img| {
                    let input = preprocessing::image_to_model_format(&img, extractor.input_size());
                    extractor.extract(input)
                });

                match vector {
                    Ok(vector) => {
                        self.store.append(label, &vector)?;
                        report.stored += 1;
                        *report.per_label.entry(label.to_string()).or_default() += 1;
                    }
                    Err(e @ (Error::Preprocess(_) | Error::Extraction(_))) => {
                        warn!("Skipping {:?}: {}", path, e);
                        report.failures.push((path, e.to_string()));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!("Ingested {} reference image(s) for {:?} ({} failed)", report.stored, label, report.failures.len());
        Ok(report)
    }

    /// Ingests a directory laid out as `root/<label>/<image files>`.
    /// Hidden files, hidden label directories and anything not exactly one level below
    /// a label directory are ignored.
    pub fn ingest_directory(&self, root: &Path) -> Result<IngestReport>
    {
        let mut by_label: FxHashMap<String, Vec<PathBuf>> = FxHashMap::default();

        // Only entries below the root are checked; the root may itself be a dot-directory.
        let walker = WalkDir::new(root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

        for entry in walker
        {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let label = entry.path()
                .parent()
                .and_then(|dir| dir.file_name())
                .map(|name| name.to_string_lossy().to_string());
            if let Some(label) = label {
                by_label.entry(label).or_default().push(entry.into_path());
            }
        }

        let mut labels: Vec<String> = by_label.keys().cloned().collect();
        labels.sort();

        let mut report = IngestReport::default();
        for label in labels
        {
            let mut paths = by_label.remove(&label).unwrap_or_default();
            paths.sort();
            report.merge(self.ingest_files(&label, &paths)?);
        }
        Ok(report)
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool
{
    entry.file_name().to_string_lossy().starts_with('.')
}
