use diesel::prelude::*;
use serde::Serialize;

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = crate::schema::feature_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FeatureRecordRow {
    /// Insertion sequence. Snapshots are read in `id` order, so a record's position
    /// in the snapshot (the matcher's last tie-breaker) follows it.
    pub id: i32,
    pub label: String,
    /// The embedding, serialized with bincode.
    pub feature_vector: Vec<u8>,
    pub created_at: time::PrimitiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::feature_records)]
pub struct NewFeatureRecord<'a> {
    pub label: &'a str,
    pub feature_vector: &'a [u8],
}

/// How many reference samples a label has in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelCount {
    pub label: String,
    pub samples: i64,
}
