/// The feature store: the persisted corpus of labeled reference embeddings.
/// Queries related to the database itself (pooling, pragmas, migrations)
/// are handled in the db module.

use diesel::dsl::count_star;
use diesel::prelude::*;
use log::debug;

use crate::config::StoreConfig;
use crate::db::{self, DbPool};
use crate::error::Result;
use crate::models::{FeatureRecordRow, LabelCount, NewFeatureRecord};

/// A fixed-length embedding as produced by the feature extractor.
pub type EmbeddingVector = Vec<f32>;

/// One labeled reference sample. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord
{
    pub label: String,
    pub vector: EmbeddingVector,
}

/// Durable storage of reference samples.
///
/// `snapshot()` must never observe a half-written record, and must fail rather
/// than return an empty corpus when the storage can't be read.
pub trait FeatureStore: Send + Sync
{
    /// Persists a new record. Labels need not be unique.
    fn append(&self, label: &str, vector: &[f32]) -> Result<()>;

    /// Every stored record, in insertion order.
    fn snapshot(&self) -> Result<Vec<FeatureRecord>>;

    /// Deletes every record with the given label, returning how many were removed.
    fn remove_label(&self, label: &str) -> Result<usize>;

    fn count(&self) -> Result<usize>;

    /// Distinct labels with their sample counts, sorted by label.
    fn labels(&self) -> Result<Vec<LabelCount>>;
}

/// `FeatureStore` backed by SQLite through a diesel connection pool.
/// SQLite gives each statement a consistent view, so concurrent snapshots
/// never see a partially inserted row.
#[derive(Clone)]
pub struct SqliteFeatureStore
{
    pool: DbPool,
}

impl SqliteFeatureStore
{
    /// Opens (creating if needed) the database and brings its schema up to date.
    pub fn open(config: &StoreConfig) -> Result<Self>
    {
        let pool = db::get_connection_pool(config)?;
        db::run_migrations(&pool)?;
        Ok(SqliteFeatureStore { pool })
    }
}

impl FeatureStore for SqliteFeatureStore
{
    fn append(&self, label: &str, vector: &[f32]) -> Result<()>
    {
        use crate::schema::feature_records;

        let encoded = bincode::serialize(vector)?;
        let connection = &mut db::get_db_connection(&self.pool)?;

        diesel::insert_into(feature_records::table)
            .values(NewFeatureRecord { label, feature_vector: &encoded })
            .execute(connection)?;

        debug!("Stored reference vector for {:?} ({} dimensions)", label, vector.len());
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<FeatureRecord>>
    {
        use crate::schema::feature_records;

        let connection = &mut db::get_db_connection(&self.pool)?;

        let rows = feature_records::table
            .select(FeatureRecordRow::as_select())
            .order(feature_records::id.asc())
            .load(connection)?;

        rows.into_iter()
            .map(|row| Ok(FeatureRecord {
                vector: bincode::deserialize(&row.feature_vector[..])?,
                label: row.label,
            }))
            .collect::<Result<Vec<FeatureRecord>>>()
    }

    fn remove_label(&self, label: &str) -> Result<usize>
    {
        use crate::schema::feature_records;

        let connection = &mut db::get_db_connection(&self.pool)?;

        let removed = diesel::delete(feature_records::table.filter(feature_records::label.eq(label)))
            .execute(connection)?;

        Ok(removed)
    }

    fn count(&self) -> Result<usize>
    {
        use crate::schema::feature_records;

        let connection = &mut db::get_db_connection(&self.pool)?;

        let total: i64 = feature_records::table
            .select(count_star())
            .first(connection)?;

        Ok(total as usize)
    }

    fn labels(&self) -> Result<Vec<LabelCount>>
    {
        use crate::schema::feature_records;

        let connection = &mut db::get_db_connection(&self.pool)?;

        let counts: Vec<(String, i64)> = feature_records::table
            .group_by(feature_records::label)
            .select((feature_records::label, count_star()))
            .order(feature_records::label.asc())
            .load(connection)?;

        Ok(counts.into_iter().map(|(label, samples)| LabelCount { label, samples }).collect())
    }
}
