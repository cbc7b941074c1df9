/// Database plumbing for the feature store: the connection pool, per-connection pragmas and schema migrations.

use std::fs;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Debug)]
pub struct ConnectionOptions {
    pub enable_wal: bool,
    pub busy_timeout: Option<Duration>,
}

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionOptions
{
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        (|| {
            if self.enable_wal {
                conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            }
            if let Some(d) = self.busy_timeout {
                conn.batch_execute(&format!("PRAGMA busy_timeout = {};", d.as_millis()))?;
            }
            Ok(())
        })()
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Builds the connection pool for the database at `config.database_path`,
/// creating its parent directory if needed. The database file itself is created
/// by SQLite on first connect.
pub fn get_connection_pool(config: &StoreConfig) -> Result<DbPool> {
    let db_path = &config.database_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::StoreUnavailable(format!("cannot create {:?}: {}", parent, e)))?;
    }

    let db_path_str = db_path.to_str()
        .ok_or_else(|| Error::StoreUnavailable(format!("database path {:?} is not valid UTF-8", db_path)))?;

    let manager = ConnectionManager::<SqliteConnection>::new(db_path_str);

    let pool = Pool::builder()
        .max_size(config.pool_size)
        .test_on_check_out(true)
        .connection_customizer(Box::new(ConnectionOptions {
            enable_wal: true,
            busy_timeout: Some(config.busy_timeout()),
        }))
        .build(manager)?;

    info!("Opened feature store at {:?}", db_path);
    Ok(pool)
}

pub fn get_db_connection(pool: &DbPool) -> Result<DbConnection> {
    Ok(pool.get()?)
}

pub fn run_migrations(pool: &DbPool) -> Result<()> {
    let mut connection = get_db_connection(pool)?;
    // The harness error is a boxed trait object, so convert it by hand.
    let applied = connection.run_pending_migrations(MIGRATIONS)
        .map_err(|e| Error::StoreUnavailable(format!("error running migrations: {:?}", e)))?;
    if !applied.is_empty() {
        info!("Applied {} feature store migration(s)", applied.len());
    }
    Ok(())
}
