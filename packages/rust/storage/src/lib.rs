//! libSQL storage layer (local mode) plus the cache, index and sink seams.
//!
//! The [`Storage`] struct wraps one libSQL database that backs:
//! - the [`FingerprintCache`] (stage markers and cached LLM results)
//! - the [`SimilarityIndex`] via [`LibsqlIndex`]
//! - the [`Sink`] via [`LibsqlSink`]
//!
//! In-memory implementations of all three live in [`memory`] for tests and
//! dry runs.

mod cache;
mod index;
pub mod memory;
mod migrations;
mod sink;

use std::path::Path;

use autonews_shared::{AutoNewsError, DistanceMetric, Result, SinkSettings};
use libsql::{Connection, Database, params};

pub use cache::{CacheKey, FingerprintCache, Stage};
pub use index::{LibsqlIndex, Neighbour, SimilarityIndex, distance};
pub use memory::{MemoryCache, MemoryIndex, MemorySink};
pub use sink::{
    CollectionHandle, LibsqlSink, PushOutcome, Sink, SinkFilter, SinkRecord, rotation_name,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AutoNewsError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AutoNewsError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| AutoNewsError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode (digest, listing).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AutoNewsError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| AutoNewsError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Similarity index over this database using `metric`.
    pub fn index(&self, metric: DistanceMetric) -> Result<LibsqlIndex> {
        Ok(LibsqlIndex::new(self.connect()?, metric, self.readonly))
    }

    /// Sink over this database.
    pub fn sink(&self, settings: SinkSettings) -> Result<LibsqlSink> {
        Ok(LibsqlSink::new(self.connect()?, settings, self.readonly))
    }

    /// Delete expired cache entries. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![cache::now_secs()],
            )
            .await
            .map_err(|e| AutoNewsError::Storage(e.to_string()))?;
        tracing::debug!(removed, "purged expired cache entries");
        Ok(removed)
    }

    fn connect(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| AutoNewsError::Storage(e.to_string()))
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    AutoNewsError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    pub(crate) fn check_writable(&self) -> Result<()> {
        check_writable(self.readonly)
    }
}

pub(crate) fn check_writable(readonly: bool) -> Result<()> {
    if readonly {
        return Err(AutoNewsError::Storage(
            "database is opened in read-only mode".into(),
        ));
    }
    Ok(())
}

pub(crate) fn storage_err(e: impl std::fmt::Display) -> AutoNewsError {
    AutoNewsError::Storage(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("an_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::test_storage;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("an_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("an_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.purge_expired().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));

        let sink = ro.sink(SinkSettings::default()).unwrap();
        assert!(sink.rotate().await.is_err());
    }
}
