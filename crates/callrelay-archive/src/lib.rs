//! Archive store for the callrelay engine
//!
//! The sole source of truth for archived calls and the configuration
//! entities (Systems, Talkgroups, Units, `ApiKeys`, `AccessCodes`,
//! `DownstreamTargets`). Persist, dedup and auto-provisioning commit in
//! one transaction; concurrent readers and writers rely on the storage
//! engine's own isolation.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]

pub mod models;
pub mod queries;

pub use queries::{CallCursor, CallFilter, CallPage, Persisted, PruneOutcome};

use callrelay_core::{
    config::{ArchiveConfig, StorageConfig},
    Error, Result,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Archive database handle
#[derive(Debug, Clone)]
pub struct Archive {
    pool: SqlitePool,
    config: ArchiveConfig,
}

impl Archive {
    /// Open (or create) the archive database and run migrations
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database cannot be opened or migrated.
    pub async fn open(storage: &StorageConfig, config: ArchiveConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&storage.base_dir).await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(storage.max_connections)
            .connect(&storage.database_url())
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        let archive = Self { pool, config };
        archive.migrate().await?;
        Ok(archive)
    }

    /// Open an archive on an existing pool (used by tests)
    #[must_use]
    pub const fn from_pool(pool: SqlitePool, config: ArchiveConfig) -> Self {
        Self { pool, config }
    }

    /// The archive configuration this handle was opened with
    #[must_use]
    pub const fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Get a reference to the connection pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    ///
    /// # Errors
    ///
    /// Returns a storage error if migrations fail to run.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Health check
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("health check failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn storage_config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig {
            base_dir: dir.path().to_path_buf(),
            database_file: "test.db".to_string(),
            max_connections: 2,
        }
    }

    #[tokio::test]
    async fn test_open_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&storage_config(&dir), ArchiveConfig::default())
            .await
            .unwrap();
        archive.health_check().await.unwrap();

        assert!(dir.path().join("test.db").exists());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&storage_config(&dir), ArchiveConfig::default())
            .await
            .unwrap();
        archive.migrate().await.unwrap();
        archive.health_check().await.unwrap();
    }
}
