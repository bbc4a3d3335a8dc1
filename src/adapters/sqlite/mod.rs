//! SQLite store adapters.
//!
//! Implement the store boundary ports over a WAL-mode SQLite pool.
//! Status transitions use compare-and-set updates so pause/cancel races
//! resolve in the database, not in memory.

pub mod action_run_repository;
pub mod background_task_repository;
pub mod connection;
pub mod migrations;
pub mod scheduled_action_repository;
pub mod task_step_repository;

pub use action_run_repository::SqliteActionRunRepository;
pub use background_task_repository::SqliteBackgroundTaskRepository;
pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use scheduled_action_repository::SqliteScheduledActionRepository;
pub use task_step_repository::SqliteTaskStepRepository;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};

/// Parse a UUID string from a row field.
pub fn parse_uuid(s: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| CoreError::External(format!("bad uuid in store: {e}")))
}

/// Parse an optional UUID string from a row field.
pub fn parse_optional_uuid(s: Option<String>) -> CoreResult<Option<Uuid>> {
    s.map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| CoreError::External(format!("bad uuid in store: {e}")))
}

/// Parse an RFC3339 datetime string from a row field.
pub fn parse_datetime(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map_err(|e| CoreError::External(format!("bad datetime in store: {e}")))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an optional RFC3339 datetime string from a row field.
pub fn parse_optional_datetime(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    s.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| CoreError::External(format!("bad datetime in store: {e}")))
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Open (creating if needed) and migrate a database.
pub async fn initialize_database(database_url: &str) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, None).await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}

/// Create an in-memory test pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initializes_an_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("core.db");
        let url = format!("sqlite:{}", path.display());

        let pool = initialize_database(&url).await.unwrap();
        drop(pool);

        // Re-opening is idempotent; the schema version sticks.
        let pool = initialize_database(&url).await.unwrap();
        let version: (i64,) = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version.0, 1);
    }
}
