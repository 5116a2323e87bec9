use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MIGRATION_FLAG: &str = "legacy_migration_completed";

/// Persisted boolean guarding the one-time migration; lives outside the
/// family snapshot so clearing the cache does not re-arm it.
pub trait MigrationFlagStore: Send + Sync {
    fn is_completed(&self) -> Result<bool, InfraError>;
    fn mark_completed(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteMigrationFlagStore {
    db_path: PathBuf,
}

impl SqliteMigrationFlagStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

impl MigrationFlagStore for SqliteMigrationFlagStore {
    fn is_completed(&self) -> Result<bool, InfraError> {
        let connection = open_connection(&self.db_path)?;
        let enabled: Option<i64> = connection
            .query_row(
                "SELECT enabled FROM app_flags WHERE name = ?1",
                params![MIGRATION_FLAG],
                |row| row.get(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(0) != 0)
    }

    fn mark_completed(&self) -> Result<(), InfraError> {
        let connection = open_connection(&self.db_path)?;
        connection.execute(
            "INSERT INTO app_flags (name, enabled, updated_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(name) DO UPDATE SET
               enabled = excluded.enabled,
               updated_at = excluded.updated_at",
            params![MIGRATION_FLAG, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMigrationFlagStore {
    completed: Mutex<bool>,
}

impl MigrationFlagStore for InMemoryMigrationFlagStore {
    fn is_completed(&self) -> Result<bool, InfraError> {
        let completed = self
            .completed
            .lock()
            .map_err(|error| InfraError::StateLock(format!("migration flag: {error}")))?;
        Ok(*completed)
    }

    fn mark_completed(&self) -> Result<(), InfraError> {
        let mut completed = self
            .completed
            .lock()
            .map_err(|error| InfraError::StateLock(format!("migration flag: {error}")))?;
        *completed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use std::fs;

    #[test]
    fn sqlite_flag_persists_across_instances() {
        let dir = std::env::temp_dir().join(format!("chorestar-flag-tests-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("flags.sqlite");
        initialize_database(&path).expect("initialize database");

        let store = SqliteMigrationFlagStore::new(&path);
        assert!(!store.is_completed().expect("read flag"));
        store.mark_completed().expect("mark");
        store.mark_completed().expect("mark twice");

        let reopened = SqliteMigrationFlagStore::new(&path);
        assert!(reopened.is_completed().expect("read flag"));
        let _ = fs::remove_dir_all(&dir);
    }
}
