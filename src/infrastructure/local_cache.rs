use crate::NowProvider;
use crate::domain::models::{FamilySnapshot, SnapshotPatch};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

const SNAPSHOT_KEY: &str = "family_snapshot";
const LEGACY_SNAPSHOT_KEY: &str = "legacy_family_snapshot";

/// Durable copy of the whole family state. Reads never fail: a missing or
/// unreadable blob is an empty snapshot.
pub trait LocalCacheStore: Send + Sync {
    fn load(&self) -> FamilySnapshot;
    fn save(&self, patch: SnapshotPatch) -> Result<FamilySnapshot, InfraError>;
    fn load_legacy(&self) -> Option<FamilySnapshot>;
}

#[derive(Clone)]
pub struct SqliteLocalCacheStore {
    db_path: PathBuf,
    now_provider: NowProvider,
}

impl SqliteLocalCacheStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn write_legacy(&self, snapshot: &FamilySnapshot) -> Result<(), InfraError> {
        let connection = open_connection(&self.db_path)?;
        write_value(
            &connection,
            LEGACY_SNAPSHOT_KEY,
            &serde_json::to_string(snapshot)?,
            &(self.now_provider)().to_rfc3339(),
        )
    }

    fn read_snapshot(&self, key: &str) -> Result<Option<FamilySnapshot>, InfraError> {
        let connection = open_connection(&self.db_path)?;
        read_snapshot(&connection, key)
    }
}

fn read_snapshot(connection: &Connection, key: &str) -> Result<Option<FamilySnapshot>, InfraError> {
    let raw: Option<String> = connection
        .query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

fn write_value(
    connection: &Connection,
    key: &str,
    value: &str,
    updated_at: &str,
) -> Result<(), InfraError> {
    connection.execute(
        "INSERT INTO kv_store (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![key, value, updated_at],
    )?;
    Ok(())
}

impl LocalCacheStore for SqliteLocalCacheStore {
    fn load(&self) -> FamilySnapshot {
        match self.read_snapshot(SNAPSHOT_KEY) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => FamilySnapshot::default(),
            Err(error) => {
                warn!("discarding unreadable family snapshot: {error}");
                FamilySnapshot::default()
            }
        }
    }

    fn save(&self, patch: SnapshotPatch) -> Result<FamilySnapshot, InfraError> {
        let mut connection = open_connection(&self.db_path)?;
        let transaction = connection.transaction()?;
        let mut snapshot = match read_snapshot(&transaction, SNAPSHOT_KEY) {
            Ok(existing) => existing.unwrap_or_default(),
            Err(error) => {
                warn!("overwriting unreadable family snapshot: {error}");
                FamilySnapshot::default()
            }
        };
        let now = (self.now_provider)();
        patch.apply_to(&mut snapshot);
        snapshot.last_updated_epoch_ms = Some(now.timestamp_millis());
        write_value(
            &transaction,
            SNAPSHOT_KEY,
            &serde_json::to_string(&snapshot)?,
            &now.to_rfc3339(),
        )?;
        transaction.commit()?;
        Ok(snapshot)
    }

    fn load_legacy(&self) -> Option<FamilySnapshot> {
        match self.read_snapshot(LEGACY_SNAPSHOT_KEY) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!("ignoring unreadable legacy snapshot: {error}");
                None
            }
        }
    }
}

pub struct InMemoryLocalCacheStore {
    snapshot: Mutex<Option<FamilySnapshot>>,
    legacy: Mutex<Option<FamilySnapshot>>,
    now_provider: NowProvider,
}

impl Default for InMemoryLocalCacheStore {
    fn default() -> Self {
        Self {
            snapshot: Mutex::new(None),
            legacy: Mutex::new(None),
            now_provider: Arc::new(Utc::now),
        }
    }
}

impl InMemoryLocalCacheStore {
    pub fn with_legacy(legacy: FamilySnapshot) -> Self {
        Self {
            legacy: Mutex::new(Some(legacy)),
            ..Self::default()
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }
}

impl LocalCacheStore for InMemoryLocalCacheStore {
    fn load(&self) -> FamilySnapshot {
        self.snapshot
            .lock()
            .map(|guard| guard.clone().unwrap_or_default())
            .unwrap_or_default()
    }

    fn save(&self, patch: SnapshotPatch) -> Result<FamilySnapshot, InfraError> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|error| InfraError::StateLock(format!("local cache: {error}")))?;
        let mut snapshot = guard.clone().unwrap_or_default();
        patch.apply_to(&mut snapshot);
        snapshot.last_updated_epoch_ms = Some((self.now_provider)().timestamp_millis());
        *guard = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn load_legacy(&self) -> Option<FamilySnapshot> {
        self.legacy.lock().ok().and_then(|guard| guard.clone())
    }
}
