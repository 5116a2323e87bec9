use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_rows::{FamilyRows, RemoteRow, RemoteTable};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default)]
    pub family_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Authoritative family store keyed by string ids. Reads that the store
/// refuses (not authorized, not found) come back empty rather than failing.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn exists(&self, table: RemoteTable, id: &str) -> Result<bool, InfraError>;

    /// Fails with [`InfraError::Duplicate`] when the id is already taken.
    async fn insert(&self, row: &RemoteRow) -> Result<(), InfraError>;

    async fn update(&self, row: &RemoteRow) -> Result<(), InfraError>;

    /// Deleting a missing row succeeds.
    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), InfraError>;

    /// Multi-row insert that ignores rows whose id already exists. Returns
    /// the ids the store actually inserted.
    async fn insert_ignoring_duplicates(
        &self,
        table: RemoteTable,
        rows: &[RemoteRow],
    ) -> Result<Vec<String>, InfraError>;

    async fn fetch_family(&self, family_id: &str) -> Result<FamilyRows, InfraError>;

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, InfraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Exists,
    Insert,
    Update,
    Delete,
    InsertBatch,
    FetchFamily,
    FetchProfile,
}

/// Store double with per-call failure scripting and call counters.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    tables: Mutex<HashMap<RemoteTable, BTreeMap<String, RemoteRow>>>,
    profiles: Mutex<HashMap<String, ProfileRow>>,
    scripted_failures: Mutex<HashMap<StoreCall, VecDeque<InfraError>>>,
    calls: Mutex<HashMap<StoreCall, usize>>,
    reject_batches: AtomicBool,
    rejected_row_ids: Mutex<HashSet<String>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, profile: ProfileRow) -> Self {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.insert(profile.id.clone(), profile);
        }
        self
    }

    pub fn seed(&self, row: RemoteRow) {
        if let Ok(mut tables) = self.tables.lock() {
            tables
                .entry(row.table())
                .or_default()
                .insert(row.id().to_string(), row);
        }
    }

    pub fn fail_next(&self, call: StoreCall, error: InfraError) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures.entry(call).or_default().push_back(error);
        }
    }

    /// Every multi-row insert is refused as a whole.
    pub fn reject_batches(&self) {
        self.reject_batches.store(true, Ordering::SeqCst);
    }

    /// Single-row inserts of this id fail validation.
    pub fn reject_row(&self, id: &str) {
        if let Ok(mut rejected) = self.rejected_row_ids.lock() {
            rejected.insert(id.to_string());
        }
    }

    pub fn rows(&self, table: RemoteTable) -> Vec<RemoteRow> {
        self.tables
            .lock()
            .map(|tables| {
                tables
                    .get(&table)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn row(&self, table: RemoteTable, id: &str) -> Option<RemoteRow> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(&table).and_then(|rows| rows.get(id).cloned()))
    }

    pub fn call_count(&self, call: StoreCall) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&call).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn begin(&self, call: StoreCall) -> Result<(), InfraError> {
        let mut calls = self.calls.lock().map_err(lock_error)?;
        *calls.entry(call).or_insert(0) += 1;
        drop(calls);

        let mut failures = self.scripted_failures.lock().map_err(lock_error)?;
        match failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn insert_row(&self, row: &RemoteRow) -> Result<bool, InfraError> {
        let mut tables = self.tables.lock().map_err(lock_error)?;
        let rows = tables.entry(row.table()).or_default();
        if rows.contains_key(row.id()) {
            return Ok(false);
        }
        rows.insert(row.id().to_string(), row.clone());
        Ok(true)
    }

    fn is_rejected(&self, id: &str) -> Result<bool, InfraError> {
        Ok(self.rejected_row_ids.lock().map_err(lock_error)?.contains(id))
    }
}

fn lock_error<T>(error: std::sync::PoisonError<T>) -> InfraError {
    InfraError::StateLock(format!("remote store: {error}"))
}

fn child_id_of(row: &RemoteRow) -> Option<&str> {
    match row {
        RemoteRow::Child(_) => None,
        RemoteRow::Task(row) => Some(&row.child_id),
        RemoteRow::Reward(row) => Some(&row.child_id),
        RemoteRow::Redemption(row) => Some(&row.child_id),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn exists(&self, table: RemoteTable, id: &str) -> Result<bool, InfraError> {
        self.begin(StoreCall::Exists)?;
        let tables = self.tables.lock().map_err(lock_error)?;
        Ok(tables.get(&table).is_some_and(|rows| rows.contains_key(id)))
    }

    async fn insert(&self, row: &RemoteRow) -> Result<(), InfraError> {
        self.begin(StoreCall::Insert)?;
        if self.is_rejected(row.id())? {
            return Err(InfraError::RemoteStatus {
                status: 400,
                message: format!("row {} violates a check constraint", row.id()),
            });
        }
        if self.insert_row(row)? {
            Ok(())
        } else {
            Err(InfraError::Duplicate {
                table: row.table().as_str().to_string(),
                id: row.id().to_string(),
            })
        }
    }

    async fn update(&self, row: &RemoteRow) -> Result<(), InfraError> {
        self.begin(StoreCall::Update)?;
        let mut tables = self.tables.lock().map_err(lock_error)?;
        if let Some(existing) = tables
            .get_mut(&row.table())
            .and_then(|rows| rows.get_mut(row.id()))
        {
            let mut updated = row.clone();
            // Omitted columns keep their stored value, as a PATCH does.
            if let (RemoteRow::Child(next), RemoteRow::Child(current)) = (&mut updated, &*existing) {
                if next.is_active.is_none() {
                    next.is_active = current.is_active;
                }
            }
            *existing = updated;
        }
        Ok(())
    }

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), InfraError> {
        self.begin(StoreCall::Delete)?;
        let mut tables = self.tables.lock().map_err(lock_error)?;
        let removed = tables.get_mut(&table).and_then(|rows| rows.remove(id));
        if table == RemoteTable::Children && removed.is_some() {
            for dependent in [
                RemoteTable::Tasks,
                RemoteTable::Rewards,
                RemoteTable::RedemptionHistory,
            ] {
                if let Some(rows) = tables.get_mut(&dependent) {
                    rows.retain(|_, row| child_id_of(row) != Some(id));
                }
            }
        }
        Ok(())
    }

    async fn insert_ignoring_duplicates(
        &self,
        table: RemoteTable,
        rows: &[RemoteRow],
    ) -> Result<Vec<String>, InfraError> {
        self.begin(StoreCall::InsertBatch)?;
        if self.reject_batches.load(Ordering::SeqCst) {
            return Err(InfraError::RemoteStatus {
                status: 400,
                message: format!("batch insert into {} rejected", table.as_str()),
            });
        }
        for row in rows {
            if row.table() != table || self.is_rejected(row.id())? {
                return Err(InfraError::RemoteStatus {
                    status: 400,
                    message: format!("row {} rejected in batch", row.id()),
                });
            }
        }
        let mut inserted = Vec::new();
        for row in rows {
            if self.insert_row(row)? {
                inserted.push(row.id().to_string());
            }
        }
        Ok(inserted)
    }

    async fn fetch_family(&self, family_id: &str) -> Result<FamilyRows, InfraError> {
        self.begin(StoreCall::FetchFamily)?;
        let tables = self.tables.lock().map_err(lock_error)?;
        let mut family = FamilyRows::default();
        let mut child_ids = HashSet::new();

        for row in tables.get(&RemoteTable::Children).into_iter().flat_map(|rows| rows.values()) {
            if let RemoteRow::Child(child) = row {
                if child.family_id == family_id {
                    child_ids.insert(child.id.clone());
                    family.children.push(child.clone());
                }
            }
        }

        let belongs = |row: &RemoteRow| child_id_of(row).is_some_and(|id| child_ids.contains(id));
        for table in [
            RemoteTable::Tasks,
            RemoteTable::Rewards,
            RemoteTable::RedemptionHistory,
        ] {
            for row in tables.get(&table).into_iter().flat_map(|rows| rows.values()) {
                if !belongs(row) {
                    continue;
                }
                match row {
                    RemoteRow::Task(task) => family.tasks.push(task.clone()),
                    RemoteRow::Reward(reward) => family.rewards.push(reward.clone()),
                    RemoteRow::Redemption(record) => family.redemptions.push(record.clone()),
                    RemoteRow::Child(_) => {}
                }
            }
        }
        Ok(family)
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, InfraError> {
        self.begin(StoreCall::FetchProfile)?;
        let profiles = self.profiles.lock().map_err(lock_error)?;
        Ok(profiles.get(user_id).cloned())
    }
}
