use crate::NowProvider;
use crate::application::family_store::FamilyStore;
use crate::domain::models::{
    Child, EntityKind, FamilySnapshot, PendingPush, PushOp, RedemptionRecord, Reward, Task,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_rows::{
    FamilyGraph, RemoteRow, RemoteTable, assemble_family, encode_child, encode_redemption,
    encode_reward, encode_task,
};
use crate::infrastructure::remote_store::{ProfileRow, RemoteStore};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    Updated,
    AlreadyPresent,
    Deleted,
    /// Created too recently to push on a sweep; left for the next pass.
    SkippedTooNew,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub id: String,
    pub message: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub table: RemoteTable,
    pub inserted: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<RowFailure>,
}

impl BatchReport {
    fn empty(table: RemoteTable) -> Self {
        Self {
            table,
            inserted: Vec::new(),
            already_present: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn has_transient_failures(&self) -> bool {
        self.failed.iter().any(|failure| failure.transient)
    }
}

/// Result of pushing a list of pending or swept entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub synced: usize,
    pub dropped: usize,
    pub remaining: Vec<PendingPush>,
    pub errors: Vec<String>,
}

/// Pushes local changes to the remote store and pulls the family graph back.
/// Every push is an idempotent upsert or delete; transient failures are
/// retried with exponential backoff before surfacing.
pub struct Reconciler<R>
where
    R: RemoteStore + ?Sized,
{
    remote: Arc<R>,
    retry_policy: RetryPolicy,
    guard_window: Duration,
    now_provider: NowProvider,
}

impl<R> Reconciler<R>
where
    R: RemoteStore + ?Sized,
{
    pub fn new(remote: Arc<R>) -> Self {
        Self {
            remote,
            retry_policy: RetryPolicy::default(),
            guard_window: Duration::from_secs(3),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_guard_window(mut self, guard_window: Duration) -> Self {
        self.guard_window = guard_window;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub async fn push_child(&self, family_id: &str, child: &Child) -> Result<PushOutcome, InfraError> {
        self.upsert(RemoteRow::Child(encode_child(child, family_id))).await
    }

    pub async fn push_task(&self, child_id: &str, task: &Task) -> Result<PushOutcome, InfraError> {
        self.upsert(RemoteRow::Task(encode_task(task, child_id))).await
    }

    pub async fn push_reward(&self, child_id: &str, reward: &Reward) -> Result<PushOutcome, InfraError> {
        self.upsert(RemoteRow::Reward(encode_reward(reward, child_id))).await
    }

    pub async fn delete_child(&self, child_id: &str) -> Result<PushOutcome, InfraError> {
        self.delete(RemoteTable::Children, child_id).await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<PushOutcome, InfraError> {
        self.delete(RemoteTable::Tasks, task_id).await
    }

    pub async fn delete_reward(&self, reward_id: &str) -> Result<PushOutcome, InfraError> {
        self.delete(RemoteTable::Rewards, reward_id).await
    }

    /// Writes the history row once, then the child's new balance.
    pub async fn record_redemption(
        &self,
        family_id: &str,
        child: &Child,
        record: &RedemptionRecord,
    ) -> Result<PushOutcome, InfraError> {
        let row = RemoteRow::Redemption(encode_redemption(record, &child.id)?);
        let outcome = self.insert_if_absent(&row).await?;
        self.push_child(family_id, child).await?;
        Ok(outcome)
    }

    /// Inserts the child only when the store does not know it yet.
    pub async fn push_child_if_absent(
        &self,
        family_id: &str,
        child: &Child,
    ) -> Result<PushOutcome, InfraError> {
        self.insert_if_absent(&RemoteRow::Child(encode_child(child, family_id)))
            .await
    }

    /// One multi-row insert with duplicate rows ignored. When the store
    /// refuses the whole batch, rows are retried one by one so a single bad
    /// row cannot sink the rest.
    pub async fn insert_batch(&self, table: RemoteTable, rows: Vec<RemoteRow>) -> BatchReport {
        let mut report = BatchReport::empty(table);
        if rows.is_empty() {
            return report;
        }

        match self
            .with_retry(|| self.remote.insert_ignoring_duplicates(table, &rows))
            .await
        {
            Ok(inserted) => {
                let inserted_ids = inserted.into_iter().collect::<HashSet<_>>();
                for row in &rows {
                    if inserted_ids.contains(row.id()) {
                        report.inserted.push(row.id().to_string());
                    } else {
                        report.already_present.push(row.id().to_string());
                    }
                }
            }
            Err(error) => {
                warn!(
                    "batch insert into {} rejected ({error}); falling back to single rows",
                    table.as_str()
                );
                for row in &rows {
                    match self.with_retry(|| self.remote.insert(row)).await {
                        Ok(()) => report.inserted.push(row.id().to_string()),
                        Err(InfraError::Duplicate { .. }) => {
                            report.already_present.push(row.id().to_string())
                        }
                        Err(error) => report.failed.push(RowFailure {
                            id: row.id().to_string(),
                            message: error.to_string(),
                            transient: error.is_transient(),
                        }),
                    }
                }
            }
        }
        debug!(
            "batch into {}: inserted={} already_present={} failed={}",
            table.as_str(),
            report.inserted.len(),
            report.already_present.len(),
            report.failed.len()
        );
        report
    }

    pub async fn fetch_family(&self, family_id: &str) -> Result<FamilyGraph, InfraError> {
        let rows = self.with_retry(|| self.remote.fetch_family(family_id)).await?;
        Ok(assemble_family(rows))
    }

    pub async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, InfraError> {
        self.with_retry(|| self.remote.fetch_profile(user_id)).await
    }

    /// Replays the retry ledger against the current local state. Entities
    /// deleted locally since they were queued are dropped; entities still
    /// inside the guard window and pushes that fail again stay queued.
    pub async fn flush_pending(
        &self,
        snapshot: &FamilySnapshot,
        pending: Vec<PendingPush>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(family_id) = snapshot.family_id() else {
            report.remaining = pending;
            return report;
        };

        for item in pending {
            match self.replay(family_id, snapshot, &item, true).await {
                Ok(Some(PushOutcome::SkippedTooNew)) => report.remaining.push(item),
                Ok(Some(_)) => report.synced += 1,
                Ok(None) => report.dropped += 1,
                Err(error) => {
                    report.errors.push(format!("{}: {error}", item.entity_id));
                    report.remaining.push(item);
                }
            }
        }
        report
    }

    /// Flushes the store's retry ledger against its current state and
    /// settles the ledger with the outcome.
    pub async fn flush_store(&self, store: &FamilyStore) -> Result<FlushReport, InfraError> {
        let snapshot = store.snapshot()?;
        if snapshot.pending_sync.is_empty() {
            return Ok(FlushReport::default());
        }
        let attempted = snapshot.pending_sync.clone();
        let report = self.flush_pending(&snapshot, attempted.clone()).await;
        store.settle_pending(&attempted, &report.remaining)?;
        Ok(report)
    }

    /// Pushes every local entity, skipping ones still inside the guard
    /// window. Skipped and failed entities come back as pending pushes.
    pub async fn push_family(&self, family_id: &str, children: &[Child]) -> FlushReport {
        let mut report = FlushReport::default();
        for child in children {
            let mut items = vec![PendingPush {
                kind: EntityKind::Child,
                op: PushOp::Upsert,
                entity_id: child.id.clone(),
                child_id: None,
            }];
            items.extend(child.tasks.iter().map(|task| PendingPush {
                kind: EntityKind::Task,
                op: PushOp::Upsert,
                entity_id: task.id.clone(),
                child_id: Some(child.id.clone()),
            }));
            items.extend(child.rewards.iter().map(|reward| PendingPush {
                kind: EntityKind::Reward,
                op: PushOp::Upsert,
                entity_id: reward.id.clone(),
                child_id: Some(child.id.clone()),
            }));

            let scoped = FamilySnapshot {
                children: vec![child.clone()],
                ..FamilySnapshot::default()
            };
            for item in items {
                match self.replay(family_id, &scoped, &item, true).await {
                    Ok(Some(PushOutcome::SkippedTooNew)) => report.remaining.push(item),
                    Ok(Some(_)) => report.synced += 1,
                    Ok(None) => report.dropped += 1,
                    Err(error) => {
                        report.errors.push(format!("{}: {error}", item.entity_id));
                        report.remaining.push(item);
                    }
                }
            }
        }
        report
    }

    /// Pushes one entity as it stands in `snapshot`, ignoring the guard
    /// window. `None` means the entity no longer exists locally.
    pub async fn push_now(
        &self,
        family_id: &str,
        snapshot: &FamilySnapshot,
        item: &PendingPush,
    ) -> Result<Option<PushOutcome>, InfraError> {
        self.replay(family_id, snapshot, item, false).await
    }

    async fn replay(
        &self,
        family_id: &str,
        snapshot: &FamilySnapshot,
        item: &PendingPush,
        guarded: bool,
    ) -> Result<Option<PushOutcome>, InfraError> {
        if item.op == PushOp::Delete {
            let table = match item.kind {
                EntityKind::Child => RemoteTable::Children,
                EntityKind::Task => RemoteTable::Tasks,
                EntityKind::Reward => RemoteTable::Rewards,
                EntityKind::Redemption => RemoteTable::RedemptionHistory,
            };
            return self.delete(table, &item.entity_id).await.map(Some);
        }

        let owner = match item.kind {
            EntityKind::Child => snapshot.child(&item.entity_id),
            _ => item.child_id.as_deref().and_then(|id| snapshot.child(id)),
        };
        let Some(child) = owner else {
            return Ok(None);
        };

        match item.kind {
            EntityKind::Child => {
                if guarded && self.is_too_new(child.created_at_epoch_ms) {
                    return Ok(Some(PushOutcome::SkippedTooNew));
                }
                self.push_child(family_id, child).await.map(Some)
            }
            EntityKind::Task => {
                let Some(task) = child.task(&item.entity_id) else {
                    return Ok(None);
                };
                if guarded && self.is_too_new(task.created_at_epoch_ms) {
                    return Ok(Some(PushOutcome::SkippedTooNew));
                }
                self.push_task(&child.id, task).await.map(Some)
            }
            EntityKind::Reward => {
                let Some(reward) = child.reward(&item.entity_id) else {
                    return Ok(None);
                };
                if guarded && self.is_too_new(reward.created_at_epoch_ms) {
                    return Ok(Some(PushOutcome::SkippedTooNew));
                }
                self.push_reward(&child.id, reward).await.map(Some)
            }
            EntityKind::Redemption => {
                let Some(record) = child
                    .redemption_history
                    .iter()
                    .find(|record| record.id == item.entity_id)
                else {
                    return Ok(None);
                };
                self.record_redemption(family_id, child, record).await.map(Some)
            }
        }
    }

    fn is_too_new(&self, created_at_epoch_ms: Option<i64>) -> bool {
        let Some(created_at) = created_at_epoch_ms else {
            return false;
        };
        let window_ms = i64::try_from(self.guard_window.as_millis()).unwrap_or(i64::MAX);
        let now_ms = (self.now_provider)().timestamp_millis();
        now_ms.saturating_sub(created_at) < window_ms
    }

    async fn upsert(&self, row: RemoteRow) -> Result<PushOutcome, InfraError> {
        let exists = self
            .with_retry(|| self.remote.exists(row.table(), row.id()))
            .await?;
        if exists {
            self.with_retry(|| self.remote.update(&row)).await?;
            return Ok(PushOutcome::Updated);
        }

        match self.with_retry(|| self.remote.insert(&row)).await {
            Ok(()) => Ok(PushOutcome::Inserted),
            Err(InfraError::Duplicate { .. }) => {
                debug!("{} {} appeared concurrently; updating", row.table().as_str(), row.id());
                self.with_retry(|| self.remote.update(&row)).await?;
                Ok(PushOutcome::Updated)
            }
            Err(error) => Err(error),
        }
    }

    async fn insert_if_absent(&self, row: &RemoteRow) -> Result<PushOutcome, InfraError> {
        let exists = self
            .with_retry(|| self.remote.exists(row.table(), row.id()))
            .await?;
        if exists {
            return Ok(PushOutcome::AlreadyPresent);
        }
        match self.with_retry(|| self.remote.insert(row)).await {
            Ok(()) => Ok(PushOutcome::Inserted),
            Err(InfraError::Duplicate { .. }) => Ok(PushOutcome::AlreadyPresent),
            Err(error) => Err(error),
        }
    }

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<PushOutcome, InfraError> {
        self.with_retry(|| self.remote.delete(table, id)).await?;
        Ok(PushOutcome::Deleted)
    }

    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, InfraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    debug!("transient remote failure ({error}); retrying in {delay}ms");
                    sleep(Duration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{TaskStatus, tests::sample_task};
    use crate::infrastructure::remote_rows::{ChildRow, TaskRow};
    use crate::infrastructure::remote_store::{InMemoryRemoteStore, StoreCall};
    use chrono::{DateTime, TimeZone};
    use proptest::prelude::*;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 16, 7, 0, 0)
            .single()
            .expect("valid datetime")
    }

    fn child(id: &str) -> Child {
        Child {
            id: id.to_string(),
            name: "Mia".to_string(),
            avatar_ref: String::new(),
            level: 1,
            star_balance: 40,
            active: true,
            tasks: Vec::new(),
            rewards: Vec::new(),
            redemption_history: Vec::new(),
            created_at_epoch_ms: None,
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            ..sample_task()
        }
    }

    fn task_row(id: &str, child_id: &str) -> RemoteRow {
        RemoteRow::Task(encode_task(&task(id), child_id))
    }

    fn reconciler(store: &Arc<InMemoryRemoteStore>) -> Reconciler<InMemoryRemoteStore> {
        Reconciler::new(Arc::clone(store))
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            })
            .with_now_provider(Arc::new(fixed_time))
    }

    #[tokio::test]
    async fn pushing_the_same_new_task_twice_yields_one_record() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let reconciler = reconciler(&store);
        let task = task("tsk-1");

        let first = reconciler.push_task("kid-1", &task).await.expect("first push");
        let second = reconciler.push_task("kid-1", &task).await.expect("second push");

        assert_eq!(first, PushOutcome::Inserted);
        assert_eq!(second, PushOutcome::Updated);
        assert_eq!(store.rows(RemoteTable::Tasks).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_on_insert_falls_back_to_update() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.fail_next(
            StoreCall::Insert,
            InfraError::Duplicate {
                table: "tasks".to_string(),
                id: "tsk-1".to_string(),
            },
        );
        let reconciler = reconciler(&store);

        let outcome = reconciler
            .push_task("kid-1", &task("tsk-1"))
            .await
            .expect("push");
        assert_eq!(outcome, PushOutcome::Updated);
        assert_eq!(store.call_count(StoreCall::Update), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.fail_next(StoreCall::Exists, InfraError::Network("reset".to_string()));
        store.fail_next(
            StoreCall::Insert,
            InfraError::RemoteStatus {
                status: 503,
                message: "unavailable".to_string(),
            },
        );
        let reconciler = reconciler(&store);

        let outcome = reconciler
            .push_task("kid-1", &task("tsk-1"))
            .await
            .expect("push after retry");
        assert_eq!(outcome, PushOutcome::Inserted);
        assert_eq!(store.call_count(StoreCall::Exists), 2);
        assert_eq!(store.call_count(StoreCall::Insert), 2);
    }

    #[tokio::test]
    async fn permanent_failures_surface_without_retry() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.fail_next(
            StoreCall::Exists,
            InfraError::RemoteStatus {
                status: 400,
                message: "bad filter".to_string(),
            },
        );
        let reconciler = reconciler(&store);

        assert!(reconciler.push_task("kid-1", &task("tsk-1")).await.is_err());
        assert_eq!(store.call_count(StoreCall::Exists), 1);
    }

    #[tokio::test]
    async fn deleting_missing_rows_succeeds() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let reconciler = reconciler(&store);
        assert_eq!(
            reconciler.delete_task("never-pushed").await.expect("delete"),
            PushOutcome::Deleted
        );
    }

    #[tokio::test]
    async fn batch_reports_present_rows_and_falls_back_per_row() {
        let store = Arc::new(InMemoryRemoteStore::new());
        store.seed(task_row("tsk-1", "kid-1"));
        let reconciler = reconciler(&store);

        let report = reconciler
            .insert_batch(
                RemoteTable::Tasks,
                vec![task_row("tsk-1", "kid-1"), task_row("tsk-2", "kid-1")],
            )
            .await;
        assert_eq!(report.inserted, vec!["tsk-2".to_string()]);
        assert_eq!(report.already_present, vec!["tsk-1".to_string()]);
        assert!(report.is_clean());

        store.reject_row("tsk-bad");
        let report = reconciler
            .insert_batch(
                RemoteTable::Tasks,
                vec![
                    task_row("tsk-2", "kid-1"),
                    task_row("tsk-bad", "kid-1"),
                    task_row("tsk-3", "kid-1"),
                ],
            )
            .await;
        assert_eq!(report.inserted, vec!["tsk-3".to_string()]);
        assert_eq!(report.already_present, vec!["tsk-2".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "tsk-bad");
    }

    #[tokio::test]
    async fn record_redemption_writes_history_once_and_balance() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let reconciler = reconciler(&store);
        let mut kid = child("kid-1");
        kid.star_balance = 10;
        let record = RedemptionRecord {
            id: "red-1".to_string(),
            reward_id: "rwd-1".to_string(),
            reward_title: "Movie night".to_string(),
            cost: 30,
            timestamp_epoch_ms: fixed_time().timestamp_millis(),
            note: None,
        };

        assert_eq!(
            reconciler
                .record_redemption("fam-1", &kid, &record)
                .await
                .expect("record"),
            PushOutcome::Inserted
        );
        assert_eq!(
            reconciler
                .record_redemption("fam-1", &kid, &record)
                .await
                .expect("record again"),
            PushOutcome::AlreadyPresent
        );
        assert_eq!(store.rows(RemoteTable::RedemptionHistory).len(), 1);
        match store.row(RemoteTable::Children, "kid-1") {
            Some(RemoteRow::Child(ChildRow { stars, .. })) => assert_eq!(stars, 10),
            other => panic!("expected child row, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_skips_entities_inside_guard_window() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let reconciler = reconciler(&store).with_guard_window(Duration::from_secs(3));

        let mut kid = child("kid-1");
        let mut fresh = task("tsk-fresh");
        fresh.created_at_epoch_ms = Some(fixed_time().timestamp_millis() - 1_000);
        let mut settled = task("tsk-settled");
        settled.created_at_epoch_ms = Some(fixed_time().timestamp_millis() - 10_000);
        kid.tasks = vec![fresh, settled];

        let snapshot = FamilySnapshot {
            current_user: Some(crate::domain::models::CurrentUser {
                id: "user-1".to_string(),
                display_name: String::new(),
                family_id: Some("fam-1".to_string()),
            }),
            children: vec![kid],
            ..FamilySnapshot::default()
        };
        let pending = ["tsk-fresh", "tsk-settled", "tsk-deleted"]
            .into_iter()
            .map(|id| PendingPush {
                kind: EntityKind::Task,
                op: PushOp::Upsert,
                entity_id: id.to_string(),
                child_id: Some("kid-1".to_string()),
            })
            .collect::<Vec<_>>();

        let report = reconciler.flush_pending(&snapshot, pending).await;
        assert_eq!(report.synced, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.remaining.len(), 1);
        assert_eq!(report.remaining[0].entity_id, "tsk-fresh");
        assert!(store.row(RemoteTable::Tasks, "tsk-settled").is_some());
        assert!(store.row(RemoteTable::Tasks, "tsk-fresh").is_none());
    }

    #[tokio::test]
    async fn fetch_family_assembles_graph() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let reconciler = reconciler(&store);
        reconciler.push_child("fam-1", &child("kid-1")).await.expect("push child");
        let mut done = task("tsk-1");
        done.status = TaskStatus::Done;
        reconciler.push_task("kid-1", &done).await.expect("push task");
        store.seed(RemoteRow::Task(TaskRow {
            status: "exploded".to_string(),
            ..encode_task(&task("tsk-bad"), "kid-1")
        }));

        let graph = reconciler.fetch_family("fam-1").await.expect("fetch");
        assert_eq!(graph.children.len(), 1);
        assert_eq!(graph.children[0].tasks.len(), 1);
        assert_eq!(graph.children[0].tasks[0].status, TaskStatus::Done);
        assert_eq!(graph.skipped, vec!["tsk-bad".to_string()]);
    }

    fn id_pattern() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,12}".prop_map(|value| format!("tsk-{value}"))
    }

    proptest! {
        #[test]
        fn repeated_pushes_never_duplicate(ids in proptest::collection::vec(id_pattern(), 1..8), repeats in 1usize..4) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let store = Arc::new(InMemoryRemoteStore::new());
                let reconciler = reconciler(&store);
                for _ in 0..repeats {
                    for id in &ids {
                        reconciler.push_task("kid-1", &task(id)).await.expect("push");
                    }
                }
                let unique = ids.iter().collect::<HashSet<_>>();
                assert_eq!(store.rows(RemoteTable::Tasks).len(), unique.len());
            });
        }
    }
}
