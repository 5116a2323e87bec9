use crate::application::family_store::FamilyStore;
use crate::application::reconciler::Reconciler;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::realtime_client::{
    RealtimeSubscription, RealtimeTransport, WATCHED_TABLES,
};
use crate::infrastructure::remote_store::RemoteStore;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Receives "something changed" for the subscribed family.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn on_change(&self) -> Result<(), InfraError>;
}

/// Re-reads the whole family graph and supersedes local children with it.
pub struct FamilyRefetchSink<R>
where
    R: RemoteStore + ?Sized,
{
    reconciler: Arc<Reconciler<R>>,
    store: Arc<FamilyStore>,
    family_id: String,
}

impl<R> FamilyRefetchSink<R>
where
    R: RemoteStore + ?Sized,
{
    pub fn new(reconciler: Arc<Reconciler<R>>, store: Arc<FamilyStore>, family_id: &str) -> Self {
        Self {
            reconciler,
            store,
            family_id: family_id.to_string(),
        }
    }

    fn is_current(&self) -> Result<bool, InfraError> {
        Ok(self.store.family_id()?.as_deref() == Some(self.family_id.as_str()))
    }
}

#[async_trait]
impl<R> ChangeSink for FamilyRefetchSink<R>
where
    R: RemoteStore + ?Sized,
{
    async fn on_change(&self) -> Result<(), InfraError> {
        if !self.is_current()? {
            debug!("ignoring change for stale family {}", self.family_id);
            return Ok(());
        }
        let flushed = self.reconciler.flush_store(&self.store).await?;
        if !flushed.remaining.is_empty() {
            debug!("{} queued pushes stay local across refetch", flushed.remaining.len());
        }

        let graph = self.reconciler.fetch_family(&self.family_id).await?;
        // The session may have ended while the fetch was in flight.
        if !self.is_current()? {
            debug!("dropping refetch for stale family {}", self.family_id);
            return Ok(());
        }
        if !graph.skipped.is_empty() {
            warn!("refetch skipped {} malformed rows", graph.skipped.len());
        }
        self.store.replace_children(graph.children)?;
        Ok(())
    }
}

struct ActiveChannel {
    family_id: String,
    task: JoinHandle<()>,
}

/// Holds at most one family subscription and forwards coalesced
/// notifications to the sink.
pub struct RealtimeListener<T>
where
    T: RealtimeTransport + ?Sized,
{
    transport: Arc<T>,
    coalesce_window: Duration,
    active: Mutex<Option<ActiveChannel>>,
}

impl<T> RealtimeListener<T>
where
    T: RealtimeTransport + ?Sized,
{
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            coalesce_window: Duration::from_millis(250),
            active: Mutex::new(None),
        }
    }

    pub fn with_coalesce_window(mut self, coalesce_window: Duration) -> Self {
        self.coalesce_window = coalesce_window;
        self
    }

    /// Subscribes to the family channel. Returns `false` when already
    /// subscribed to the same family; a different family replaces the old
    /// subscription. Must run inside a tokio runtime.
    pub fn subscribe(
        &self,
        family_id: &str,
        sink: Arc<dyn ChangeSink>,
    ) -> Result<bool, InfraError> {
        let family_id = family_id.trim();
        if family_id.is_empty() {
            return Err(InfraError::Realtime("family id must not be empty".to_string()));
        }

        let mut active = self.lock()?;
        if let Some(channel) = active.as_ref() {
            if channel.family_id == family_id && !channel.task.is_finished() {
                return Ok(false);
            }
        }
        if let Some(previous) = active.take() {
            info!("switching realtime channel from {} to {family_id}", previous.family_id);
            previous.task.abort();
        }

        let subscription = self.transport.subscribe(family_id)?;
        let task = tokio::spawn(listen(subscription, sink, self.coalesce_window));
        *active = Some(ActiveChannel {
            family_id: family_id.to_string(),
            task,
        });
        Ok(true)
    }

    pub fn subscribed_family(&self) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|active| active.as_ref().map(|channel| channel.family_id.clone()))
    }

    /// Stops the subscription; no sink call starts after this returns.
    pub fn teardown(&self) {
        let Ok(mut active) = self.lock() else {
            return;
        };
        if let Some(channel) = active.take() {
            debug!("tearing down realtime channel for {}", channel.family_id);
            channel.task.abort();
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<ActiveChannel>>, InfraError> {
        self.active
            .lock()
            .map_err(|error| InfraError::StateLock(format!("listener: {error}")))
    }
}

impl<T> Drop for RealtimeListener<T>
where
    T: RealtimeTransport + ?Sized,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn listen(
    mut subscription: RealtimeSubscription,
    sink: Arc<dyn ChangeSink>,
    coalesce_window: Duration,
) {
    while let Some(change) = subscription.receiver.recv().await {
        if !WATCHED_TABLES.contains(&change.table) {
            continue;
        }
        sleep(coalesce_window).await;
        let mut burst = 1usize;
        while subscription.receiver.try_recv().is_ok() {
            burst += 1;
        }
        debug!(
            "{:?} on {} ({burst} coalesced); refetching",
            change.kind,
            change.table.as_str()
        );
        if let Err(error) = sink.on_change().await {
            warn!("realtime refetch failed: {error}");
        }
    }
    debug!("realtime subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::family_store::TaskDraft;
    use crate::application::reconciler::RetryPolicy;
    use crate::domain::models::{Child, CurrentUser, EntityKind, PendingPush, PushOp};
    use crate::infrastructure::local_cache::InMemoryLocalCacheStore;
    use crate::infrastructure::realtime_client::{
        ChangeKind, ChangeNotification, InMemoryRealtimeTransport,
    };
    use crate::infrastructure::remote_rows::{RemoteRow, RemoteTable, encode_child};
    use crate::infrastructure::remote_store::{InMemoryRemoteStore, StoreCall};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeSink for CountingSink {
        async fn on_change(&self) -> Result<(), InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn change(table: RemoteTable) -> ChangeNotification {
        ChangeNotification {
            table,
            kind: ChangeKind::Update,
        }
    }

    fn listener(transport: &Arc<InMemoryRealtimeTransport>) -> RealtimeListener<InMemoryRealtimeTransport> {
        RealtimeListener::new(Arc::clone(transport)).with_coalesce_window(Duration::from_millis(20))
    }

    async fn settle() {
        sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn burst_of_changes_triggers_one_refetch() {
        let transport = Arc::new(InMemoryRealtimeTransport::new());
        let sink = Arc::new(CountingSink::default());
        let listener = listener(&transport);

        assert!(listener.subscribe("fam-1", sink.clone()).expect("subscribe"));
        for table in [RemoteTable::Children, RemoteTable::Tasks, RemoteTable::Tasks, RemoteTable::Rewards] {
            assert_eq!(transport.emit("fam-1", change(table)), 1);
        }
        settle().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        transport.emit("fam-1", change(RemoteTable::Profiles));
        settle().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn same_family_is_not_resubscribed_and_new_family_replaces_old() {
        let transport = Arc::new(InMemoryRealtimeTransport::new());
        let sink = Arc::new(CountingSink::default());
        let listener = listener(&transport);

        assert!(listener.subscribe("fam-1", sink.clone()).expect("subscribe"));
        assert!(!listener.subscribe("fam-1", sink.clone()).expect("subscribe again"));
        assert_eq!(transport.subscribed_families(), vec!["fam-1".to_string()]);

        assert!(listener.subscribe("fam-2", sink.clone()).expect("switch family"));
        settle().await;
        assert_eq!(transport.live_subscribers(), 1);
        assert_eq!(transport.emit("fam-1", change(RemoteTable::Tasks)), 0);
        assert_eq!(listener.subscribed_family().as_deref(), Some("fam-2"));
    }

    #[tokio::test]
    async fn teardown_stops_delivery() {
        let transport = Arc::new(InMemoryRealtimeTransport::new());
        let sink = Arc::new(CountingSink::default());
        let listener = listener(&transport);
        listener.subscribe("fam-1", sink.clone()).expect("subscribe");

        listener.teardown();
        settle().await;
        assert_eq!(transport.emit("fam-1", change(RemoteTable::Tasks)), 0);
        settle().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        assert_eq!(listener.subscribed_family(), None);
    }

    #[tokio::test]
    async fn refetch_sink_supersedes_local_children() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&remote)));
        let store = Arc::new(FamilyStore::load(Arc::new(InMemoryLocalCacheStore::default())));
        store
            .set_current_user(Some(CurrentUser {
                id: "user-1".to_string(),
                display_name: "Robin".to_string(),
                family_id: Some("fam-1".to_string()),
            }))
            .expect("set user");
        store.add_child("Local only", "").expect("add child");

        let remote_child = Child {
            id: "kid-remote".to_string(),
            name: "Mia".to_string(),
            avatar_ref: "fox".to_string(),
            level: 1,
            star_balance: 12,
            active: false,
            tasks: Vec::new(),
            rewards: Vec::new(),
            redemption_history: Vec::new(),
            created_at_epoch_ms: None,
        };
        remote.seed(RemoteRow::Child(encode_child(&remote_child, "fam-1")));

        let sink = FamilyRefetchSink::new(reconciler, Arc::clone(&store), "fam-1");
        sink.on_change().await.expect("refetch");

        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(snapshot.children[0].id, "kid-remote");
        assert!(snapshot.children[0].active);
    }

    #[tokio::test]
    async fn refetch_sink_ignores_stale_family() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&remote)));
        let store = Arc::new(FamilyStore::load(Arc::new(InMemoryLocalCacheStore::default())));
        store.add_child("Mia", "").expect("add child");

        let sink = FamilyRefetchSink::new(reconciler, Arc::clone(&store), "fam-1");
        sink.on_change().await.expect("refetch");
        assert_eq!(store.snapshot().expect("snapshot").children.len(), 1);
        assert_eq!(remote.call_count(StoreCall::FetchFamily), 0);
    }

    #[tokio::test]
    async fn refetch_sink_flushes_queue_and_keeps_what_still_fails() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let reconciler = Arc::new(
            Reconciler::new(Arc::clone(&remote))
                .with_guard_window(Duration::ZERO)
                .with_retry_policy(RetryPolicy {
                    max_attempts: 1,
                    base_delay_ms: 1,
                }),
        );
        let store = Arc::new(FamilyStore::load(Arc::new(InMemoryLocalCacheStore::default())));
        store
            .set_current_user(Some(CurrentUser {
                id: "user-1".to_string(),
                display_name: "Robin".to_string(),
                family_id: Some("fam-1".to_string()),
            }))
            .expect("set user");
        let child = store.add_child("Mia", "").expect("add child");
        reconciler.push_child("fam-1", &child).await.expect("push child");

        let draft = |title: &str| TaskDraft {
            title: title.to_string(),
            scheduled_time: "7:30 AM".to_string(),
            ..TaskDraft::default()
        };
        let stuck = store.add_task(&child.id, draft("Homework")).expect("add task");
        let flushed = store.add_task(&child.id, draft("Brush teeth")).expect("add task");
        let queued = |task_id: &str| PendingPush {
            kind: EntityKind::Task,
            op: PushOp::Upsert,
            entity_id: task_id.to_string(),
            child_id: Some(child.id.clone()),
        };
        store.record_pending(queued(&stuck.id)).expect("queue");
        store.record_pending(queued(&flushed.id)).expect("queue");
        remote.fail_next(StoreCall::Exists, InfraError::Network("offline".to_string()));

        let sink = FamilyRefetchSink::new(reconciler, Arc::clone(&store), "fam-1");
        sink.on_change().await.expect("refetch");

        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.children[0].tasks.len(), 2);
        assert_eq!(snapshot.pending_sync, vec![queued(&stuck.id)]);
        assert!(remote.row(RemoteTable::Tasks, &flushed.id).is_some());
        assert!(remote.row(RemoteTable::Tasks, &stuck.id).is_none());
    }
}
