use crate::NowProvider;
use crate::application::bootstrap::bootstrap_workspace;
use crate::application::family_store::{
    CompletionOutcome, FamilyStore, RedemptionOutcome, RewardDraft, TaskDraft, TaskUpdate,
};
use crate::application::migration::{MigrationOutcome, MigrationRunner};
use crate::application::realtime::{FamilyRefetchSink, RealtimeListener};
use crate::application::reconciler::{Reconciler, RetryPolicy};
use crate::application::ticker::{self, TickSnapshot, Ticker, spawn_ticker};
use crate::domain::lifecycle;
use crate::domain::models::{
    Child, CurrentUser, EntityKind, FamilySnapshot, PendingPush, Preferences, PushOp, Reward,
    Task, TaskStatus,
};
use crate::domain::time_format::{self, TimeFormat};
use crate::infrastructure::config::{Settings, SyncSettings};
use crate::infrastructure::credential_store::{KeyringSessionStore, Session, SessionStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_cache::{LocalCacheStore, SqliteLocalCacheStore};
use crate::infrastructure::migration_flag::{MigrationFlagStore, SqliteMigrationFlagStore};
use crate::infrastructure::realtime_client::{PhoenixRealtimeTransport, RealtimeTransport};
use crate::infrastructure::remote_rows::{RemoteRow, RemoteTable, encode_task};
use crate::infrastructure::remote_store::RemoteStore;
use crate::infrastructure::rest_client::{RequestTimeouts, ReqwestRemoteStore};
use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Clients for one signed-in session.
pub struct RemoteBackends {
    pub store: Arc<dyn RemoteStore>,
    pub transport: Option<Arc<dyn RealtimeTransport>>,
}

pub type RemoteConnector =
    Arc<dyn Fn(&Session) -> Result<RemoteBackends, InfraError> + Send + Sync>;

struct RemoteSession {
    user_id: String,
    family_id: String,
    reconciler: Arc<Reconciler<dyn RemoteStore>>,
    listener: Option<RealtimeListener<dyn RealtimeTransport>>,
}

impl RemoteSession {
    fn teardown(&self) {
        if let Some(listener) = &self.listener {
            listener.teardown();
        }
    }
}

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    settings: Settings,
    cache: Arc<dyn LocalCacheStore>,
    store: Arc<FamilyStore>,
    session_store: Arc<dyn SessionStore>,
    migration_flags: Arc<dyn MigrationFlagStore>,
    connector: Option<RemoteConnector>,
    now_provider: NowProvider,
    remote: Mutex<Option<Arc<RemoteSession>>>,
    ticker: Mutex<Option<Ticker>>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let settings = bootstrap.settings;
        let cache: Arc<dyn LocalCacheStore> =
            Arc::new(SqliteLocalCacheStore::new(&bootstrap.database_path));
        let store = FamilyStore::load(Arc::clone(&cache))
            .with_completion_credit(settings.app.completion_credit);
        if store.snapshot()?.last_updated_epoch_ms.is_none() {
            store.set_preferences(Preferences {
                time_format: settings.app.time_format,
                ..Preferences::default()
            })?;
        }
        let connector = settings
            .remote
            .is_configured()
            .then(|| default_connector(&settings));

        Ok(Self {
            config_dir: bootstrap.config_dir,
            migration_flags: Arc::new(SqliteMigrationFlagStore::new(&bootstrap.database_path)),
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            settings,
            cache,
            store: Arc::new(store),
            session_store: Arc::new(KeyringSessionStore::default()),
            connector,
            now_provider: Arc::new(Utc::now),
            remote: Mutex::new(None),
            ticker: Mutex::new(None),
            log_guard: Mutex::new(()),
        })
    }

    pub fn with_session_store(mut self, session_store: Arc<dyn SessionStore>) -> Self {
        self.session_store = session_store;
        self
    }

    pub fn with_remote_connector(mut self, connector: RemoteConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_sync_settings(mut self, sync: SyncSettings) -> Self {
        self.settings.sync = sync;
        self
    }

    /// Rebuilds the family store on the same cache so every timestamp comes
    /// from one clock.
    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.store = Arc::new(
            FamilyStore::load(Arc::clone(&self.cache))
                .with_now_provider(Arc::clone(&now_provider))
                .with_completion_credit(self.settings.app.completion_credit),
        );
        self.now_provider = now_provider;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn family_store(&self) -> Arc<FamilyStore> {
        Arc::clone(&self.store)
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }

    fn remote_session(&self) -> Result<Option<Arc<RemoteSession>>, InfraError> {
        Ok(lock_remote(self)?.clone())
    }

    fn build_reconciler(&self, store: Arc<dyn RemoteStore>) -> Reconciler<dyn RemoteStore> {
        let sync = &self.settings.sync;
        Reconciler::new(store)
            .with_retry_policy(RetryPolicy {
                max_attempts: sync.retry_max_attempts,
                base_delay_ms: sync.retry_base_delay_ms,
            })
            .with_guard_window(sync.guard_window)
            .with_now_provider(Arc::clone(&self.now_provider))
    }
}

fn lock_remote(state: &AppState) -> Result<MutexGuard<'_, Option<Arc<RemoteSession>>>, InfraError> {
    state
        .remote
        .lock()
        .map_err(|error| InfraError::StateLock(format!("remote session: {error}")))
}

fn default_connector(settings: &Settings) -> RemoteConnector {
    let remote = settings.remote.clone();
    let timeouts = RequestTimeouts {
        read: settings.sync.read_timeout,
        write: settings.sync.write_timeout,
    };
    Arc::new(move |session: &Session| {
        let rest_url = remote.rest_url.as_deref().ok_or_else(|| {
            InfraError::InvalidConfig("remote rest url is not configured".to_string())
        })?;
        let api_key = remote.api_key.as_deref().ok_or_else(|| {
            InfraError::InvalidConfig("remote api key is not configured".to_string())
        })?;
        let store = ReqwestRemoteStore::new(rest_url, api_key)?
            .with_access_token(session.access_token.clone())
            .with_timeouts(timeouts);
        let transport = match remote.realtime_url.as_deref() {
            Some(realtime_url) => {
                let transport = PhoenixRealtimeTransport::new(realtime_url, api_key)?
                    .with_access_token(session.access_token.clone());
                Some(Arc::new(transport) as Arc<dyn RealtimeTransport>)
            }
            None => None,
        };
        Ok(RemoteBackends {
            store: Arc::new(store),
            transport,
        })
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    /// No signed-in session; the change lives only in the local cache.
    LocalOnly,
    /// The push failed and was queued for retry.
    Deferred(String),
}

/// A local change plus what happened when pushing it. Remote failure never
/// rolls back `value`.
#[derive(Debug, Clone, Serialize)]
pub struct MutationResult<T> {
    pub value: T,
    pub sync: SyncStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedLine {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportTasksResponse {
    pub created: Vec<Task>,
    pub rejected: Vec<RejectedLine>,
    pub sync: SyncStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TodayTaskView {
    pub task: Task,
    pub due: bool,
    pub remaining_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TodayResponse {
    pub child_id: String,
    pub date: String,
    pub minute_of_day: u16,
    pub tasks: Vec<TodayTaskView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushPendingResponse {
    pub synced: usize,
    pub dropped: usize,
    pub remaining: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachSessionResponse {
    pub user_id: String,
    pub family_id: String,
    pub migration: String,
    pub children: usize,
    pub subscribed: bool,
}

fn upsert(kind: EntityKind, entity_id: &str, child_id: Option<&str>) -> PendingPush {
    PendingPush {
        kind,
        op: PushOp::Upsert,
        entity_id: entity_id.to_string(),
        child_id: child_id.map(ToOwned::to_owned),
    }
}

fn removal(kind: EntityKind, entity_id: &str, child_id: &str) -> PendingPush {
    PendingPush {
        kind,
        op: PushOp::Delete,
        entity_id: entity_id.to_string(),
        child_id: Some(child_id.to_string()),
    }
}

/// Pushes the entities a mutation touched. Failures are queued in the
/// pending ledger; after a clean push the ledger gets a best-effort flush.
async fn push_items(
    state: &AppState,
    command: &str,
    items: Vec<PendingPush>,
) -> Result<SyncStatus, InfraError> {
    let Some(remote) = state.remote_session()? else {
        queue_offline(state, items)?;
        return Ok(SyncStatus::LocalOnly);
    };

    let snapshot = state.store.snapshot()?;
    let mut deferred = None;
    for item in items {
        if let Err(error) = remote
            .reconciler
            .push_now(&remote.family_id, &snapshot, &item)
            .await
        {
            state.log_error(
                command,
                &format!("deferred push of {}: {error}", item.entity_id),
            );
            state.store.record_pending(item)?;
            deferred.get_or_insert_with(|| error.to_string());
        }
    }
    if let Some(reason) = deferred {
        return Ok(SyncStatus::Deferred(reason));
    }

    let report = remote.reconciler.flush_store(&state.store).await?;
    if report.synced > 0 {
        state.log_info(command, &format!("flushed {} pending pushes", report.synced));
    }
    Ok(SyncStatus::Synced)
}

/// Signed out after the family was seeded remotely: edits go to the pending
/// ledger so the next sign-in pushes them before re-fetching. Before the
/// first sign-in the migration uploads local data instead.
fn queue_offline(state: &AppState, items: Vec<PendingPush>) -> Result<(), InfraError> {
    if !state.migration_flags.is_completed()? {
        return Ok(());
    }
    for item in items {
        state.store.record_pending(item)?;
    }
    Ok(())
}

pub fn get_family_impl(state: &AppState) -> Result<FamilySnapshot, InfraError> {
    state.store.snapshot()
}

pub async fn add_child_impl(
    state: &AppState,
    name: String,
    avatar_ref: Option<String>,
) -> Result<MutationResult<Child>, InfraError> {
    let child = state
        .store
        .add_child(&name, avatar_ref.as_deref().unwrap_or_default())?;
    state.log_info("add_child", &format!("created child_id={}", child.id));

    let sync = push_items(state, "add_child", vec![upsert(EntityKind::Child, &child.id, None)]).await?;
    Ok(MutationResult { value: child, sync })
}

/// The active child is a per-device selection and is not pushed.
pub fn switch_active_child_impl(state: &AppState, child_id: String) -> Result<Child, InfraError> {
    let child = state.store.switch_active_child(child_id.trim())?;
    state.log_info("switch_active_child", &format!("active child_id={}", child.id));
    Ok(child)
}

pub fn set_time_format_impl(state: &AppState, time_format: String) -> Result<Preferences, InfraError> {
    let mode = match time_format.trim() {
        "12h" => TimeFormat::TwelveHour,
        "24h" => TimeFormat::TwentyFourHour,
        other => {
            return Err(InfraError::InvalidConfig(format!(
                "time format must be 12h or 24h, got {other}"
            )));
        }
    };
    let preferences = Preferences {
        time_format: mode,
        ..state.store.snapshot()?.preferences
    };
    state.store.set_preferences(preferences.clone())?;
    state.log_info("set_time_format", &format!("time format={}", time_format.trim()));
    Ok(preferences)
}

pub async fn create_task_impl(
    state: &AppState,
    child_id: Option<String>,
    draft: TaskDraft,
) -> Result<MutationResult<Task>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let task = state.store.add_task(&child_id, draft)?;
    state.log_info("create_task", &format!("created task_id={} child_id={child_id}", task.id));

    let sync = push_items(
        state,
        "create_task",
        vec![upsert(EntityKind::Task, &task.id, Some(&child_id))],
    )
    .await?;
    Ok(MutationResult { value: task, sync })
}

pub async fn update_task_impl(
    state: &AppState,
    child_id: Option<String>,
    task_id: String,
    update: TaskUpdate,
) -> Result<MutationResult<Task>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let task = state.store.update_task(&child_id, task_id.trim(), update)?;
    state.log_info("update_task", &format!("updated task_id={}", task.id));

    let sync = push_items(
        state,
        "update_task",
        vec![upsert(EntityKind::Task, &task.id, Some(&child_id))],
    )
    .await?;
    Ok(MutationResult { value: task, sync })
}

pub async fn delete_task_impl(
    state: &AppState,
    child_id: Option<String>,
    task_id: String,
) -> Result<MutationResult<Task>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let task = state.store.delete_task(&child_id, task_id.trim())?;
    state.log_info("delete_task", &format!("deleted task_id={}", task.id));

    let sync = push_items(
        state,
        "delete_task",
        vec![removal(EntityKind::Task, &task.id, &child_id)],
    )
    .await?;
    Ok(MutationResult { value: task, sync })
}

pub async fn start_task_impl(
    state: &AppState,
    child_id: Option<String>,
    task_id: String,
) -> Result<MutationResult<Task>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let task = state.store.start_task(&child_id, task_id.trim())?;
    state.log_info("start_task", &format!("started task_id={}", task.id));

    let sync = push_items(
        state,
        "start_task",
        vec![upsert(EntityKind::Task, &task.id, Some(&child_id))],
    )
    .await?;
    Ok(MutationResult { value: task, sync })
}

pub async fn complete_task_impl(
    state: &AppState,
    child_id: Option<String>,
    task_id: String,
) -> Result<MutationResult<CompletionOutcome>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let outcome = state.store.complete_task(&child_id, task_id.trim())?;
    state.log_info(
        "complete_task",
        &format!(
            "completed task_id={} credited={}",
            outcome.task.id, outcome.credited_stars
        ),
    );

    let mut items = vec![upsert(EntityKind::Task, &outcome.task.id, Some(&child_id))];
    if outcome.credited_stars > 0 {
        items.push(upsert(EntityKind::Child, &child_id, None));
    }
    let sync = push_items(state, "complete_task", items).await?;
    Ok(MutationResult {
        value: outcome,
        sync,
    })
}

pub async fn reset_task_impl(
    state: &AppState,
    child_id: Option<String>,
    task_id: String,
) -> Result<MutationResult<Task>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let task = state.store.reset_task(&child_id, task_id.trim())?;
    state.log_info("reset_task", &format!("reset task_id={}", task.id));

    let sync = push_items(
        state,
        "reset_task",
        vec![upsert(EntityKind::Task, &task.id, Some(&child_id))],
    )
    .await?;
    Ok(MutationResult { value: task, sync })
}

pub async fn create_reward_impl(
    state: &AppState,
    child_id: Option<String>,
    draft: RewardDraft,
) -> Result<MutationResult<Reward>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let reward = state.store.add_reward(&child_id, draft)?;
    state.log_info("create_reward", &format!("created reward_id={}", reward.id));

    let sync = push_items(
        state,
        "create_reward",
        vec![upsert(EntityKind::Reward, &reward.id, Some(&child_id))],
    )
    .await?;
    Ok(MutationResult { value: reward, sync })
}

pub async fn delete_reward_impl(
    state: &AppState,
    child_id: Option<String>,
    reward_id: String,
) -> Result<MutationResult<Reward>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let reward = state.store.delete_reward(&child_id, reward_id.trim())?;
    state.log_info("delete_reward", &format!("deleted reward_id={}", reward.id));

    let sync = push_items(
        state,
        "delete_reward",
        vec![removal(EntityKind::Reward, &reward.id, &child_id)],
    )
    .await?;
    Ok(MutationResult { value: reward, sync })
}

pub async fn redeem_reward_impl(
    state: &AppState,
    child_id: Option<String>,
    reward_id: String,
    note: Option<String>,
) -> Result<MutationResult<RedemptionOutcome>, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let note = note
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let outcome = state.store.redeem_reward(&child_id, reward_id.trim(), note)?;
    state.log_info(
        "redeem_reward",
        &format!(
            "redeemed reward_id={} cost={} balance={}",
            outcome.record.reward_id, outcome.record.cost, outcome.star_balance
        ),
    );

    let sync = push_items(
        state,
        "redeem_reward",
        vec![upsert(EntityKind::Redemption, &outcome.record.id, Some(&child_id))],
    )
    .await?;
    Ok(MutationResult {
        value: outcome,
        sync,
    })
}

/// Imports pasted rows of `title, time, duration, points` (tab or comma
/// separated, optional header). Bad lines are reported and skipped; good
/// ones are created locally and sent as one batch.
pub async fn import_task_table_impl(
    state: &AppState,
    child_id: Option<String>,
    table: String,
) -> Result<ImportTasksResponse, InfraError> {
    let child_id = state.store.resolve_child_id(child_id.as_deref())?;
    let (drafts, rejected) = parse_task_table(&table);
    if drafts.is_empty() {
        let sync = match state.remote_session()? {
            Some(_) => SyncStatus::Synced,
            None => SyncStatus::LocalOnly,
        };
        return Ok(ImportTasksResponse {
            created: Vec::new(),
            rejected,
            sync,
        });
    }

    let created = state.store.add_tasks(&child_id, drafts)?;
    state.log_info(
        "import_task_table",
        &format!("imported {} tasks, rejected {} lines", created.len(), rejected.len()),
    );

    let Some(remote) = state.remote_session()? else {
        queue_offline(
            state,
            created
                .iter()
                .map(|task| upsert(EntityKind::Task, &task.id, Some(&child_id)))
                .collect(),
        )?;
        return Ok(ImportTasksResponse {
            created,
            rejected,
            sync: SyncStatus::LocalOnly,
        });
    };
    let rows = created
        .iter()
        .map(|task| RemoteRow::Task(encode_task(task, &child_id)))
        .collect();
    let report = remote.reconciler.insert_batch(RemoteTable::Tasks, rows).await;
    for failure in &report.failed {
        state.log_error(
            "import_task_table",
            &format!("deferred push of {}: {}", failure.id, failure.message),
        );
        state
            .store
            .record_pending(upsert(EntityKind::Task, &failure.id, Some(&child_id)))?;
    }
    let sync = match report.failed.first() {
        Some(failure) => SyncStatus::Deferred(failure.message.clone()),
        None => SyncStatus::Synced,
    };
    Ok(ImportTasksResponse {
        created,
        rejected,
        sync,
    })
}

fn parse_task_table(table: &str) -> (Vec<TaskDraft>, Vec<RejectedLine>) {
    let mut drafts = Vec::new();
    let mut rejected = Vec::new();
    let mut seen_content = false;

    for (index, raw) in table.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let separator = if line.contains('\t') { '\t' } else { ',' };
        let fields = line.split(separator).map(str::trim).collect::<Vec<_>>();
        let is_header = !seen_content
            && fields
                .first()
                .is_some_and(|first| first.eq_ignore_ascii_case("title"));
        seen_content = true;
        if is_header {
            continue;
        }
        match parse_task_line(&fields) {
            Ok(draft) => drafts.push(draft),
            Err(reason) => rejected.push(RejectedLine {
                line: index + 1,
                reason,
            }),
        }
    }
    (drafts, rejected)
}

fn parse_task_line(fields: &[&str]) -> Result<TaskDraft, String> {
    let title = fields.first().copied().unwrap_or_default();
    if title.is_empty() {
        return Err("title must not be empty".to_string());
    }
    let time = fields.get(1).copied().unwrap_or_default();
    time_format::parse_time_input(time, "time").map_err(|error| error.to_string())?;

    let duration_minutes = match fields.get(2).copied().filter(|value| !value.is_empty()) {
        Some(value) => {
            let minutes = value
                .parse::<u32>()
                .map_err(|_| format!("duration '{value}' is not a whole number"))?;
            Some(time_format::parse_duration_input(minutes, "duration").map_err(|error| error.to_string())?)
        }
        None => None,
    };
    let reward_points = match fields.get(3).copied().filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse::<u32>()
            .map_err(|_| format!("points '{value}' is not a whole number"))?,
        None => 0,
    };

    Ok(TaskDraft {
        title: title.to_string(),
        scheduled_time: time.to_string(),
        duration_minutes,
        reward_points,
        ..TaskDraft::default()
    })
}

/// Today's tasks for a child in the configured timezone, with the due flag
/// and countdown computed for "now".
pub fn list_today_impl(state: &AppState, child_id: Option<String>) -> Result<TodayResponse, InfraError> {
    let child = state
        .store
        .child(&state.store.resolve_child_id(child_id.as_deref())?)?;
    let now = (state.now_provider)();
    let tz = state.settings.app.timezone;
    let date = now.with_timezone(&tz).date_naive();
    let minute_of_day = ticker::local_minute_of_day(now, tz);
    let now_ms = now.timestamp_millis();

    let tasks = ticker::tasks_for_day(&child, date)
        .into_iter()
        .map(|task| TodayTaskView {
            due: task.status == TaskStatus::Pending && lifecycle::is_due_at(&task, minute_of_day),
            remaining_ms: lifecycle::remaining_ms(&task, now_ms),
            task,
        })
        .collect();

    Ok(TodayResponse {
        child_id: child.id,
        date: date.to_string(),
        minute_of_day,
        tasks,
    })
}

/// Starts the background ticker once and returns its latest snapshot.
pub fn start_ticker_impl(state: &AppState) -> Result<TickSnapshot, InfraError> {
    let mut ticker = state
        .ticker
        .lock()
        .map_err(|error| InfraError::StateLock(format!("ticker: {error}")))?;
    let running = ticker.get_or_insert_with(|| {
        spawn_ticker(
            Arc::clone(&state.store),
            state.settings.app.timezone,
            state.settings.sync.tick_interval,
            Arc::clone(&state.now_provider),
        )
    });
    Ok(running.latest())
}

/// Flushes queued pushes, then supersedes local children with the remote
/// graph. Pushes that are still queued keep their local version. Without a
/// session this returns the local snapshot untouched.
pub async fn refresh_family_impl(state: &AppState) -> Result<FamilySnapshot, InfraError> {
    let Some(remote) = state.remote_session()? else {
        state.log_info("refresh_family", "local-only; nothing to refresh");
        return state.store.snapshot();
    };

    flush_logged(state, "refresh_family", &remote.reconciler).await;
    let graph = remote.reconciler.fetch_family(&remote.family_id).await?;
    let snapshot = state.store.replace_children(graph.children)?;
    state.log_info(
        "refresh_family",
        &format!(
            "refreshed family_id={} children={} skipped_rows={}",
            remote.family_id,
            snapshot.children.len(),
            graph.skipped.len()
        ),
    );
    Ok(snapshot)
}

async fn flush_logged(state: &AppState, command: &str, reconciler: &Reconciler<dyn RemoteStore>) {
    match reconciler.flush_store(&state.store).await {
        Ok(report) if !report.remaining.is_empty() => state.log_error(
            command,
            &format!(
                "synced={} still queued={}: {}",
                report.synced,
                report.remaining.len(),
                report.errors.join("; ")
            ),
        ),
        Ok(report) if report.synced > 0 => {
            state.log_info(command, &format!("flushed {} pending pushes", report.synced));
        }
        Ok(_) => {}
        Err(error) => state.log_error(command, &format!("pending flush failed: {error}")),
    }
}

pub async fn flush_pending_impl(state: &AppState) -> Result<FlushPendingResponse, InfraError> {
    let Some(remote) = state.remote_session()? else {
        let remaining = state.store.snapshot()?.pending_sync.len();
        return Ok(FlushPendingResponse {
            synced: 0,
            dropped: 0,
            remaining,
            errors: Vec::new(),
        });
    };

    let report = remote.reconciler.flush_store(&state.store).await?;
    state.log_info(
        "flush_pending",
        &format!(
            "synced={} dropped={} remaining={}",
            report.synced,
            report.dropped,
            report.remaining.len()
        ),
    );
    Ok(FlushPendingResponse {
        synced: report.synced,
        dropped: report.dropped,
        remaining: report.remaining.len(),
        errors: report.errors,
    })
}

/// Signs a guardian in: stores the session, resolves the family, migrates
/// pre-sign-in data once, re-fetches the family and subscribes to changes.
pub async fn attach_session_impl(
    state: &AppState,
    session: Session,
) -> Result<AttachSessionResponse, InfraError> {
    let Some(connector) = state.connector.clone() else {
        return Err(InfraError::InvalidConfig(
            "remote store is not configured".to_string(),
        ));
    };
    if session.user_id.trim().is_empty() {
        return Err(InfraError::InvalidConfig("user id must not be empty".to_string()));
    }
    state.session_store.save_session(&session)?;

    let backends = connector(&session)?;
    let reconciler = Arc::new(state.build_reconciler(backends.store));

    let profile = match &session.family_id {
        Some(_) => None,
        None => reconciler.fetch_profile(&session.user_id).await?,
    };
    let family_id = session
        .family_id
        .clone()
        .or_else(|| profile.as_ref().and_then(|profile| profile.family_id.clone()))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            InfraError::InvalidConfig(format!("no family linked to user {}", session.user_id))
        })?;
    let display_name = profile
        .and_then(|profile| profile.display_name)
        .unwrap_or_else(|| session.display_name.clone());

    state.store.set_current_user(Some(CurrentUser {
        id: session.user_id.clone(),
        display_name,
        family_id: Some(family_id.clone()),
    }))?;

    let migration = MigrationRunner::new(
        Arc::clone(&reconciler),
        Arc::clone(&state.migration_flags),
        Arc::clone(&state.cache),
    )
    .run(&session.user_id, &family_id)
    .await;
    let migration = match migration {
        Ok(MigrationOutcome::Skipped) => "skipped".to_string(),
        Ok(MigrationOutcome::NoLegacyData) => "no_legacy_data".to_string(),
        Ok(MigrationOutcome::Completed(report)) => {
            state.log_info(
                "attach_session",
                &format!(
                    "migrated children={} rows={} failed={}",
                    report.children_inserted,
                    report.rows_inserted,
                    report.failed.len()
                ),
            );
            "completed".to_string()
        }
        Ok(MigrationOutcome::Incomplete(report)) => {
            state.log_error(
                "attach_session",
                &format!("migration incomplete; {} rows left", report.failed.len()),
            );
            "incomplete".to_string()
        }
        Err(error) => {
            state.log_error("attach_session", &format!("migration deferred: {error}"));
            "deferred".to_string()
        }
    };

    flush_logged(state, "attach_session", &reconciler).await;
    let children = match reconciler.fetch_family(&family_id).await {
        Ok(graph) => state.store.replace_children(graph.children)?.children.len(),
        Err(error) => {
            state.log_error("attach_session", &format!("initial fetch failed: {error}"));
            state.store.snapshot()?.children.len()
        }
    };

    let listener = match backends.transport {
        Some(transport) => {
            let listener = RealtimeListener::new(transport);
            let sink = Arc::new(FamilyRefetchSink::new(
                Arc::clone(&reconciler),
                Arc::clone(&state.store),
                &family_id,
            ));
            match listener.subscribe(&family_id, sink) {
                Ok(_) => Some(listener),
                Err(error) => {
                    state.log_error("attach_session", &format!("realtime unavailable: {error}"));
                    None
                }
            }
        }
        None => None,
    };
    let subscribed = listener.is_some();

    let previous = lock_remote(state)?.replace(Arc::new(RemoteSession {
        user_id: session.user_id.clone(),
        family_id: family_id.clone(),
        reconciler,
        listener,
    }));
    if let Some(previous) = previous {
        previous.teardown();
    }

    state.log_info(
        "attach_session",
        &format!("attached user_id={} family_id={family_id}", session.user_id),
    );
    Ok(AttachSessionResponse {
        user_id: session.user_id,
        family_id,
        migration,
        children,
        subscribed,
    })
}

/// Re-attaches the stored session on launch, if there is one.
pub async fn restore_session_impl(state: &AppState) -> Result<Option<AttachSessionResponse>, InfraError> {
    if state.connector.is_none() {
        return Ok(None);
    }
    match state.session_store.load_session()? {
        Some(session) => attach_session_impl(state, session).await.map(Some),
        None => Ok(None),
    }
}

/// Signs out: stops the realtime subscription, forgets the session and the
/// current user. Local family data stays.
pub fn detach_session_impl(state: &AppState) -> Result<bool, InfraError> {
    let previous = lock_remote(state)?.take();
    if let Some(remote) = &previous {
        remote.teardown();
        state.log_info(
            "detach_session",
            &format!("detached user_id={} family_id={}", remote.user_id, remote.family_id),
        );
    }
    state.session_store.delete_session()?;
    state.store.set_current_user(None)?;
    Ok(previous.is_some())
}
