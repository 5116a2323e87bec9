use crate::NowProvider;
use crate::domain::errors::DomainError;
use crate::domain::ledger::{self, CompletionCredit};
use crate::domain::lifecycle;
use crate::domain::models::{
    Child, CurrentUser, EntityKind, FamilySnapshot, PendingPush, Preferences, PushOp,
    RecurrenceRule, RedemptionRecord, Reward, SnapshotPatch, Task, TaskStatus,
};
use crate::domain::time_format::{self, TimeFormat};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_cache::LocalCacheStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Ids are shared with every device in the family, so they are random
/// UUIDs rather than anything derived from local time.
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub reward_points: u32,
    pub scheduled_time: String,
    pub duration_minutes: Option<u32>,
    pub category: String,
    pub emoji: String,
    pub recurrence: Option<RecurrenceRule>,
}

/// Partial edit; `None` leaves the field alone. `Some(None)` clears an
/// optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub reward_points: Option<u32>,
    pub scheduled_time: Option<String>,
    pub duration_minutes: Option<Option<u32>>,
    pub category: Option<String>,
    pub emoji: Option<String>,
    pub recurrence: Option<Option<RecurrenceRule>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardDraft {
    pub title: String,
    pub category: String,
    pub cost_in_stars: u32,
    pub image_ref: String,
    pub reward_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    pub task: Task,
    pub credited_stars: u32,
    pub star_balance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionOutcome {
    pub record: RedemptionRecord,
    pub star_balance: u32,
}

/// The single owner of in-memory family state. Every operation validates,
/// applies to a working copy, persists through the local cache and only then
/// publishes the new state. Nothing here awaits.
pub struct FamilyStore {
    cache: Arc<dyn LocalCacheStore>,
    state: Mutex<FamilySnapshot>,
    now_provider: NowProvider,
    completion_credit: CompletionCredit,
}

impl FamilyStore {
    pub fn load(cache: Arc<dyn LocalCacheStore>) -> Self {
        let snapshot = cache.load();
        Self {
            cache,
            state: Mutex::new(snapshot),
            now_provider: Arc::new(Utc::now),
            completion_credit: CompletionCredit::default(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_completion_credit(mut self, completion_credit: CompletionCredit) -> Self {
        self.completion_credit = completion_credit;
        self
    }

    pub fn snapshot(&self) -> Result<FamilySnapshot, InfraError> {
        Ok(self.lock()?.clone())
    }

    pub fn family_id(&self) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.family_id().map(ToOwned::to_owned))
    }

    pub fn child(&self, child_id: &str) -> Result<Child, InfraError> {
        self.lock()?
            .child(child_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("child", child_id).into())
    }

    /// Resolves an explicit child id, falling back to the active child.
    pub fn resolve_child_id(&self, child_id: Option<&str>) -> Result<String, InfraError> {
        let state = self.lock()?;
        let requested = child_id.map(str::trim).filter(|value| !value.is_empty());
        let child = match requested {
            Some(id) => state.child(id),
            None => state.active_child(),
        };
        child
            .map(|child| child.id.clone())
            .ok_or_else(|| DomainError::not_found("child", requested.unwrap_or("active")).into())
    }

    pub fn add_child(&self, name: &str, avatar_ref: &str) -> Result<Child, InfraError> {
        let now_ms = self.now_ms();
        self.commit(PatchScope::Children, |snapshot| {
            let child = Child {
                id: new_entity_id(),
                name: name.trim().to_string(),
                avatar_ref: avatar_ref.trim().to_string(),
                level: 1,
                star_balance: 0,
                active: snapshot.active_child().is_none(),
                tasks: Vec::new(),
                rewards: Vec::new(),
                redemption_history: Vec::new(),
                created_at_epoch_ms: Some(now_ms),
            };
            child.validate()?;
            snapshot.children.push(child.clone());
            Ok(child)
        })
    }

    pub fn switch_active_child(&self, child_id: &str) -> Result<Child, InfraError> {
        self.commit(PatchScope::Children, |snapshot| {
            if snapshot.child(child_id).is_none() {
                return Err(DomainError::not_found("child", child_id));
            }
            for child in &mut snapshot.children {
                child.active = child.id == child_id;
            }
            Ok(existing_child(snapshot, child_id)?.clone())
        })
    }

    pub fn add_task(&self, child_id: &str, draft: TaskDraft) -> Result<Task, InfraError> {
        let now_ms = self.now_ms();
        self.commit(PatchScope::Children, |snapshot| {
            let task = build_task(draft, snapshot.preferences.time_format, now_ms)?;
            existing_child_mut(snapshot, child_id)?.tasks.push(task.clone());
            Ok(task)
        })
    }

    /// Appends several validated tasks in one persisted step.
    pub fn add_tasks(&self, child_id: &str, drafts: Vec<TaskDraft>) -> Result<Vec<Task>, InfraError> {
        let now_ms = self.now_ms();
        self.commit(PatchScope::Children, |snapshot| {
            let display = snapshot.preferences.time_format;
            let created = drafts
                .into_iter()
                .map(|draft| build_task(draft, display, now_ms))
                .collect::<Result<Vec<_>, _>>()?;
            existing_child_mut(snapshot, child_id)?
                .tasks
                .extend(created.iter().cloned());
            Ok(created)
        })
    }

    pub fn update_task(
        &self,
        child_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Task, InfraError> {
        self.commit(PatchScope::Children, |snapshot| {
            let display = snapshot.preferences.time_format;
            let task = existing_task_mut(snapshot, child_id, task_id)?;
            if let Some(title) = update.title {
                task.title = title.trim().to_string();
            }
            if let Some(description) = update.description {
                task.description = description.trim().to_string();
            }
            if let Some(points) = update.reward_points {
                task.reward_points = points;
            }
            if let Some(scheduled_time) = update.scheduled_time {
                let minutes =
                    time_format::parse_time_input(&scheduled_time, "task.scheduled_time")?;
                task.scheduled_time = time_format::format_minutes(minutes, display);
            }
            if let Some(duration) = update.duration_minutes {
                task.duration_minutes = duration;
            }
            if let Some(category) = update.category {
                task.category = category.trim().to_string();
            }
            if let Some(emoji) = update.emoji {
                task.emoji = emoji.trim().to_string();
            }
            if let Some(recurrence) = update.recurrence {
                task.recurrence = recurrence;
            }
            task.validate()?;
            Ok(task.clone())
        })
    }

    pub fn delete_task(&self, child_id: &str, task_id: &str) -> Result<Task, InfraError> {
        self.commit(PatchScope::Children, |snapshot| {
            let child = existing_child_mut(snapshot, child_id)?;
            let index = child
                .tasks
                .iter()
                .position(|task| task.id == task_id)
                .ok_or_else(|| DomainError::not_found("task", task_id))?;
            Ok(child.tasks.remove(index))
        })
    }

    pub fn start_task(&self, child_id: &str, task_id: &str) -> Result<Task, InfraError> {
        let now_ms = self.now_ms();
        self.commit(PatchScope::Children, |snapshot| {
            let task = existing_task_mut(snapshot, child_id, task_id)?;
            lifecycle::start(task, now_ms)?;
            Ok(task.clone())
        })
    }

    pub fn complete_task(&self, child_id: &str, task_id: &str) -> Result<CompletionOutcome, InfraError> {
        let policy = self.completion_credit;
        self.commit(PatchScope::Children, |snapshot| {
            let child = existing_child_mut(snapshot, child_id)?;
            let task = child
                .task_mut(task_id)
                .ok_or_else(|| DomainError::not_found("task", task_id))?;
            lifecycle::complete(task)?;
            let task = task.clone();
            let credited_stars = ledger::credit_completion(child, &task, policy);
            Ok(CompletionOutcome {
                task,
                credited_stars,
                star_balance: child.star_balance,
            })
        })
    }

    pub fn reset_task(&self, child_id: &str, task_id: &str) -> Result<Task, InfraError> {
        self.commit(PatchScope::Children, |snapshot| {
            let task = existing_task_mut(snapshot, child_id, task_id)?;
            lifecycle::reset(task);
            Ok(task.clone())
        })
    }

    pub fn add_reward(&self, child_id: &str, draft: RewardDraft) -> Result<Reward, InfraError> {
        let now_ms = self.now_ms();
        self.commit(PatchScope::Children, |snapshot| {
            let reward = Reward {
                id: new_entity_id(),
                title: draft.title.trim().to_string(),
                category: draft.category.trim().to_string(),
                cost_in_stars: draft.cost_in_stars,
                image_ref: draft.image_ref.trim().to_string(),
                reward_type: draft.reward_type.trim().to_string(),
                created_at_epoch_ms: Some(now_ms),
            };
            reward.validate()?;
            existing_child_mut(snapshot, child_id)?.rewards.push(reward.clone());
            Ok(reward)
        })
    }

    pub fn delete_reward(&self, child_id: &str, reward_id: &str) -> Result<Reward, InfraError> {
        self.commit(PatchScope::Children, |snapshot| {
            let child = existing_child_mut(snapshot, child_id)?;
            let index = child
                .rewards
                .iter()
                .position(|reward| reward.id == reward_id)
                .ok_or_else(|| DomainError::not_found("reward", reward_id))?;
            Ok(child.rewards.remove(index))
        })
    }

    pub fn redeem_reward(
        &self,
        child_id: &str,
        reward_id: &str,
        note: Option<&str>,
    ) -> Result<RedemptionOutcome, InfraError> {
        let now_ms = self.now_ms();
        self.commit(PatchScope::Children, |snapshot| {
            let child = existing_child_mut(snapshot, child_id)?;
            let record = ledger::redeem(
                child,
                reward_id,
                new_entity_id(),
                now_ms,
                note.map(ToOwned::to_owned),
            )?;
            Ok(RedemptionOutcome {
                record,
                star_balance: child.star_balance,
            })
        })
    }

    /// Full supersession by the remote graph. Entities still in the pending
    /// ledger keep their local version: queued upserts are laid over the
    /// remote graph and queued deletes are removed from it. The locally
    /// selected active child survives when it still exists; otherwise the
    /// first child takes over so exactly one child stays active.
    pub fn replace_children(&self, mut children: Vec<Child>) -> Result<FamilySnapshot, InfraError> {
        self.commit(PatchScope::Children, |snapshot| {
            let kept = overlay_pending(&snapshot.children, &snapshot.pending_sync, &mut children);
            let active_id = snapshot
                .active_child()
                .map(|child| child.id.clone())
                .filter(|id| children.iter().any(|child| &child.id == id))
                .or_else(|| children.iter().find(|child| child.active).map(|child| child.id.clone()))
                .or_else(|| children.first().map(|child| child.id.clone()));
            for child in &mut children {
                child.active = active_id.as_deref() == Some(child.id.as_str());
            }
            debug!(
                "replacing {} local children with remote graph; kept {kept} queued local changes",
                children.len()
            );
            snapshot.children = children;
            Ok(snapshot.clone())
        })
    }

    pub fn set_current_user(&self, current_user: Option<CurrentUser>) -> Result<(), InfraError> {
        self.commit(PatchScope::CurrentUser, |snapshot| {
            snapshot.current_user = current_user;
            Ok(())
        })
    }

    pub fn set_preferences(&self, preferences: Preferences) -> Result<(), InfraError> {
        self.commit(PatchScope::Preferences, |snapshot| {
            snapshot.preferences = preferences;
            Ok(())
        })
    }

    /// Adds a push to the retry ledger unless an identical one is queued.
    pub fn record_pending(&self, pending: PendingPush) -> Result<(), InfraError> {
        self.commit(PatchScope::PendingSync, |snapshot| {
            if !snapshot.pending_sync.contains(&pending) {
                snapshot.pending_sync.push(pending);
            }
            Ok(())
        })
    }

    pub fn pending(&self) -> Result<Vec<PendingPush>, InfraError> {
        Ok(self.lock()?.pending_sync.clone())
    }

    /// Clears the attempted pushes that did not come back as remaining.
    /// Pushes queued while the flush was in flight stay.
    pub fn settle_pending(
        &self,
        attempted: &[PendingPush],
        remaining: &[PendingPush],
    ) -> Result<(), InfraError> {
        self.commit(PatchScope::PendingSync, |snapshot| {
            snapshot
                .pending_sync
                .retain(|item| !attempted.contains(item) || remaining.contains(item));
            Ok(())
        })
    }

    fn now_ms(&self) -> i64 {
        (self.now_provider)().timestamp_millis()
    }

    fn lock(&self) -> Result<MutexGuard<'_, FamilySnapshot>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::StateLock(format!("family state: {error}")))
    }

    fn commit<T, F>(&self, scope: PatchScope, apply: F) -> Result<T, InfraError>
    where
        F: FnOnce(&mut FamilySnapshot) -> Result<T, DomainError>,
    {
        let mut state = self.lock()?;
        let mut working = state.clone();
        let value = apply(&mut working)?;
        let persisted = self.cache.save(scope.patch(&working))?;
        working.last_updated_epoch_ms = persisted.last_updated_epoch_ms;
        *state = working;
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy)]
enum PatchScope {
    Children,
    CurrentUser,
    Preferences,
    PendingSync,
}

impl PatchScope {
    fn patch(self, snapshot: &FamilySnapshot) -> SnapshotPatch {
        match self {
            Self::Children => SnapshotPatch::children(snapshot.children.clone()),
            Self::CurrentUser => SnapshotPatch {
                current_user: Some(snapshot.current_user.clone()),
                ..SnapshotPatch::default()
            },
            Self::Preferences => SnapshotPatch {
                preferences: Some(snapshot.preferences.clone()),
                ..SnapshotPatch::default()
            },
            Self::PendingSync => SnapshotPatch {
                pending_sync: Some(snapshot.pending_sync.clone()),
                ..SnapshotPatch::default()
            },
        }
    }
}

/// Lays queued local changes over a freshly fetched graph and returns how
/// many were applied. Child upserts go first so nested entities find their
/// owner.
fn overlay_pending(local: &[Child], pending: &[PendingPush], remote: &mut Vec<Child>) -> usize {
    let mut ordered = pending.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|item| item.kind != EntityKind::Child);

    let mut kept = 0;
    for item in ordered {
        if item.op == PushOp::Delete {
            match item.kind {
                EntityKind::Child => remote.retain(|child| child.id != item.entity_id),
                EntityKind::Task => remote
                    .iter_mut()
                    .for_each(|child| child.tasks.retain(|task| task.id != item.entity_id)),
                EntityKind::Reward => remote
                    .iter_mut()
                    .for_each(|child| child.rewards.retain(|reward| reward.id != item.entity_id)),
                EntityKind::Redemption => remote.iter_mut().for_each(|child| {
                    child
                        .redemption_history
                        .retain(|record| record.id != item.entity_id)
                }),
            }
            kept += 1;
            continue;
        }

        let owner_id = match item.kind {
            EntityKind::Child => Some(item.entity_id.as_str()),
            _ => item.child_id.as_deref(),
        };
        let Some(local_child) = owner_id.and_then(|id| local.iter().find(|child| child.id == id)) else {
            continue;
        };
        if item.kind == EntityKind::Child {
            match position_of(remote, &local_child.id) {
                Some(index) => {
                    let target = &mut remote[index];
                    target.name = local_child.name.clone();
                    target.avatar_ref = local_child.avatar_ref.clone();
                    target.level = local_child.level;
                    target.star_balance = local_child.star_balance;
                }
                None => remote.push(local_child.clone()),
            }
            kept += 1;
            continue;
        }

        let Some(index) = position_of(remote, &local_child.id) else {
            debug!("owner {} of queued {} is gone remotely", local_child.id, item.entity_id);
            continue;
        };
        let target = &mut remote[index];
        let applied = match item.kind {
            EntityKind::Task => local_child
                .task(&item.entity_id)
                .map(|task| replace_by_id(&mut target.tasks, task.clone(), |task| &task.id)),
            EntityKind::Reward => local_child
                .reward(&item.entity_id)
                .map(|reward| replace_by_id(&mut target.rewards, reward.clone(), |reward| &reward.id)),
            EntityKind::Redemption => local_child
                .redemption_history
                .iter()
                .find(|record| record.id == item.entity_id)
                .map(|record| {
                    target.star_balance = local_child.star_balance;
                    replace_by_id(&mut target.redemption_history, record.clone(), |record| &record.id)
                }),
            EntityKind::Child => None,
        };
        if applied.is_some() {
            kept += 1;
        }
    }
    kept
}

fn position_of(children: &[Child], child_id: &str) -> Option<usize> {
    children.iter().position(|child| child.id == child_id)
}

fn replace_by_id<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String) {
    match items.iter().position(|existing| id(existing) == id(&item)) {
        Some(index) => items[index] = item,
        None => items.push(item),
    }
}

fn build_task(draft: TaskDraft, display: TimeFormat, now_ms: i64) -> Result<Task, DomainError> {
    let minutes = time_format::parse_time_input(&draft.scheduled_time, "task.scheduled_time")?;
    let task = Task {
        id: new_entity_id(),
        title: draft.title.trim().to_string(),
        description: draft.description.trim().to_string(),
        reward_points: draft.reward_points,
        scheduled_time: time_format::format_minutes(minutes, display),
        duration_minutes: draft.duration_minutes,
        category: draft.category.trim().to_string(),
        emoji: draft.emoji.trim().to_string(),
        status: TaskStatus::Pending,
        started_at_epoch_ms: None,
        recurrence: draft.recurrence,
        created_at_epoch_ms: Some(now_ms),
    };
    task.validate()?;
    Ok(task)
}

fn existing_child<'a>(snapshot: &'a FamilySnapshot, child_id: &str) -> Result<&'a Child, DomainError> {
    snapshot
        .child(child_id)
        .ok_or_else(|| DomainError::not_found("child", child_id))
}

fn existing_child_mut<'a>(
    snapshot: &'a mut FamilySnapshot,
    child_id: &str,
) -> Result<&'a mut Child, DomainError> {
    snapshot
        .child_mut(child_id)
        .ok_or_else(|| DomainError::not_found("child", child_id))
}

fn existing_task_mut<'a>(
    snapshot: &'a mut FamilySnapshot,
    child_id: &str,
    task_id: &str,
) -> Result<&'a mut Task, DomainError> {
    existing_child_mut(snapshot, child_id)?
        .task_mut(task_id)
        .ok_or_else(|| DomainError::not_found("task", task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::local_cache::InMemoryLocalCacheStore;
    use chrono::{DateTime, TimeZone};

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 16, 7, 0, 0)
            .single()
            .expect("valid datetime")
    }

    fn store_with_cache() -> (FamilyStore, Arc<InMemoryLocalCacheStore>) {
        let cache = Arc::new(InMemoryLocalCacheStore::default());
        let store = FamilyStore::load(cache.clone()).with_now_provider(Arc::new(fixed_time));
        (store, cache)
    }

    fn brush_teeth() -> TaskDraft {
        TaskDraft {
            title: " Brush teeth ".to_string(),
            reward_points: 5,
            scheduled_time: "7:30am".to_string(),
            duration_minutes: Some(10),
            ..TaskDraft::default()
        }
    }

    #[test]
    fn first_child_becomes_active_and_state_is_persisted() {
        let (store, cache) = store_with_cache();
        let first = store.add_child("Mia", "fox").expect("add first");
        let second = store.add_child("Leo", "owl").expect("add second");

        assert!(first.active);
        assert!(!second.active);
        assert_eq!(cache.load().children.len(), 2);

        store.switch_active_child(&second.id).expect("switch");
        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.active_child().map(|child| child.id.as_str()), Some(second.id.as_str()));
        assert_eq!(snapshot.children.iter().filter(|child| child.active).count(), 1);
    }

    #[test]
    fn add_task_normalizes_time_and_rejects_invalid_input_without_mutation() {
        let (store, _) = store_with_cache();
        let child = store.add_child("Mia", "").expect("add child");

        let task = store.add_task(&child.id, brush_teeth()).expect("add task");
        assert_eq!(task.title, "Brush teeth");
        assert_eq!(task.scheduled_time, "7:30 AM");
        assert_eq!(task.created_at_epoch_ms, Some(fixed_time().timestamp_millis()));

        let error = store
            .add_task(
                &child.id,
                TaskDraft {
                    scheduled_time: "half past".to_string(),
                    ..brush_teeth()
                },
            )
            .expect_err("invalid time");
        assert!(matches!(error, InfraError::Domain(DomainError::Validation(_))));
        assert_eq!(store.child(&child.id).expect("child").tasks.len(), 1);
    }

    #[test]
    fn lifecycle_operations_flow_through_the_store() {
        let (store, _) = store_with_cache();
        let child = store.add_child("Mia", "").expect("add child");
        let task = store.add_task(&child.id, brush_teeth()).expect("add task");

        assert!(store.complete_task(&child.id, &task.id).is_err());
        let started = store.start_task(&child.id, &task.id).expect("start");
        assert_eq!(started.status, TaskStatus::Active);
        assert_eq!(started.started_at_epoch_ms, Some(fixed_time().timestamp_millis()));

        let completion = store.complete_task(&child.id, &task.id).expect("complete");
        assert_eq!(completion.task.status, TaskStatus::Done);
        assert_eq!(completion.credited_stars, 0);
        assert_eq!(completion.star_balance, 0);

        let reset = store.reset_task(&child.id, &task.id).expect("reset");
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.started_at_epoch_ms, None);
    }

    #[test]
    fn reward_points_policy_credits_completion() {
        let cache = Arc::new(InMemoryLocalCacheStore::default());
        let store = FamilyStore::load(cache).with_completion_credit(CompletionCredit::RewardPoints);
        let child = store.add_child("Mia", "").expect("add child");
        let task = store.add_task(&child.id, brush_teeth()).expect("add task");
        store.start_task(&child.id, &task.id).expect("start");

        let completion = store.complete_task(&child.id, &task.id).expect("complete");
        assert_eq!(completion.credited_stars, 5);
        assert_eq!(store.child(&child.id).expect("child").star_balance, 5);
    }

    #[test]
    fn redeem_reward_updates_balance_once() {
        let (store, _) = store_with_cache();
        let child = store.add_child("Mia", "").expect("add child");
        let mut seeded = store.snapshot().expect("snapshot").children;
        seeded[0].star_balance = 40;
        store.replace_children(seeded).expect("seed balance");

        let reward = store
            .add_reward(
                &child.id,
                RewardDraft {
                    title: "Movie night".to_string(),
                    cost_in_stars: 30,
                    ..RewardDraft::default()
                },
            )
            .expect("add reward");

        let outcome = store
            .redeem_reward(&child.id, &reward.id, Some("  Friday  "))
            .expect("redeem");
        assert_eq!(outcome.star_balance, 10);
        assert_eq!(outcome.record.note.as_deref(), Some("Friday"));

        let error = store
            .redeem_reward(&child.id, &reward.id, None)
            .expect_err("insufficient");
        assert!(matches!(
            error,
            InfraError::Domain(DomainError::InsufficientStars { balance: 10, cost: 30 })
        ));
        assert_eq!(store.child(&child.id).expect("child").redemption_history.len(), 1);
    }

    #[test]
    fn replace_children_keeps_local_active_selection() {
        let (store, _) = store_with_cache();
        let first = store.add_child("Mia", "").expect("add");
        let second = store.add_child("Leo", "").expect("add");
        store.switch_active_child(&second.id).expect("switch");

        let mut remote = store.snapshot().expect("snapshot").children;
        for child in &mut remote {
            child.active = child.id == first.id;
        }
        let replaced = store.replace_children(remote).expect("replace");
        assert_eq!(replaced.active_child().map(|child| child.id.clone()), Some(second.id.clone()));

        let only_first = vec![store.child(&first.id).expect("first")];
        let replaced = store.replace_children(only_first).expect("replace");
        assert_eq!(replaced.active_child().map(|child| child.id.clone()), Some(first.id));
    }

    #[test]
    fn pending_ledger_dedupes_and_settles() {
        let (store, cache) = store_with_cache();
        let queued = |entity_id: &str| PendingPush {
            kind: EntityKind::Task,
            op: PushOp::Upsert,
            entity_id: entity_id.to_string(),
            child_id: Some("kid-1".to_string()),
        };
        store.record_pending(queued("tsk-1")).expect("record");
        store.record_pending(queued("tsk-1")).expect("record again");
        store.record_pending(queued("tsk-2")).expect("record second");
        assert_eq!(cache.load().pending_sync.len(), 2);

        let attempted = store.pending().expect("pending");
        store.record_pending(queued("tsk-3")).expect("queued mid-flush");
        store
            .settle_pending(&attempted, &[queued("tsk-2")])
            .expect("settle");
        assert_eq!(
            store.pending().expect("pending"),
            vec![queued("tsk-2"), queued("tsk-3")]
        );
        assert_eq!(cache.load().pending_sync.len(), 2);
    }

    #[test]
    fn replace_children_keeps_queued_local_changes() {
        let (store, _) = store_with_cache();
        let child = store.add_child("Mia", "").expect("add child");
        let kept = store.add_task(&child.id, brush_teeth()).expect("add task");
        let deleted = store
            .add_task(
                &child.id,
                TaskDraft {
                    title: "Homework".to_string(),
                    ..brush_teeth()
                },
            )
            .expect("add task");
        let remote = store.snapshot().expect("snapshot").children;

        store.delete_task(&child.id, &deleted.id).expect("delete");
        let renamed = store
            .update_task(
                &child.id,
                &kept.id,
                TaskUpdate {
                    title: Some("Floss".to_string()),
                    ..TaskUpdate::default()
                },
            )
            .expect("rename");
        let offline = store.add_task(&child.id, brush_teeth()).expect("add offline task");
        let other = store.add_child("Leo", "").expect("add offline child");
        for (kind, op, entity_id, child_id) in [
            (EntityKind::Task, PushOp::Upsert, &renamed.id, Some(child.id.clone())),
            (EntityKind::Task, PushOp::Upsert, &offline.id, Some(child.id.clone())),
            (EntityKind::Task, PushOp::Delete, &deleted.id, Some(child.id.clone())),
            (EntityKind::Child, PushOp::Upsert, &other.id, None),
        ] {
            store
                .record_pending(PendingPush {
                    kind,
                    op,
                    entity_id: entity_id.clone(),
                    child_id,
                })
                .expect("record pending");
        }

        let replaced = store.replace_children(remote).expect("replace");
        let mia = replaced.child(&child.id).expect("mia");
        let titles = mia.tasks.iter().map(|task| task.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Floss", "Brush teeth"]);
        assert!(mia.task(&deleted.id).is_none());
        assert!(replaced.child(&other.id).is_some());
        assert_eq!(replaced.children.iter().filter(|child| child.active).count(), 1);
    }

    #[test]
    fn entity_ids_are_uuids() {
        let (store, _) = store_with_cache();
        let first = store.add_child("Mia", "").expect("add");
        let second = store.add_child("Leo", "").expect("add");
        assert!(Uuid::parse_str(&first.id).is_ok());
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn poisoned_state_lock_is_reported() {
        let (store, _) = store_with_cache();
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = store.state.lock();
                    panic!("poison the family state");
                })
                .join()
        });
        assert!(matches!(store.snapshot(), Err(InfraError::StateLock(_))));
    }

    #[test]
    fn preferences_drive_scheduled_time_format() {
        let (store, _) = store_with_cache();
        store
            .set_preferences(Preferences {
                time_format: TimeFormat::TwentyFourHour,
                ..Preferences::default()
            })
            .expect("set preferences");
        let child = store.add_child("Mia", "").expect("add child");
        let task = store
            .add_task(
                &child.id,
                TaskDraft {
                    scheduled_time: "7:05 PM".to_string(),
                    ..brush_teeth()
                },
            )
            .expect("add task");
        assert_eq!(task.scheduled_time, "19:05");
    }
}
