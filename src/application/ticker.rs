use crate::NowProvider;
use crate::application::family_store::FamilyStore;
use crate::domain::lifecycle;
use crate::domain::models::{Child, FamilySnapshot, Task, TaskStatus};
use crate::domain::recurrence;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCountdown {
    pub task_id: String,
    pub remaining_ms: i64,
}

/// Read-only view of "now" for the active child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSnapshot {
    pub local_date: NaiveDate,
    pub minute_of_day: u16,
    pub active_child_id: Option<String>,
    pub due_task_ids: Vec<String>,
    pub countdowns: Vec<TaskCountdown>,
}

impl TickSnapshot {
    fn idle(now: DateTime<Utc>, tz: Tz) -> Self {
        let local = now.with_timezone(&tz);
        Self {
            local_date: local.date_naive(),
            minute_of_day: local_minute_of_day(now, tz),
            active_child_id: None,
            due_task_ids: Vec::new(),
            countdowns: Vec::new(),
        }
    }
}

pub fn local_minute_of_day(now: DateTime<Utc>, tz: Tz) -> u16 {
    let local = now.with_timezone(&tz);
    // hour < 24 and minute < 60, so this always fits.
    (local.hour() * 60 + local.minute()) as u16
}

/// The child's tasks that occur on `date`, ordered by scheduled minute.
pub fn tasks_for_day(child: &Child, date: NaiveDate) -> Vec<Task> {
    let mut tasks = child
        .tasks
        .iter()
        .filter(|task| recurrence::is_scheduled_on(task, date))
        .cloned()
        .collect::<Vec<_>>();
    tasks.sort_by_key(|task| (task.scheduled_minutes(), task.title.clone()));
    tasks
}

pub fn compute_tick(snapshot: &FamilySnapshot, now: DateTime<Utc>, tz: Tz) -> TickSnapshot {
    let mut tick = TickSnapshot::idle(now, tz);
    let Some(child) = snapshot.active_child() else {
        return tick;
    };
    tick.active_child_id = Some(child.id.clone());

    let now_ms = now.timestamp_millis();
    for task in tasks_for_day(child, tick.local_date) {
        if task.status == TaskStatus::Pending && lifecycle::is_due_at(&task, tick.minute_of_day) {
            tick.due_task_ids.push(task.id.clone());
        }
        if let Some(remaining_ms) = lifecycle::remaining_ms(&task, now_ms) {
            tick.countdowns.push(TaskCountdown {
                task_id: task.id.clone(),
                remaining_ms,
            });
        }
    }
    tick
}

/// Background poller publishing a [`TickSnapshot`] each interval. Dropping
/// it stops the task.
pub struct Ticker {
    receiver: watch::Receiver<TickSnapshot>,
    task: JoinHandle<()>,
}

impl Ticker {
    pub fn latest(&self) -> TickSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TickSnapshot> {
        self.receiver.clone()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_ticker(
    store: Arc<FamilyStore>,
    tz: Tz,
    interval: Duration,
    now_provider: NowProvider,
) -> Ticker {
    let initial = match store.snapshot() {
        Ok(snapshot) => compute_tick(&snapshot, now_provider(), tz),
        Err(_) => TickSnapshot::idle(now_provider(), tz),
    };
    let (sender, receiver) = watch::channel(initial);

    let task = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            let snapshot = match store.snapshot() {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!("ticker could not read family state: {error}");
                    continue;
                }
            };
            let tick = compute_tick(&snapshot, now_provider(), tz);
            sender.send_if_modified(|current| {
                if *current == tick {
                    return false;
                }
                if current.local_date != tick.local_date {
                    debug!("ticker crossed into {}", tick.local_date);
                }
                *current = tick;
                true
            });
            if sender.is_closed() {
                break;
            }
        }
    });

    Ticker { receiver, task }
}
