//! Task status transitions and the time-derived projections that sit beside
//! them. `status` only moves on explicit calls; "due" and the countdown are
//! computed views that never write back.

use crate::domain::errors::DomainError;
use crate::domain::models::{Task, TaskStatus};
use crate::domain::time_format::MINUTES_PER_DAY;

const MILLIS_PER_MINUTE: i64 = 60_000;

pub fn start(task: &mut Task, now_epoch_ms: i64) -> Result<(), DomainError> {
    if task.status != TaskStatus::Pending {
        return Err(invalid_transition(task, TaskStatus::Active));
    }
    task.status = TaskStatus::Active;
    task.started_at_epoch_ms = Some(now_epoch_ms);
    Ok(())
}

pub fn complete(task: &mut Task) -> Result<(), DomainError> {
    if task.status != TaskStatus::Active {
        return Err(invalid_transition(task, TaskStatus::Done));
    }
    task.status = TaskStatus::Done;
    Ok(())
}

pub fn reset(task: &mut Task) {
    task.status = TaskStatus::Pending;
    task.started_at_epoch_ms = None;
}

/// Remaining countdown for an active task with a duration, clamped at zero.
pub fn remaining_ms(task: &Task, now_epoch_ms: i64) -> Option<i64> {
    if task.status != TaskStatus::Active {
        return None;
    }
    let started_at = task.started_at_epoch_ms?;
    let duration = i64::from(task.duration_minutes?);
    let deadline = started_at.saturating_add(duration.saturating_mul(MILLIS_PER_MINUTE));
    Some(deadline.saturating_sub(now_epoch_ms).max(0))
}

/// Whether `minute_of_day` falls within `[scheduled, scheduled + duration)`.
/// Windows running past midnight wrap into the early morning.
pub fn is_due_at(task: &Task, minute_of_day: u16) -> bool {
    let start = u32::from(task.scheduled_minutes());
    let length = task.duration_minutes.unwrap_or(1).max(1);
    let end = start + length;
    let minute = u32::from(minute_of_day % MINUTES_PER_DAY);
    let day = u32::from(MINUTES_PER_DAY);

    if length >= day {
        return true;
    }
    if end <= day {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end - day
    }
}

fn invalid_transition(task: &Task, to: TaskStatus) -> DomainError {
    DomainError::InvalidTransition {
        task_id: task.id.clone(),
        from: task.status.as_str(),
        to: to.as_str(),
    }
}
