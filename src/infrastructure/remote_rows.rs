//! Typed remote rows and the single translation point between them and the
//! domain model. Anything malformed coming back from the store fails here.

use crate::domain::models::{
    Child, Frequency, RecurrenceRule, RedemptionRecord, Reward, Task, TaskStatus,
};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteTable {
    Profiles,
    Children,
    Tasks,
    Rewards,
    RedemptionHistory,
}

impl RemoteTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Children => "children",
            Self::Tasks => "tasks",
            Self::Rewards => "rewards",
            Self::RedemptionHistory => "redemption_history",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "profiles" => Some(Self::Profiles),
            "children" => Some(Self::Children),
            "tasks" => Some(Self::Tasks),
            "rewards" => Some(Self::Rewards),
            "redemption_history" => Some(Self::RedemptionHistory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildRow {
    pub id: String,
    pub family_id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub level: Option<i64>,
    #[serde(default)]
    pub stars: i64,
    /// Read-only here: the active child is a per-device selection, so
    /// pushes leave the column alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurrenceRow {
    pub frequency: String,
    #[serde(default)]
    pub days_of_week: Vec<i64>,
    #[serde(default)]
    pub day_of_month: Option<i64>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRow {
    pub id: String,
    pub child_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reward_points: i64,
    pub scheduled_time: String,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub recurrence: Option<RecurrenceRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardRow {
    pub id: String,
    pub child_id: String,
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    pub cost: i64,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub reward_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedemptionRow {
    pub id: String,
    pub child_id: String,
    pub reward_id: String,
    pub reward_title: String,
    pub cost: i64,
    pub redeemed_at: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRow {
    Child(ChildRow),
    Task(TaskRow),
    Reward(RewardRow),
    Redemption(RedemptionRow),
}

impl RemoteRow {
    pub fn table(&self) -> RemoteTable {
        match self {
            Self::Child(_) => RemoteTable::Children,
            Self::Task(_) => RemoteTable::Tasks,
            Self::Reward(_) => RemoteTable::Rewards,
            Self::Redemption(_) => RemoteTable::RedemptionHistory,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Child(row) => &row.id,
            Self::Task(row) => &row.id,
            Self::Reward(row) => &row.id,
            Self::Redemption(row) => &row.id,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, InfraError> {
        let value = match self {
            Self::Child(row) => serde_json::to_value(row)?,
            Self::Task(row) => serde_json::to_value(row)?,
            Self::Reward(row) => serde_json::to_value(row)?,
            Self::Redemption(row) => serde_json::to_value(row)?,
        };
        Ok(value)
    }

    pub fn from_json(table: RemoteTable, value: serde_json::Value) -> Result<Self, InfraError> {
        let mapping = |error: serde_json::Error| {
            InfraError::Mapping(format!("invalid {} row: {error}", table.as_str()))
        };
        match table {
            RemoteTable::Children => serde_json::from_value(value).map(Self::Child).map_err(mapping),
            RemoteTable::Tasks => serde_json::from_value(value).map(Self::Task).map_err(mapping),
            RemoteTable::Rewards => serde_json::from_value(value).map(Self::Reward).map_err(mapping),
            RemoteTable::RedemptionHistory => serde_json::from_value(value)
                .map(Self::Redemption)
                .map_err(mapping),
            RemoteTable::Profiles => Err(InfraError::Mapping(
                "profiles are not mapped to domain rows".to_string(),
            )),
        }
    }
}

/// Everything the store holds for one family, still in row form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyRows {
    pub children: Vec<ChildRow>,
    pub tasks: Vec<TaskRow>,
    pub rewards: Vec<RewardRow>,
    pub redemptions: Vec<RedemptionRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyGraph {
    pub children: Vec<Child>,
    /// Ids of rows that failed to translate and were left out.
    pub skipped: Vec<String>,
}

pub fn encode_child(child: &Child, family_id: &str) -> ChildRow {
    ChildRow {
        id: child.id.clone(),
        family_id: family_id.to_string(),
        name: child.name.clone(),
        avatar: non_empty(&child.avatar_ref),
        level: Some(i64::from(child.level)),
        stars: i64::from(child.star_balance),
        is_active: None,
        created_at: child.created_at_epoch_ms.and_then(epoch_ms_to_rfc3339),
    }
}

pub fn decode_child(row: ChildRow) -> Result<Child, InfraError> {
    Ok(Child {
        star_balance: non_negative_u32(row.stars, "children.stars", &row.id)?,
        level: match row.level {
            Some(level) => non_negative_u32(level, "children.level", &row.id)?.max(1),
            None => 1,
        },
        created_at_epoch_ms: parse_optional_timestamp(row.created_at.as_deref(), "children.created_at")?,
        id: row.id,
        name: row.name,
        avatar_ref: row.avatar.unwrap_or_default(),
        active: row.is_active.unwrap_or(false),
        tasks: Vec::new(),
        rewards: Vec::new(),
        redemption_history: Vec::new(),
    })
}

pub fn encode_task(task: &Task, child_id: &str) -> TaskRow {
    TaskRow {
        id: task.id.clone(),
        child_id: child_id.to_string(),
        title: task.title.clone(),
        description: non_empty(&task.description),
        reward_points: i64::from(task.reward_points),
        scheduled_time: task.scheduled_time.clone(),
        duration_minutes: task.duration_minutes.map(i64::from),
        category: non_empty(&task.category),
        emoji: non_empty(&task.emoji),
        status: task.status.as_str().to_string(),
        started_at: task.started_at_epoch_ms.and_then(epoch_ms_to_rfc3339),
        recurrence: task.recurrence.as_ref().map(encode_recurrence),
        created_at: task.created_at_epoch_ms.and_then(epoch_ms_to_rfc3339),
    }
}

pub fn decode_task(row: TaskRow) -> Result<(String, Task), InfraError> {
    let status = TaskStatus::parse(&row.status).ok_or_else(|| {
        InfraError::Mapping(format!("invalid tasks.status '{}' for {}", row.status, row.id))
    })?;
    let recurrence = row
        .recurrence
        .map(|recurrence| decode_recurrence(recurrence, &row.id))
        .transpose()?;
    let duration_minutes = row
        .duration_minutes
        .map(|value| non_negative_u32(value, "tasks.duration_minutes", &row.id))
        .transpose()?
        .filter(|value| *value > 0);
    let task = Task {
        reward_points: non_negative_u32(row.reward_points, "tasks.reward_points", &row.id)?,
        started_at_epoch_ms: parse_optional_timestamp(row.started_at.as_deref(), "tasks.started_at")?,
        created_at_epoch_ms: parse_optional_timestamp(row.created_at.as_deref(), "tasks.created_at")?,
        id: row.id,
        title: row.title,
        description: row.description.unwrap_or_default(),
        scheduled_time: row.scheduled_time,
        duration_minutes,
        category: row.category.unwrap_or_default(),
        emoji: row.emoji.unwrap_or_default(),
        status,
        recurrence,
    };
    Ok((row.child_id, task))
}

pub fn encode_reward(reward: &Reward, child_id: &str) -> RewardRow {
    RewardRow {
        id: reward.id.clone(),
        child_id: child_id.to_string(),
        title: reward.title.clone(),
        category: non_empty(&reward.category),
        cost: i64::from(reward.cost_in_stars),
        image: non_empty(&reward.image_ref),
        reward_type: non_empty(&reward.reward_type),
        created_at: reward.created_at_epoch_ms.and_then(epoch_ms_to_rfc3339),
    }
}

pub fn decode_reward(row: RewardRow) -> Result<(String, Reward), InfraError> {
    let cost = non_negative_u32(row.cost, "rewards.cost", &row.id)?;
    if cost == 0 {
        return Err(InfraError::Mapping(format!(
            "invalid rewards.cost for {}: expected positive number",
            row.id
        )));
    }
    let reward = Reward {
        created_at_epoch_ms: parse_optional_timestamp(row.created_at.as_deref(), "rewards.created_at")?,
        id: row.id,
        title: row.title,
        category: row.category.unwrap_or_default(),
        cost_in_stars: cost,
        image_ref: row.image.unwrap_or_default(),
        reward_type: row.reward_type.unwrap_or_default(),
    };
    Ok((row.child_id, reward))
}

pub fn encode_redemption(record: &RedemptionRecord, child_id: &str) -> Result<RedemptionRow, InfraError> {
    let redeemed_at = epoch_ms_to_rfc3339(record.timestamp_epoch_ms).ok_or_else(|| {
        InfraError::Mapping(format!(
            "redemption {} has an out-of-range timestamp",
            record.id
        ))
    })?;
    Ok(RedemptionRow {
        id: record.id.clone(),
        child_id: child_id.to_string(),
        reward_id: record.reward_id.clone(),
        reward_title: record.reward_title.clone(),
        cost: i64::from(record.cost),
        redeemed_at,
        note: record.note.clone(),
    })
}

pub fn decode_redemption(row: RedemptionRow) -> Result<(String, RedemptionRecord), InfraError> {
    let record = RedemptionRecord {
        cost: non_negative_u32(row.cost, "redemption_history.cost", &row.id)?,
        timestamp_epoch_ms: parse_timestamp(&row.redeemed_at, "redemption_history.redeemed_at")?,
        id: row.id,
        reward_id: row.reward_id,
        reward_title: row.reward_title,
        note: row.note,
    };
    Ok((row.child_id, record))
}

/// Builds the child graph from raw rows. Rows that fail to translate, or
/// that point at a child outside the family, are skipped and reported.
pub fn assemble_family(rows: FamilyRows) -> FamilyGraph {
    let mut graph = FamilyGraph::default();
    let mut index_by_child = HashMap::new();

    for row in rows.children {
        let row_id = row.id.clone();
        match decode_child(row) {
            Ok(child) => {
                index_by_child.insert(child.id.clone(), graph.children.len());
                graph.children.push(child);
            }
            Err(error) => skip(&mut graph, row_id, &error),
        }
    }

    for row in rows.tasks {
        let row_id = row.id.clone();
        match decode_task(row) {
            Ok((child_id, task)) => match index_by_child.get(&child_id) {
                Some(index) => graph.children[*index].tasks.push(task),
                None => skip(&mut graph, row_id, &orphan(&child_id)),
            },
            Err(error) => skip(&mut graph, row_id, &error),
        }
    }

    for row in rows.rewards {
        let row_id = row.id.clone();
        match decode_reward(row) {
            Ok((child_id, reward)) => match index_by_child.get(&child_id) {
                Some(index) => graph.children[*index].rewards.push(reward),
                None => skip(&mut graph, row_id, &orphan(&child_id)),
            },
            Err(error) => skip(&mut graph, row_id, &error),
        }
    }

    for row in rows.redemptions {
        let row_id = row.id.clone();
        match decode_redemption(row) {
            Ok((child_id, record)) => match index_by_child.get(&child_id) {
                Some(index) => graph.children[*index].redemption_history.push(record),
                None => skip(&mut graph, row_id, &orphan(&child_id)),
            },
            Err(error) => skip(&mut graph, row_id, &error),
        }
    }

    for child in &mut graph.children {
        child
            .redemption_history
            .sort_by_key(|record| record.timestamp_epoch_ms);
    }
    graph
}

fn skip(graph: &mut FamilyGraph, row_id: String, error: &InfraError) {
    warn!("skipping remote row {row_id}: {error}");
    graph.skipped.push(row_id);
}

fn orphan(child_id: &str) -> InfraError {
    InfraError::Mapping(format!("row references unknown child {child_id}"))
}

fn encode_recurrence(rule: &RecurrenceRule) -> RecurrenceRow {
    RecurrenceRow {
        frequency: rule.frequency.as_str().to_string(),
        days_of_week: rule.days_of_week.iter().map(|day| i64::from(*day)).collect(),
        day_of_month: rule.day_of_month.map(i64::from),
        end_date: rule.end_date.map(|date| date.format("%Y-%m-%d").to_string()),
    }
}

fn decode_recurrence(row: RecurrenceRow, task_id: &str) -> Result<RecurrenceRule, InfraError> {
    let frequency = Frequency::parse(&row.frequency).ok_or_else(|| {
        InfraError::Mapping(format!(
            "invalid tasks.recurrence.frequency '{}' for {task_id}",
            row.frequency
        ))
    })?;
    let days_of_week = row
        .days_of_week
        .into_iter()
        .map(|day| {
            u8::try_from(day).ok().filter(|day| *day <= 6).ok_or_else(|| {
                InfraError::Mapping(format!("invalid day of week {day} for {task_id}"))
            })
        })
        .collect::<Result<_, _>>()?;
    let day_of_month = row
        .day_of_month
        .map(|day| {
            u8::try_from(day).ok().filter(|day| (1..=31).contains(day)).ok_or_else(|| {
                InfraError::Mapping(format!("invalid day of month {day} for {task_id}"))
            })
        })
        .transpose()?;
    let end_date = row
        .end_date
        .as_deref()
        .map(|raw| {
            NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d").map_err(|error| {
                InfraError::Mapping(format!("invalid end date '{raw}' for {task_id}: {error}"))
            })
        })
        .transpose()?;

    let rule = RecurrenceRule {
        frequency,
        days_of_week,
        day_of_month,
        end_date,
    };
    rule.validate()
        .map_err(|error| InfraError::Mapping(format!("invalid recurrence for {task_id}: {error}")))?;
    Ok(rule)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn non_negative_u32(value: i64, field_name: &str, row_id: &str) -> Result<u32, InfraError> {
    u32::try_from(value).map_err(|_| {
        InfraError::Mapping(format!("invalid {field_name} {value} for {row_id}"))
    })
}

pub fn epoch_ms_to_rfc3339(value: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(value).map(|value| value.to_rfc3339())
}

fn parse_timestamp(value: &str, field_name: &str) -> Result<i64, InfraError> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc).timestamp_millis())
        .map_err(|error| InfraError::Mapping(format!("invalid {field_name} '{value}': {error}")))
}

fn parse_optional_timestamp(value: Option<&str>, field_name: &str) -> Result<Option<i64>, InfraError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| parse_timestamp(value, field_name))
        .transpose()
}
