use crate::domain::errors::ValidationErrors;
use crate::domain::time_format::{self, TimeFormat};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Active,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" | "in_progress" => Some(Self::Active),
            "done" | "completed" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

/// Days of week use 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default)]
    pub days_of_week: BTreeSet<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl RecurrenceRule {
    pub fn daily() -> Self {
        Self {
            frequency: Frequency::Daily,
            ..Self::default()
        }
    }

    pub fn weekly(days: impl IntoIterator<Item = u8>) -> Self {
        Self {
            frequency: Frequency::Weekly,
            days_of_week: days.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn monthly(day_of_month: u8) -> Self {
        Self {
            frequency: Frequency::Monthly,
            day_of_month: Some(day_of_month),
            ..Self::default()
        }
    }

    pub fn until(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.days_of_week.iter().any(|day| *day > 6) {
            errors.push("recurrence.days_of_week", "days must be within 0..=6");
        }
        match self.frequency {
            Frequency::Weekly if self.days_of_week.is_empty() => {
                errors.push("recurrence.days_of_week", "weekly rules need at least one day");
            }
            Frequency::Monthly => match self.day_of_month {
                Some(day) if (1..=31).contains(&day) => {}
                _ => errors.push("recurrence.day_of_month", "must be between 1 and 31"),
            },
            _ => {}
        }
        errors.into_result()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub reward_points: u32,
    /// Display string as entered; interpreted as minute-of-day.
    pub scheduled_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_epoch_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<RecurrenceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_epoch_ms: Option<i64>,
}

impl Task {
    pub fn scheduled_minutes(&self) -> u16 {
        time_format::parse_to_minutes(&self.scheduled_time)
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence
            .as_ref()
            .map(|rule| rule.frequency != Frequency::None)
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        validate_non_empty(&self.id, "task.id", &mut errors);
        validate_non_empty(&self.title, "task.title", &mut errors);
        if let Err(error) = time_format::parse_time_input(&self.scheduled_time, "task.scheduled_time")
        {
            errors.merge(error);
        }
        if let Some(duration) = self.duration_minutes {
            if let Err(error) =
                time_format::parse_duration_input(duration, "task.duration_minutes")
            {
                errors.merge(error);
            }
        }
        if let Some(rule) = &self.recurrence {
            if let Err(error) = rule.validate() {
                errors.merge(error);
            }
        }
        errors.into_result()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub category: String,
    pub cost_in_stars: u32,
    #[serde(default)]
    pub image_ref: String,
    #[serde(default, rename = "type")]
    pub reward_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_epoch_ms: Option<i64>,
}

impl Reward {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        validate_non_empty(&self.id, "reward.id", &mut errors);
        validate_non_empty(&self.title, "reward.title", &mut errors);
        if self.cost_in_stars == 0 {
            errors.push("reward.cost_in_stars", "must be > 0");
        }
        errors.into_result()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRecord {
    pub id: String,
    pub reward_id: String,
    pub reward_title: String,
    pub cost: u32,
    pub timestamp_epoch_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub star_balance: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub rewards: Vec<Reward>,
    #[serde(default)]
    pub redemption_history: Vec<RedemptionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_epoch_ms: Option<i64>,
}

fn default_level() -> u32 {
    1
}

impl Child {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        validate_non_empty(&self.id, "child.id", &mut errors);
        validate_non_empty(&self.name, "child.name", &mut errors);
        errors.into_result()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == task_id)
    }

    pub fn reward(&self, reward_id: &str) -> Option<&Reward> {
        self.rewards.iter().find(|reward| reward.id == reward_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Guardian {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub time_format: TimeFormat,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_sound_enabled")]
    pub sound_enabled: bool,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_sound_enabled() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            time_format: TimeFormat::default(),
            language: default_language(),
            sound_enabled: default_sound_enabled(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Child,
    Task,
    Reward,
    Redemption,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PushOp {
    Upsert,
    Delete,
}

/// A push that could not complete and must be retried on the next pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PendingPush {
    pub kind: EntityKind,
    pub op: PushOp,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FamilySnapshot {
    #[serde(default = "default_snapshot_version")]
    pub version: u32,
    #[serde(default)]
    pub current_user: Option<CurrentUser>,
    #[serde(default)]
    pub children: Vec<Child>,
    #[serde(default)]
    pub guardians: Vec<Guardian>,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub pending_sync: Vec<PendingPush>,
    #[serde(default)]
    pub last_updated_epoch_ms: Option<i64>,
}

fn default_snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for FamilySnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            current_user: None,
            children: Vec::new(),
            guardians: Vec::new(),
            preferences: Preferences::default(),
            pending_sync: Vec::new(),
            last_updated_epoch_ms: None,
        }
    }
}

impl FamilySnapshot {
    pub fn family_id(&self) -> Option<&str> {
        self.current_user
            .as_ref()
            .and_then(|user| user.family_id.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn child(&self, child_id: &str) -> Option<&Child> {
        self.children.iter().find(|child| child.id == child_id)
    }

    pub fn child_mut(&mut self, child_id: &str) -> Option<&mut Child> {
        self.children.iter_mut().find(|child| child.id == child_id)
    }

    pub fn active_child(&self) -> Option<&Child> {
        self.children.iter().find(|child| child.active)
    }
}

/// Top-level field patch merged into the persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPatch {
    pub current_user: Option<Option<CurrentUser>>,
    pub children: Option<Vec<Child>>,
    pub guardians: Option<Vec<Guardian>>,
    pub preferences: Option<Preferences>,
    pub pending_sync: Option<Vec<PendingPush>>,
}

impl SnapshotPatch {
    pub fn children(children: Vec<Child>) -> Self {
        Self {
            children: Some(children),
            ..Self::default()
        }
    }

    pub fn apply_to(self, snapshot: &mut FamilySnapshot) {
        if let Some(current_user) = self.current_user {
            snapshot.current_user = current_user;
        }
        if let Some(children) = self.children {
            snapshot.children = children;
        }
        if let Some(guardians) = self.guardians {
            snapshot.guardians = guardians;
        }
        if let Some(preferences) = self.preferences {
            snapshot.preferences = preferences;
        }
        if let Some(pending_sync) = self.pending_sync {
            snapshot.pending_sync = pending_sync;
        }
    }
}

fn validate_non_empty(value: &str, field_name: &str, errors: &mut ValidationErrors) {
    if value.trim().is_empty() {
        errors.push(field_name, "must not be empty");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_task() -> Task {
        Task {
            id: "tsk-1".to_string(),
            title: "Brush teeth".to_string(),
            description: "Two minutes, top and bottom".to_string(),
            reward_points: 5,
            scheduled_time: "7:30 AM".to_string(),
            duration_minutes: Some(10),
            category: "hygiene".to_string(),
            emoji: "🪥".to_string(),
            status: TaskStatus::Pending,
            started_at_epoch_ms: None,
            recurrence: Some(RecurrenceRule::daily()),
            created_at_epoch_ms: None,
        }
    }

    fn sample_child() -> Child {
        Child {
            id: "kid-1".to_string(),
            name: "Mia".to_string(),
            avatar_ref: "fox".to_string(),
            level: 2,
            star_balance: 40,
            active: true,
            tasks: vec![sample_task()],
            rewards: vec![Reward {
                id: "rwd-1".to_string(),
                title: "Movie night".to_string(),
                category: "fun".to_string(),
                cost_in_stars: 30,
                image_ref: "popcorn".to_string(),
                reward_type: "experience".to_string(),
                created_at_epoch_ms: None,
            }],
            redemption_history: Vec::new(),
            created_at_epoch_ms: None,
        }
    }

    #[test]
    fn task_validate_accepts_valid_task() {
        assert!(sample_task().validate().is_ok());
    }

    #[test]
    fn task_validate_collects_every_field_error() {
        let mut task = sample_task();
        task.title = "  ".to_string();
        task.scheduled_time = "sometime".to_string();
        task.duration_minutes = Some(0);
        let errors = task.validate().expect_err("invalid task");
        let fields = errors.fields().collect::<Vec<_>>();
        assert_eq!(
            fields,
            vec!["task.title", "task.scheduled_time", "task.duration_minutes"]
        );
    }

    #[test]
    fn recurrence_rule_invariants() {
        assert!(RecurrenceRule::weekly([]).validate().is_err());
        assert!(RecurrenceRule::weekly([7]).validate().is_err());
        assert!(RecurrenceRule::monthly(0).validate().is_err());
        assert!(RecurrenceRule::monthly(32).validate().is_err());
        assert!(RecurrenceRule::monthly(31).validate().is_ok());
        assert!(RecurrenceRule::default().validate().is_ok());
    }

    #[test]
    fn reward_requires_positive_cost() {
        let mut reward = sample_child().rewards.remove(0);
        reward.cost_in_stars = 0;
        assert!(reward.validate().is_err());
    }

    #[test]
    fn snapshot_patch_merges_only_present_fields() {
        let mut snapshot = FamilySnapshot {
            guardians: vec![Guardian {
                id: "g-1".to_string(),
                name: "Sam".to_string(),
                role: "parent".to_string(),
            }],
            ..FamilySnapshot::default()
        };
        SnapshotPatch::children(vec![sample_child()]).apply_to(&mut snapshot);
        assert_eq!(snapshot.children.len(), 1);
        assert_eq!(snapshot.guardians.len(), 1);
    }

    #[test]
    fn family_id_ignores_blank_values() {
        let mut snapshot = FamilySnapshot::default();
        snapshot.current_user = Some(CurrentUser {
            id: "u-1".to_string(),
            display_name: String::new(),
            family_id: Some("  ".to_string()),
        });
        assert_eq!(snapshot.family_id(), None);
    }

    #[test]
    fn snapshot_supports_serde_roundtrip() {
        let snapshot = FamilySnapshot {
            children: vec![sample_child()],
            pending_sync: vec![PendingPush {
                kind: EntityKind::Task,
                op: PushOp::Upsert,
                entity_id: "tsk-1".to_string(),
                child_id: Some("kid-1".to_string()),
            }],
            ..FamilySnapshot::default()
        };
        let roundtrip: FamilySnapshot =
            serde_json::from_str(&serde_json::to_string(&snapshot).expect("serialize snapshot"))
                .expect("deserialize snapshot");
        assert_eq!(roundtrip, snapshot);
    }
}
