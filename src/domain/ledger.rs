use crate::domain::errors::DomainError;
use crate::domain::models::{Child, RedemptionRecord, Task, TaskStatus};
use serde::{Deserialize, Serialize};

/// Whether finishing a task moves stars onto the child's balance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCredit {
    /// Completion is celebratory only; balances change through redemption.
    #[default]
    None,
    RewardPoints,
}

/// Spends stars on a reward. The balance and history are untouched on failure.
pub fn redeem(
    child: &mut Child,
    reward_id: &str,
    record_id: impl Into<String>,
    now_epoch_ms: i64,
    note: Option<String>,
) -> Result<RedemptionRecord, DomainError> {
    let reward = child
        .reward(reward_id)
        .cloned()
        .ok_or_else(|| DomainError::not_found("reward", reward_id))?;

    if child.star_balance < reward.cost_in_stars {
        return Err(DomainError::InsufficientStars {
            balance: child.star_balance,
            cost: reward.cost_in_stars,
        });
    }

    let record = RedemptionRecord {
        id: record_id.into(),
        reward_id: reward.id,
        reward_title: reward.title,
        cost: reward.cost_in_stars,
        timestamp_epoch_ms: now_epoch_ms,
        note: note
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };
    child.star_balance -= record.cost;
    child.redemption_history.push(record.clone());
    Ok(record)
}

/// Returns the stars credited for a just-completed task under `policy`.
pub fn credit_completion(child: &mut Child, task: &Task, policy: CompletionCredit) -> u32 {
    if task.status != TaskStatus::Done {
        return 0;
    }
    match policy {
        CompletionCredit::None => 0,
        CompletionCredit::RewardPoints => {
            child.star_balance = child.star_balance.saturating_add(task.reward_points);
            task.reward_points
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Reward;

    const NOW: i64 = 1_771_230_000_000;

    fn child_with(balance: u32, cost: u32) -> Child {
        Child {
            id: "kid-1".to_string(),
            name: "Leo".to_string(),
            avatar_ref: String::new(),
            level: 1,
            star_balance: balance,
            active: true,
            tasks: Vec::new(),
            rewards: vec![Reward {
                id: "rwd-1".to_string(),
                title: "Ice cream".to_string(),
                category: "treat".to_string(),
                cost_in_stars: cost,
                image_ref: String::new(),
                reward_type: "treat".to_string(),
                created_at_epoch_ms: None,
            }],
            redemption_history: Vec::new(),
            created_at_epoch_ms: None,
        }
    }

    fn done_task(points: u32) -> Task {
        Task {
            id: "tsk-1".to_string(),
            title: "Tidy room".to_string(),
            description: String::new(),
            reward_points: points,
            scheduled_time: "5:00 PM".to_string(),
            duration_minutes: Some(15),
            category: String::new(),
            emoji: String::new(),
            status: TaskStatus::Done,
            started_at_epoch_ms: Some(NOW),
            recurrence: None,
            created_at_epoch_ms: None,
        }
    }

    #[test]
    fn redemption_fails_when_balance_is_short() {
        let mut child = child_with(40, 50);
        let result = redeem(&mut child, "rwd-1", "red-1", NOW, None);
        assert_eq!(
            result,
            Err(DomainError::InsufficientStars {
                balance: 40,
                cost: 50
            })
        );
        assert_eq!(child.star_balance, 40);
        assert!(child.redemption_history.is_empty());
    }

    #[test]
    fn redemption_decrements_and_appends_one_record() {
        let mut child = child_with(40, 30);
        let record = redeem(
            &mut child,
            "rwd-1",
            "red-1",
            NOW,
            Some(" after dinner ".to_string()),
        )
        .expect("redeem");
        assert_eq!(child.star_balance, 10);
        assert_eq!(child.redemption_history, vec![record.clone()]);
        assert_eq!(record.cost, 30);
        assert_eq!(record.timestamp_epoch_ms, NOW);
        assert_eq!(record.note.as_deref(), Some("after dinner"));
    }

    #[test]
    fn redemption_of_unknown_reward_is_not_found() {
        let mut child = child_with(40, 30);
        assert!(matches!(
            redeem(&mut child, "missing", "red-1", NOW, None),
            Err(DomainError::NotFound { .. })
        ));
    }

    #[test]
    fn completion_credit_follows_policy() {
        let mut child = child_with(5, 30);
        assert_eq!(credit_completion(&mut child, &done_task(8), CompletionCredit::None), 0);
        assert_eq!(child.star_balance, 5);

        assert_eq!(
            credit_completion(&mut child, &done_task(8), CompletionCredit::RewardPoints),
            8
        );
        assert_eq!(child.star_balance, 13);
    }

    #[test]
    fn unfinished_task_never_credits() {
        let mut child = child_with(5, 30);
        let mut task = done_task(8);
        task.status = TaskStatus::Active;
        assert_eq!(credit_completion(&mut child, &task, CompletionCredit::RewardPoints), 0);
        assert_eq!(child.star_balance, 5);
    }
}
