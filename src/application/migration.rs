use crate::application::reconciler::{BatchReport, PushOutcome, Reconciler, RowFailure};
use crate::domain::models::{Child, FamilySnapshot};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_cache::LocalCacheStore;
use crate::infrastructure::migration_flag::MigrationFlagStore;
use crate::infrastructure::remote_rows::{
    RemoteRow, RemoteTable, encode_redemption, encode_reward, encode_task,
};
use crate::infrastructure::remote_store::RemoteStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub children_inserted: usize,
    pub children_present: usize,
    pub rows_inserted: usize,
    pub rows_present: usize,
    pub failed: Vec<RowFailure>,
}

impl MigrationReport {
    fn absorb(&mut self, batch: BatchReport) {
        self.rows_inserted += batch.inserted.len();
        self.rows_present += batch.already_present.len();
        self.failed.extend(batch.failed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The flag was already set.
    Skipped,
    NoLegacyData,
    Completed(MigrationReport),
    /// Some rows hit transient failures; the flag stays unset so the next
    /// sign-in resumes.
    Incomplete(MigrationReport),
}

/// Uploads pre-sign-in local data to the family once. Every insert is
/// existence-checked or duplicate-ignoring, so an interrupted run can simply
/// be started again.
pub struct MigrationRunner<R, F>
where
    R: RemoteStore + ?Sized,
    F: MigrationFlagStore + ?Sized,
{
    reconciler: Arc<Reconciler<R>>,
    flags: Arc<F>,
    cache: Arc<dyn LocalCacheStore>,
}

impl<R, F> MigrationRunner<R, F>
where
    R: RemoteStore + ?Sized,
    F: MigrationFlagStore + ?Sized,
{
    pub fn new(reconciler: Arc<Reconciler<R>>, flags: Arc<F>, cache: Arc<dyn LocalCacheStore>) -> Self {
        Self {
            reconciler,
            flags,
            cache,
        }
    }

    pub async fn run(&self, user_id: &str, family_id: &str) -> Result<MigrationOutcome, InfraError> {
        if self.flags.is_completed()? {
            return Ok(MigrationOutcome::Skipped);
        }

        let Some(legacy) = self.legacy_snapshot() else {
            info!("no pre-sign-in data for user {user_id}; marking migration done");
            self.flags.mark_completed()?;
            return Ok(MigrationOutcome::NoLegacyData);
        };

        info!(
            "migrating {} local children for user {user_id} into family {family_id}",
            legacy.children.len()
        );
        let mut report = MigrationReport::default();
        for child in &legacy.children {
            self.migrate_child(family_id, child, &mut report).await?;
        }

        if report.failed.iter().any(|failure| failure.transient) {
            warn!(
                "migration left {} rows behind; will resume on next sign-in",
                report.failed.len()
            );
            return Ok(MigrationOutcome::Incomplete(report));
        }
        for failure in &report.failed {
            warn!("migration dropped row {}: {}", failure.id, failure.message);
        }
        self.flags.mark_completed()?;
        Ok(MigrationOutcome::Completed(report))
    }

    fn legacy_snapshot(&self) -> Option<FamilySnapshot> {
        self.cache
            .load_legacy()
            .filter(|snapshot| !snapshot.children.is_empty())
            .or_else(|| Some(self.cache.load()).filter(|snapshot| !snapshot.children.is_empty()))
    }

    async fn migrate_child(
        &self,
        family_id: &str,
        child: &Child,
        report: &mut MigrationReport,
    ) -> Result<(), InfraError> {
        match self.reconciler.push_child_if_absent(family_id, child).await? {
            PushOutcome::AlreadyPresent => report.children_present += 1,
            _ => report.children_inserted += 1,
        }

        let tasks = child
            .tasks
            .iter()
            .map(|task| RemoteRow::Task(encode_task(task, &child.id)))
            .collect();
        report.absorb(self.reconciler.insert_batch(RemoteTable::Tasks, tasks).await);

        let rewards = child
            .rewards
            .iter()
            .map(|reward| RemoteRow::Reward(encode_reward(reward, &child.id)))
            .collect();
        report.absorb(self.reconciler.insert_batch(RemoteTable::Rewards, rewards).await);

        let mut history = Vec::with_capacity(child.redemption_history.len());
        for record in &child.redemption_history {
            match encode_redemption(record, &child.id) {
                Ok(row) => history.push(RemoteRow::Redemption(row)),
                Err(error) => report.failed.push(RowFailure {
                    id: record.id.clone(),
                    message: error.to_string(),
                    transient: false,
                }),
            }
        }
        report.absorb(
            self.reconciler
                .insert_batch(RemoteTable::RedemptionHistory, history)
                .await,
        );
        Ok(())
    }
}
