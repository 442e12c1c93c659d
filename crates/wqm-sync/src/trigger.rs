//! The periodic tick: find projects with a schedule due now, reconcile
//! them, and leave one execution log row behind.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;
use wqm_core::{select_due, DueWindow, ExecutionLog, LocalClock};
use wqm_storage::ScheduleRegistry;

use crate::engine::{ReconcileSummary, ReconciliationEngine};

/// Body returned to whoever invoked the tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResult {
    pub success: bool,
    pub executed_at: DateTime<Utc>,
    pub schedules_found: usize,
    pub projects_checked: usize,
    pub numbers_updated: usize,
    pub errors: usize,
}

pub struct TriggerLoop {
    engine: Arc<ReconciliationEngine>,
    clock: LocalClock,
    window: DueWindow,
    project_concurrency: usize,
}

impl TriggerLoop {
    pub fn new(engine: Arc<ReconciliationEngine>, clock: LocalClock, window: DueWindow) -> Self {
        Self {
            engine,
            clock,
            window,
            project_concurrency: 2,
        }
    }

    /// Scheduled invocation. A project with several schedules in the same
    /// window is reconciled once.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TriggerResult> {
        let span = info_span!("trigger_tick", %now);
        self.tick(now).instrument(span).await
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<TriggerResult> {
        let store = self.engine.store();
        let schedules = store.all_schedules().await.context("loading schedules")?;
        let selection = select_due(&schedules, now, &self.clock, &self.window);
        if !selection.to_fire.is_empty() {
            store
                .mark_fired(&selection.to_fire, now)
                .await
                .context("marking schedules fired")?;
        }

        let summary = self.reconcile_all(&selection.project_ids, now).await;
        self.finish(now, selection.matched.len(), selection.project_ids.len(), summary)
            .await
    }

    /// Manual "test now": no due filter, no fired guard.
    pub async fn run_for_projects(
        &self,
        project_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<TriggerResult> {
        let span = info_span!("trigger_tick", %now, manual = true);
        let projects: BTreeSet<Uuid> = project_ids.iter().copied().collect();
        async {
            let summary = self.reconcile_all(&projects, now).await;
            self.finish(now, 0, projects.len(), summary).await
        }
        .instrument(span)
        .await
    }

    async fn reconcile_all(&self, projects: &BTreeSet<Uuid>, now: DateTime<Utc>) -> ReconcileSummary {
        let project_ids: Vec<Uuid> = projects.iter().copied().collect();
        let runs = project_ids.into_iter().map(|project_id| async move {
            (project_id, self.engine.reconcile_project(project_id, now).await)
        });
        let results: Vec<(Uuid, Result<ReconcileSummary>)> = stream::iter(runs)
            .buffer_unordered(self.project_concurrency)
            .collect()
            .await;

        let mut total = ReconcileSummary::default();
        for (project_id, result) in results {
            match result {
                Ok(summary) => total.merge(summary),
                Err(err) => {
                    error!(%project_id, error = ?err, "project reconciliation failed");
                    total.errors += 1;
                }
            }
        }
        total
    }

    async fn finish(
        &self,
        now: DateTime<Utc>,
        schedules_found: usize,
        projects_checked: usize,
        summary: ReconcileSummary,
    ) -> Result<TriggerResult> {
        let log = ExecutionLog {
            id: Uuid::new_v4(),
            executed_at: now,
            schedules_matched: schedules_found as i64,
            projects_checked: projects_checked as i64,
            numbers_updated: summary.updated as i64,
            errors: summary.errors as i64,
        };
        self.engine
            .store()
            .record_execution(&log)
            .await
            .context("recording execution log")?;

        info!(
            schedules_found,
            projects_checked,
            numbers_updated = summary.updated,
            errors = summary.errors,
            "tick complete"
        );
        Ok(TriggerResult {
            success: true,
            executed_at: now,
            schedules_found,
            projects_checked,
            numbers_updated: summary.updated,
            errors: summary.errors,
        })
    }
}

/// Cron-driven ticks inside the serving process.
pub async fn build_scheduler(trigger: Arc<TriggerLoop>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let trigger = Arc::clone(&trigger);
        Box::pin(async move {
            if let Err(err) = trigger.run_tick(Utc::now()).await {
                error!(error = ?err, "scheduled tick failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
