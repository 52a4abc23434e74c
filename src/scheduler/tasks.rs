use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use crate::nudge::NudgeDispatcher;
use crate::orchestrator::FollowUpOrchestrator;
use crate::scheduler::Scheduler;
use crate::store::nudges::NudgeQueue;
use crate::store::sent::SentRegistry;

/// Cron expressions for the periodic jobs
pub struct Schedules<'a> {
    pub followup: &'a str,
    pub cleanup: &'a str,
    pub dispatch: &'a str,
}

/// What the periodic cleanup removes and how old it must be
#[derive(Clone)]
pub struct Sweep {
    pub registry: SentRegistry,
    pub nudges: NudgeQueue,
    pub suppression_window: Duration,
    pub nudge_retention: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SweepReport {
    pub evicted: usize,
    pub purged: usize,
}

impl Sweep {
    /// Evict expired sent records and delete finished nudges.
    pub async fn run(&self) -> Result<SweepReport> {
        let evicted = self
            .registry
            .evict_older_than(self.suppression_window)
            .await?;
        let purged = self
            .nudges
            .purge_finished_older_than(self.nudge_retention)
            .await?;
        Ok(SweepReport { evicted, purged })
    }
}

/// Register the follow-up pass, the cleanup sweep and the nudge dispatcher.
/// Runs of a job may overlap; the registry and dispatcher tolerate that.
pub async fn register_tasks(
    scheduler: &Scheduler,
    schedules: Schedules<'_>,
    orchestrator: Arc<FollowUpOrchestrator>,
    sweep: Sweep,
    dispatcher: Arc<NudgeDispatcher>,
) -> Result<()> {
    scheduler
        .add_cron_job(schedules.followup, "follow-up", move || {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                let report = orchestrator.run_once().await;
                if report.success {
                    info!("Follow-up pass: {} sent", report.sent_count);
                } else {
                    error!(
                        "Follow-up pass failed: {}",
                        report.reason.as_deref().unwrap_or(&report.message)
                    );
                }
            })
        })
        .await?;

    scheduler
        .add_cron_job(schedules.cleanup, "cleanup-sent-numbers", move || {
            let sweep = sweep.clone();
            Box::pin(async move {
                match sweep.run().await {
                    Ok(report) if report == SweepReport::default() => {}
                    Ok(report) => info!(
                        "Evicted {} sent record(s), purged {} finished nudge(s)",
                        report.evicted, report.purged
                    ),
                    Err(e) => error!("Cleanup sweep failed: {:#}", e),
                }
            })
        })
        .await?;

    scheduler
        .add_cron_job(schedules.dispatch, "nudge-dispatch", move || {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                if let Err(e) = dispatcher.dispatch_due().await {
                    error!("Nudge dispatch failed: {:#}", e);
                }
            })
        })
        .await?;

    Ok(())
}
