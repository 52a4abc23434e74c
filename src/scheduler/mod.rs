pub mod tasks;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// Cron clock driving the follow-up pass, the cleanup sweep and nudge dispatch.
///
/// Each tick calls the job's factory for a fresh future.
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// No jobs are registered and nothing runs until [`Scheduler::start`].
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Run `task` on every tick of `cron_expr` (six fields, seconds first).
    /// An empty expression leaves the job disabled.
    pub async fn add_cron_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if cron_expr.trim().is_empty() {
            info!("Job '{}' disabled: empty cron expression", name);
            return Ok(());
        }

        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                debug!("Tick: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Job '{}' scheduled ({})", name, cron_expr);
        Ok(())
    }

    /// Begin firing registered jobs.
    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Follow-up scheduler started");
        Ok(())
    }

    /// Stop firing jobs. A run already in progress is not awaited.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Follow-up scheduler stopped");
        Ok(())
    }
}
