use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::NudgeConfig;
use crate::gateway::ChatGateway;
use crate::rate_limit::CallLimiter;
use crate::store::nudges::{NudgeQueue, NudgeStatus};

/// Delivers a message to a recipient once `fire_after` has elapsed.
///
/// Implementations must deliver at least once and keep scheduled messages
/// across process restarts.
#[async_trait]
pub trait NudgeScheduler: Send + Sync {
    /// Returns an identifier for the scheduled nudge.
    async fn schedule(&self, recipient: &str, message: &str, fire_after: Duration) -> Result<String>;
}

/// A fixed message sent a fixed delay after a follow-up
#[derive(Debug, Clone, PartialEq)]
pub struct Nudge {
    pub message: String,
    pub delay: Duration,
}

impl From<&NudgeConfig> for Nudge {
    fn from(config: &NudgeConfig) -> Self {
        Self {
            message: config.message.clone(),
            delay: Duration::from_secs(config.delay_secs),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// Sends due nudges from the queue through the gateway.
pub struct NudgeDispatcher {
    queue: NudgeQueue,
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<dyn CallLimiter>,
    max_attempts: u32,
    batch_size: usize,
    running: Mutex<()>,
}

impl NudgeDispatcher {
    pub fn new(
        queue: NudgeQueue,
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<dyn CallLimiter>,
        max_attempts: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            gateway,
            limiter,
            max_attempts,
            batch_size,
            running: Mutex::new(()),
        }
    }

    pub async fn dispatch_due(&self) -> Result<DispatchReport> {
        self.dispatch_due_at(Utc::now()).await
    }

    /// Send every nudge due at `now`. A run that starts while another is
    /// still going does nothing, so a nudge is never picked up twice.
    pub async fn dispatch_due_at(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Nudge dispatch already running, skipping");
            return Ok(DispatchReport::default());
        };

        let due = self.queue.due_at(now, self.batch_size).await?;
        let mut report = DispatchReport::default();
        if due.is_empty() {
            return Ok(report);
        }

        info!("Dispatching {} due nudge(s)", due.len());
        for nudge in due {
            self.limiter.acquire().await;
            match self.gateway.send_message(&nudge.recipient, &nudge.message).await {
                Ok(_) => {
                    self.queue.mark_delivered(&nudge.id).await?;
                    info!(
                        "Nudge {} delivered to {} (due {})",
                        nudge.id, nudge.recipient, nudge.fire_at
                    );
                    report.delivered += 1;
                }
                Err(e) => {
                    let status = self
                        .queue
                        .record_failure(&nudge.id, &format!("{:#}", e), self.max_attempts)
                        .await?;
                    match status {
                        NudgeStatus::Failed => {
                            error!(
                                "Giving up on nudge {} to {}: {:#}",
                                nudge.id, nudge.recipient, e
                            );
                            report.failed += 1;
                        }
                        _ => {
                            warn!(
                                "Nudge {} to {} failed (attempt {}), will retry: {:#}",
                                nudge.id,
                                nudge.recipient,
                                nudge.attempts + 1,
                                e
                            );
                            report.retrying += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}
