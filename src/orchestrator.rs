use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gateway::ChatGateway;
use crate::nudge::{Nudge, NudgeScheduler};
use crate::participant::{Numbering, Participant};
use crate::rate_limit::CallLimiter;
use crate::store::sent::SentRegistry;

/// Templates and thresholds of a follow-up pass
#[derive(Debug, Clone)]
pub struct FollowUpSettings {
    pub trigger: String,
    pub message: String,
    pub message_limit: usize,
    pub nudges: Vec<Nudge>,
}

impl FollowUpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trigger: config.followup.trigger.clone(),
            message: config.followup.message.clone(),
            message_limit: config.followup.message_limit,
            nudges: config.nudges.iter().map(Nudge::from).collect(),
        }
    }
}

/// Result of one orchestration pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub sent_count: usize,
    pub candidates: usize,
    pub already_sent: usize,
    pub failed: usize,
}

impl OutcomeReport {
    fn listing_failed() -> Self {
        Self {
            success: false,
            message: "Failed to check chats".to_string(),
            reason: Some("chat listing failed".to_string()),
            ..Self::default()
        }
    }
}

/// Sends follow-ups to chats whose recent messages contain the trigger,
/// at most once per recipient per suppression window.
pub struct FollowUpOrchestrator {
    gateway: Arc<dyn ChatGateway>,
    registry: SentRegistry,
    nudges: Arc<dyn NudgeScheduler>,
    limiter: Arc<dyn CallLimiter>,
    numbering: Numbering,
    settings: FollowUpSettings,
}

impl FollowUpOrchestrator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        registry: SentRegistry,
        nudges: Arc<dyn NudgeScheduler>,
        limiter: Arc<dyn CallLimiter>,
        numbering: Numbering,
        settings: FollowUpSettings,
    ) -> Self {
        Self {
            gateway,
            registry,
            nudges,
            limiter,
            numbering,
            settings,
        }
    }

    /// Run one orchestration pass.
    ///
    /// Only a failed chat listing fails the pass. Read and send failures
    /// skip the affected participant; the next pass is the retry.
    pub async fn run_once(&self) -> OutcomeReport {
        self.limiter.acquire().await;
        let chat_ids = match self.gateway.list_chats().await {
            Ok(chat_ids) => chat_ids,
            Err(e) => {
                error!("Failed to list chats: {:#}", e);
                return OutcomeReport::listing_failed();
            }
        };

        let participants = self.participants(chat_ids);
        info!("Checking {} chat(s) for follow-up", participants.len());

        let candidates = self.find_candidates(&participants).await;
        let mut report = OutcomeReport {
            success: true,
            candidates: candidates.len(),
            ..OutcomeReport::default()
        };

        let mut pending = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.registry.exists(&candidate.number).await {
                Ok(true) => {
                    info!("Follow-up to {} already sent. Skipping...", candidate.number);
                    report.already_sent += 1;
                }
                Ok(false) => pending.push(candidate),
                Err(e) => {
                    error!("Sent registry lookup failed for {}: {:#}", candidate.number, e);
                    report.failed += 1;
                }
            }
        }

        if pending.is_empty() {
            info!("No users to follow up with.");
            report.message = "Chats have been checked. No users to follow up with.".to_string();
            return report;
        }

        let sent = self.send_follow_ups(&pending, &mut report).await;
        report.sent_count = sent.len();

        match self.registry.insert_many(&sent).await {
            Ok(_) => report.message = "Follow up messages sent.".to_string(),
            Err(e) => {
                error!("Failed to record {} sent recipient(s): {:#}", sent.len(), e);
                report.success = false;
                report.message =
                    "Follow up messages sent, but recording them failed.".to_string();
                report.reason = Some("failed to record sent recipients".to_string());
            }
        }

        info!(
            "Follow-up pass done: sent={}, already_sent={}, failed={}",
            report.sent_count, report.already_sent, report.failed
        );
        report
    }

    /// One participant per distinct chat id, in listing order
    fn participants(&self, chat_ids: Vec<String>) -> Vec<Participant> {
        let mut seen = HashSet::new();
        chat_ids
            .into_iter()
            .filter(|chat_id| seen.insert(chat_id.clone()))
            .map(|chat_id| self.numbering.participant_for(&chat_id))
            .collect()
    }

    async fn find_candidates(&self, participants: &[Participant]) -> Vec<Participant> {
        let mut candidates = Vec::new();
        let mut numbers = HashSet::new();

        for participant in participants {
            self.limiter.acquire().await;
            let messages = match self
                .gateway
                .read_messages(participant, self.settings.message_limit)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Skipping {}: failed to read messages: {:#}", participant.chat_id, e);
                    continue;
                }
            };

            if has_trigger(&messages, &self.settings.trigger, self.settings.message_limit)
                && numbers.insert(participant.number.clone())
            {
                debug!("{} sent the trigger message", participant.number);
                candidates.push(participant.clone());
            }
        }

        candidates
    }

    async fn send_follow_ups(
        &self,
        pending: &[Participant],
        report: &mut OutcomeReport,
    ) -> Vec<String> {
        let mut sent = Vec::with_capacity(pending.len());

        for participant in pending {
            let recipient = &participant.number;
            match self.registry.claim(recipient).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Follow-up to {} is handled by another pass. Skipping...", recipient);
                    report.already_sent += 1;
                    continue;
                }
                Err(e) => {
                    error!("Failed to claim {}: {:#}", recipient, e);
                    report.failed += 1;
                    continue;
                }
            }

            self.limiter.acquire().await;
            match self
                .gateway
                .send_message(recipient, &self.settings.message)
                .await
            {
                Ok(_) => {
                    info!("Message sent to {} successfully.", recipient);
                    self.schedule_nudges(recipient).await;
                    sent.push(recipient.clone());
                }
                Err(e) => {
                    error!("Failed to send message to {}: {:#}", recipient, e);
                    report.failed += 1;
                    if let Err(e) = self.registry.release(recipient).await {
                        error!("Failed to release claim on {}: {:#}", recipient, e);
                    }
                }
            }
        }

        sent
    }

    async fn schedule_nudges(&self, recipient: &str) {
        for nudge in &self.settings.nudges {
            if let Err(e) = self
                .nudges
                .schedule(recipient, &nudge.message, nudge.delay)
                .await
            {
                error!(
                    "Failed to schedule nudge '{}' for {}: {:#}",
                    nudge.message, recipient, e
                );
            }
        }
    }
}

/// Whether any of the first `limit` messages is exactly `trigger`
pub fn has_trigger(messages: &[String], trigger: &str, limit: usize) -> bool {
    messages.iter().take(limit).any(|m| m == trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::NumberingConfig;
    use crate::gateway::fake::FakeGateway;
    use crate::rate_limit::MinIntervalLimiter;
    use crate::store::Store;

    const A: &str = "989121111111@c.us";
    const B: &str = "989122222222@c.us";
    const C: &str = "989123333333@c.us";
    const NUM_A: &str = "09121111111";
    const NUM_B: &str = "09122222222";
    const NUM_C: &str = "09123333333";

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(String, String, Duration)>>,
    }

    #[async_trait]
    impl NudgeScheduler for RecordingScheduler {
        async fn schedule(
            &self,
            recipient: &str,
            message: &str,
            fire_after: Duration,
        ) -> anyhow::Result<String> {
            self.scheduled.lock().unwrap().push((
                recipient.to_string(),
                message.to_string(),
                fire_after,
            ));
            Ok(uuid::Uuid::new_v4().to_string())
        }
    }

    struct Harness {
        gateway: Arc<FakeGateway>,
        registry: SentRegistry,
        scheduler: Arc<RecordingScheduler>,
        orchestrator: FollowUpOrchestrator,
    }

    fn settings() -> FollowUpSettings {
        FollowUpSettings {
            trigger: "1".to_string(),
            message: "Our autumn discounts".to_string(),
            message_limit: 5,
            nudges: vec![
                Nudge {
                    message: "Where are you ?".to_string(),
                    delay: Duration::from_secs(240),
                },
                Nudge {
                    message: "You forgot your Discount ?".to_string(),
                    delay: Duration::from_secs(7200),
                },
            ],
        }
    }

    fn harness_with(gateway: FakeGateway, registry: SentRegistry, spacing: Duration) -> Harness {
        let gateway = Arc::new(gateway);
        let scheduler = Arc::new(RecordingScheduler::default());
        let orchestrator = FollowUpOrchestrator::new(
            gateway.clone(),
            registry.clone(),
            scheduler.clone(),
            Arc::new(MinIntervalLimiter::new(spacing)),
            Numbering::new(&NumberingConfig::default()),
            settings(),
        );
        Harness {
            gateway,
            registry,
            scheduler,
            orchestrator,
        }
    }

    fn harness(gateway: FakeGateway) -> Harness {
        let store = Store::open_in_memory().unwrap();
        harness_with(gateway, SentRegistry::new(store.connection()), Duration::ZERO)
    }

    fn three_triggered_chats() -> FakeGateway {
        FakeGateway::with_chats(&[A, B, C])
            .messages(A, &["1"])
            .messages(B, &["hi", "1"])
            .messages(C, &["1", "thanks"])
    }

    #[test]
    fn test_trigger_match() {
        let hit: Vec<String> = ["hello", "ok", "1", "bye", "no"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let miss: Vec<String> = ["2", "3", "4", "5", "6"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(has_trigger(&hit, "1", 5));
        assert!(!has_trigger(&miss, "1", 5));
    }

    #[test]
    fn test_trigger_must_match_exactly() {
        let messages = vec!["1 ".to_string(), "11".to_string(), "one".to_string()];
        assert!(!has_trigger(&messages, "1", 5));
    }

    #[test]
    fn test_trigger_outside_limit_ignored() {
        let messages: Vec<String> = ["a", "b", "c", "d", "e", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!has_trigger(&messages, "1", 5));
    }

    #[tokio::test]
    async fn test_sends_to_triggered_chats_only() {
        let h = harness(
            FakeGateway::with_chats(&[A, B])
                .messages(A, &["hello", "ok", "1", "bye", "no"])
                .messages(B, &["2", "3", "4", "5", "6"]),
        );

        let report = h.orchestrator.run_once().await;
        assert!(report.success);
        assert_eq!(report.sent_count, 1);
        assert_eq!(
            h.gateway.sent(),
            vec![(NUM_A.to_string(), "Our autumn discounts".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dedup_skips_live_record() {
        let h = harness(three_triggered_chats());
        h.registry.insert_many(&[NUM_B.to_string()]).await.unwrap();

        let report = h.orchestrator.run_once().await;
        assert!(report.success);
        assert_eq!(report.sent_count, 2);
        assert_eq!(report.already_sent, 1);
        assert_eq!(h.gateway.sent_to(), vec![NUM_A, NUM_C]);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let h = harness(three_triggered_chats());

        let first = h.orchestrator.run_once().await;
        assert_eq!(first.sent_count, 3);

        let second = h.orchestrator.run_once().await;
        assert!(second.success);
        assert_eq!(second.sent_count, 0);
        assert_eq!(second.already_sent, 3);
        assert_eq!(h.gateway.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_fast() {
        let h = harness(FakeGateway::unavailable());

        let report = h.orchestrator.run_once().await;
        assert!(!report.success);
        assert_eq!(report.reason.as_deref(), Some("chat listing failed"));
        assert_eq!(report.sent_count, 0);
        assert!(h.gateway.sent().is_empty());
        assert!(h.gateway.reads().is_empty());
        assert_eq!(h.registry.count().await.unwrap(), 0);
        assert!(h.scheduler.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_send_failure() {
        let h = harness(three_triggered_chats().failing_send(NUM_B));

        let report = h.orchestrator.run_once().await;
        assert!(report.success);
        assert_eq!(report.sent_count, 2);
        assert_eq!(report.failed, 1);
        assert!(h.registry.exists(NUM_A).await.unwrap());
        assert!(!h.registry.exists(NUM_B).await.unwrap());
        assert!(h.registry.exists(NUM_C).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_recipient_retried_next_pass() {
        let store = Store::open_in_memory().unwrap();
        let registry = SentRegistry::new(store.connection());

        let failing = harness_with(
            three_triggered_chats().failing_send(NUM_B),
            registry.clone(),
            Duration::ZERO,
        );
        failing.orchestrator.run_once().await;

        let healthy = harness_with(three_triggered_chats(), registry, Duration::ZERO);
        let report = healthy.orchestrator.run_once().await;
        assert_eq!(report.sent_count, 1);
        assert_eq!(healthy.gateway.sent_to(), vec![NUM_B]);
    }

    #[tokio::test]
    async fn test_two_nudges_per_successful_send() {
        let h = harness(three_triggered_chats().failing_send(NUM_B));
        h.orchestrator.run_once().await;

        let scheduled = h.scheduler.scheduled.lock().unwrap().clone();
        assert_eq!(scheduled.len(), 4);
        assert!(scheduled.iter().all(|(r, _, _)| r != NUM_B));
        assert!(scheduled.contains(&(
            NUM_A.to_string(),
            "Where are you ?".to_string(),
            Duration::from_secs(240)
        )));
        assert!(scheduled.contains(&(
            NUM_C.to_string(),
            "You forgot your Discount ?".to_string(),
            Duration::from_secs(7200)
        )));
    }

    #[tokio::test]
    async fn test_read_failure_is_not_fatal() {
        let h = harness(three_triggered_chats().unreadable(A));

        let report = h.orchestrator.run_once().await;
        assert!(report.success);
        assert_eq!(h.gateway.sent_to(), vec![NUM_B, NUM_C]);
    }

    #[tokio::test]
    async fn test_duplicate_chat_ids_read_once() {
        let h = harness(FakeGateway::with_chats(&[A, A, B, A]).messages(A, &["1"]));

        let report = h.orchestrator.run_once().await;
        assert_eq!(h.gateway.reads(), vec![A, B]);
        assert_eq!(report.sent_count, 1);
    }

    #[tokio::test]
    async fn test_registry_commit_failure_is_reported() {
        let store = Store::open_in_memory().unwrap();
        {
            let conn = store.connection();
            let conn = conn.lock().await;
            conn.execute_batch(
                "CREATE TRIGGER reject_sent BEFORE INSERT ON sent_records
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        }
        let h = harness_with(
            FakeGateway::with_chats(&[A]).messages(A, &["1"]),
            SentRegistry::new(store.connection()),
            Duration::ZERO,
        );

        let report = h.orchestrator.run_once().await;
        assert!(!report.success);
        assert_eq!(report.sent_count, 1);
        assert_eq!(report.reason.as_deref(), Some("failed to record sent recipients"));
        assert_ne!(report.message, "Follow up messages sent.");
    }

    #[tokio::test]
    async fn test_no_candidates_is_success() {
        let h = harness(FakeGateway::with_chats(&[A]).messages(A, &["hello"]));

        let report = h.orchestrator.run_once().await;
        assert!(report.success);
        assert_eq!(report.sent_count, 0);
        assert_eq!(report.candidates, 0);
        assert!(report.message.contains("No users to follow up with"));
    }

    #[tokio::test]
    async fn test_overlapping_passes_send_once() {
        let store = Store::open_in_memory().unwrap();
        let registry = SentRegistry::new(store.connection());
        let gateway = Arc::new(three_triggered_chats());

        let make = || {
            Arc::new(FollowUpOrchestrator::new(
                gateway.clone(),
                registry.clone(),
                Arc::new(RecordingScheduler::default()),
                Arc::new(MinIntervalLimiter::new(Duration::ZERO)),
                Numbering::new(&NumberingConfig::default()),
                settings(),
            ))
        };
        let first = make();
        let second = make();

        let (r1, r2) = tokio::join!(first.run_once(), second.run_once());
        assert_eq!(r1.sent_count + r2.sent_count, 3);

        let mut sent = gateway.sent_to();
        sent.sort();
        assert_eq!(sent, vec![NUM_A, NUM_B, NUM_C]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_calls_are_spaced() {
        let store = Store::open_in_memory().unwrap();
        let h = harness_with(
            three_triggered_chats(),
            SentRegistry::new(store.connection()),
            Duration::from_secs(11),
        );

        let report = h.orchestrator.run_once().await;
        assert_eq!(report.sent_count, 3);

        // 1 listing + 3 reads + 3 sends
        let times = h.gateway.call_times();
        assert_eq!(times.len(), 7);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(11));
        }
    }
}
