pub mod http;

#[cfg(test)]
pub mod fake;

use anyhow::Result;
use async_trait::async_trait;

use crate::participant::Participant;

/// Gateway response body returned for an accepted outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub body: serde_json::Value,
}

/// Upstream WhatsApp messaging service.
///
/// Every method is one external call and is subject to the upstream rate
/// limit, so callers space them through a [`crate::rate_limit::CallLimiter`].
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Chat ids of the active chats. May contain repeats.
    async fn list_chats(&self) -> Result<Vec<String>>;

    /// Up to `limit` message bodies of the chat, most recent first.
    async fn read_messages(&self, participant: &Participant, limit: usize) -> Result<Vec<String>>;

    async fn send_message(&self, recipient: &str, text: &str) -> Result<SendReceipt>;
}
