use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::gateway::{ChatGateway, SendReceipt};
use crate::participant::Numbering;
use crate::rate_limit::CallLimiter;

/// Body of the reply webhook
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub specific_message: String,
    #[serde(default)]
    pub answer_message: String,
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("the {0} field is required")]
    MissingField(&'static str),

    #[error("failed to read messages: {0:#}")]
    ReadFailed(anyhow::Error),

    #[error("specific message did not match")]
    Mismatch,

    #[error("failed to send the message: {0:#}")]
    SendFailed(anyhow::Error),
}

impl ReplyRequest {
    fn validate(&self) -> Result<(), ReplyError> {
        if self.mobile.trim().is_empty() {
            return Err(ReplyError::MissingField("mobile"));
        }
        if self.specific_message.is_empty() {
            return Err(ReplyError::MissingField("specificMessage"));
        }
        if self.answer_message.is_empty() {
            return Err(ReplyError::MissingField("answerMessage"));
        }
        Ok(())
    }
}

/// Answer `request.mobile` with `answer_message`, but only if the latest
/// message in their chat is exactly `specific_message`.
pub async fn handle_reply(
    gateway: &dyn ChatGateway,
    limiter: &dyn CallLimiter,
    numbering: &Numbering,
    request: &ReplyRequest,
) -> Result<SendReceipt, ReplyError> {
    request.validate()?;

    let participant = numbering.participant_for_number(request.mobile.trim());

    limiter.acquire().await;
    let latest = gateway
        .read_messages(&participant, 1)
        .await
        .map_err(ReplyError::ReadFailed)?;

    if latest.first().map(String::as_str) != Some(request.specific_message.as_str()) {
        warn!(
            "Latest message of {} does not match the expected message",
            participant.chat_id
        );
        return Err(ReplyError::Mismatch);
    }

    limiter.acquire().await;
    let receipt = gateway
        .send_message(&participant.number, &request.answer_message)
        .await
        .map_err(ReplyError::SendFailed)?;

    info!("Replied to {}", participant.number);
    Ok(receipt)
}
