use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatGateway, SendReceipt};
use crate::config::GatewayConfig;
use crate::participant::Participant;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatsResponse {
    #[serde(default)]
    is_success: Option<bool>,
    #[serde(default)]
    value: Vec<ChatEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatEntry {
    chat_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadMessagesRequest<'a> {
    chat_id: &'a str,
    mobile: &'a str,
    total: usize,
    ignore_data: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesResponse {
    is_success: bool,
    #[serde(default)]
    value: Vec<MessageEntry>,
}

#[derive(Debug, Deserialize)]
struct MessageEntry {
    // Media messages come back without a body
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    messages: Vec<OutboundMessage<'a>>,
    recipients: Vec<&'a str>,
    platforms: Vec<&'static str>,
    setting: SendSetting,
    with_country_code: bool,
    country_code: &'a str,
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    message: &'a str,
    message_type: &'static str,
    attachment_file: &'static str,
}

#[derive(Debug, Serialize)]
struct SendSetting {
    expired_minutes: &'static str,
}

/// [`ChatGateway`] over the JSON HTTP APIs: one service lists and reads
/// chats, another delivers outbound messages.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ChatGateway for HttpGateway {
    async fn list_chats(&self) -> Result<Vec<String>> {
        debug!("Listing chats: {}", self.config.chats_url);

        let response = self
            .client
            .post(&self.config.chats_url)
            .query(&[("token", &self.config.chats_token)])
            .header("Accept", "application/json")
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("Failed to send chat listing request")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat listing error ({}): {}", status, error_body);
        }

        let chats: ChatsResponse = response
            .json()
            .await
            .context("Failed to parse chat listing response")?;

        if chats.is_success == Some(false) {
            anyhow::bail!("Chat listing reported failure");
        }

        Ok(chats.value.into_iter().map(|c| c.chat_id).collect())
    }

    async fn read_messages(&self, participant: &Participant, limit: usize) -> Result<Vec<String>> {
        let request = ReadMessagesRequest {
            chat_id: &participant.chat_id,
            mobile: &participant.number,
            total: limit,
            ignore_data: true,
        };

        let response = self
            .client
            .post(&self.config.messages_url)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to read messages of {}", participant.chat_id))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Read messages error ({}): {}", status, error_body);
        }

        let messages: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse messages response")?;

        if !messages.is_success {
            anyhow::bail!("Read messages reported failure for {}", participant.chat_id);
        }

        Ok(messages
            .value
            .into_iter()
            .take(limit)
            .map(|m| m.message.unwrap_or_default())
            .collect())
    }

    async fn send_message(&self, recipient: &str, text: &str) -> Result<SendReceipt> {
        let request = SendRequest {
            messages: vec![OutboundMessage {
                message: text,
                message_type: "message",
                attachment_file: "",
            }],
            recipients: vec![recipient],
            platforms: vec!["whatsapp"],
            setting: SendSetting {
                expired_minutes: "",
            },
            with_country_code: true,
            country_code: &self.config.country_code,
        };

        debug!("Sending message to {}", recipient);

        let response = self
            .client
            .post(&self.config.send_url)
            .header("Accept", "application/json")
            .header("api-token", &self.config.api_token)
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .json(&request)
            .send()
            .await
            .context("Failed to send message request")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Send message error ({}): {}", status, error_body);
        }

        let body = response
            .json()
            .await
            .context("Failed to parse send message response")?;

        Ok(SendReceipt { body })
    }
}
