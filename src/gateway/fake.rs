//! Scripted in-memory gateway for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use super::{ChatGateway, SendReceipt};
use crate::participant::Participant;

#[derive(Default)]
pub struct FakeGateway {
    chats: Option<Vec<String>>,
    messages: HashMap<String, Vec<String>>,
    unreadable: HashSet<String>,
    failing_recipients: HashSet<String>,
    sent: Mutex<Vec<(String, String)>>,
    reads: Mutex<Vec<String>>,
    call_times: Mutex<Vec<Instant>>,
}

impl FakeGateway {
    /// A gateway whose chat listing fails
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_chats(chats: &[&str]) -> Self {
        Self {
            chats: Some(chats.iter().map(|c| c.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn messages(mut self, chat_id: &str, messages: &[&str]) -> Self {
        self.messages.insert(
            chat_id.to_string(),
            messages.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn unreadable(mut self, chat_id: &str) -> Self {
        self.unreadable.insert(chat_id.to_string());
        self
    }

    pub fn failing_send(mut self, recipient: &str) -> Self {
        self.failing_recipients.insert(recipient.to_string());
        self
    }

    /// Successful sends as (recipient, text)
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent().into_iter().map(|(r, _)| r).collect()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    fn record_call(&self) {
        self.call_times.lock().unwrap().push(Instant::now());
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn list_chats(&self) -> Result<Vec<String>> {
        self.record_call();
        self.chats
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Chat listing error (503 Service Unavailable)"))
    }

    async fn read_messages(&self, participant: &Participant, limit: usize) -> Result<Vec<String>> {
        self.record_call();
        self.reads.lock().unwrap().push(participant.chat_id.clone());
        if self.unreadable.contains(&participant.chat_id) {
            anyhow::bail!("Read messages error (500): {}", participant.chat_id);
        }
        Ok(self
            .messages
            .get(&participant.chat_id)
            .map(|m| m.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn send_message(&self, recipient: &str, text: &str) -> Result<SendReceipt> {
        self.record_call();
        if self.failing_recipients.contains(recipient) {
            anyhow::bail!("Send message error (500): rejected {}", recipient);
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(SendReceipt {
            body: serde_json::json!({ "status": "sent", "recipient": recipient }),
        })
    }
}
