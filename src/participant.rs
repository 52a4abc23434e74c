use tracing::warn;

use crate::config::NumberingConfig;

/// A chat on the gateway together with the phone number messages are sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participant {
    pub chat_id: String,
    pub number: String,
}

/// Maps gateway chat ids (`989121234567@c.us`) to local numbers (`09121234567`) and back.
#[derive(Debug, Clone)]
pub struct Numbering {
    chat_suffix: String,
    country_prefix: String,
    trunk_prefix: String,
}

impl Numbering {
    pub fn new(config: &NumberingConfig) -> Self {
        Self {
            chat_suffix: config.chat_suffix.clone(),
            country_prefix: config.country_prefix.clone(),
            trunk_prefix: config.trunk_prefix.clone(),
        }
    }

    /// Derive the participant number for a chat id.
    ///
    /// Only the leading country prefix is swapped for the trunk prefix. Chat ids
    /// that lack the suffix, the prefix, or a digit-only subscriber part are
    /// returned unchanged (group chats end up here, for instance).
    pub fn participant_for(&self, chat_id: &str) -> Participant {
        let number = match self.local_number(chat_id) {
            Some(number) => number,
            None => {
                warn!("Chat id '{}' is not a personal chat id, using it as-is", chat_id);
                chat_id.to_string()
            }
        };
        Participant {
            chat_id: chat_id.to_string(),
            number,
        }
    }

    fn local_number(&self, chat_id: &str) -> Option<String> {
        let international = chat_id.strip_suffix(&self.chat_suffix)?;
        let subscriber = international.strip_prefix(&self.country_prefix)?;
        if subscriber.is_empty() || !subscriber.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(format!("{}{}", self.trunk_prefix, subscriber))
    }

    /// Inverse of [`Numbering::participant_for`] for a locally formatted number.
    /// Numbers without the trunk prefix are taken to be subscriber numbers.
    pub fn chat_id_for(&self, number: &str) -> String {
        let subscriber = number.strip_prefix(&self.trunk_prefix).unwrap_or(number);
        format!("{}{}{}", self.country_prefix, subscriber, self.chat_suffix)
    }

    pub fn participant_for_number(&self, number: &str) -> Participant {
        Participant {
            chat_id: self.chat_id_for(number),
            number: number.to_string(),
        }
    }
}
