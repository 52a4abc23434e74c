use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub numbering: NumberingConfig,
    #[serde(default)]
    pub followup: FollowUpConfig,
    #[serde(default = "default_nudges")]
    pub nudges: Vec<NudgeConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Endpoints and credentials of the upstream WhatsApp gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub chats_url: String,
    #[serde(default)]
    pub chats_token: String,
    pub messages_url: String,
    pub send_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NumberingConfig {
    #[serde(default = "default_chat_suffix")]
    pub chat_suffix: String,
    #[serde(default = "default_country_prefix")]
    pub country_prefix: String,
    #[serde(default = "default_trunk_prefix")]
    pub trunk_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FollowUpConfig {
    /// Exact message body that makes a chat eligible for a follow-up
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default = "default_followup_message")]
    pub message: String,
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    #[serde(default = "default_call_spacing_secs")]
    pub call_spacing_secs: u64,
    /// Cron expression for the follow-up pass. Empty disables the job.
    #[serde(default = "default_followup_schedule")]
    pub schedule: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NudgeConfig {
    pub message: String,
    pub delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_suppression_window_secs")]
    pub suppression_window_secs: u64,
    #[serde(default = "default_cleanup_schedule")]
    pub cleanup_schedule: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_schedule")]
    pub poll_schedule: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long delivered and failed nudges are kept before the sweep deletes them
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_country_code() -> String {
    "+98".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_chat_suffix() -> String {
    "@c.us".to_string()
}

fn default_country_prefix() -> String {
    "98".to_string()
}

fn default_trunk_prefix() -> String {
    "0".to_string()
}

fn default_trigger() -> String {
    "1".to_string()
}

fn default_followup_message() -> String {
    "سلام وقتتون بخیر\n\
     تخفیف های ما :\n\
     تخفیف پاییزه برای همه کالا ها ۲۰٪\n\
     تخفیف ویژه کسانی که تازه ثبت نام کرده اند ۴۰٪\n\
     جوایز ما:\n\
     قرعه کشی و جوایز ۱۰ میلیون ریالی"
        .to_string()
}

fn default_message_limit() -> usize {
    5
}

fn default_call_spacing_secs() -> u64 {
    11
}

fn default_followup_schedule() -> String {
    "0 */10 * * * *".to_string()
}

fn default_nudges() -> Vec<NudgeConfig> {
    vec![
        NudgeConfig {
            message: "Where are you ?".to_string(),
            delay_secs: 4 * 60,
        },
        NudgeConfig {
            message: "You forgot your Discount ?".to_string(),
            delay_secs: 2 * 60 * 60,
        },
    ]
}

fn default_suppression_window_secs() -> u64 {
    20 * 60
}

fn default_cleanup_schedule() -> String {
    "0 * * * * *".to_string()
}

fn default_poll_schedule() -> String {
    "*/30 * * * * *".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_batch_size() -> usize {
    50
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("followbot.db")
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            chat_suffix: default_chat_suffix(),
            country_prefix: default_country_prefix(),
            trunk_prefix: default_trunk_prefix(),
        }
    }
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            trigger: default_trigger(),
            message: default_followup_message(),
            message_limit: default_message_limit(),
            call_spacing_secs: default_call_spacing_secs(),
            schedule: default_followup_schedule(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            suppression_window_secs: default_suppression_window_secs(),
            cleanup_schedule: default_cleanup_schedule(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_schedule: default_poll_schedule(),
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl FollowUpConfig {
    pub fn call_spacing(&self) -> Duration {
        Duration::from_secs(self.call_spacing_secs)
    }
}

impl RegistryConfig {
    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }
}

impl DispatchConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.followup.trigger.is_empty() {
            anyhow::bail!("[followup] trigger must not be empty");
        }
        if self.followup.message.trim().is_empty() {
            anyhow::bail!("[followup] message must not be empty");
        }
        if self.followup.message_limit == 0 {
            anyhow::bail!("[followup] message_limit must be at least 1");
        }
        if self.registry.suppression_window_secs == 0 {
            anyhow::bail!("[registry] suppression_window_secs must be greater than 0");
        }
        if self.dispatch.max_attempts == 0 {
            anyhow::bail!("[dispatch] max_attempts must be at least 1");
        }
        if let Some(pos) = self.nudges.iter().position(|n| n.message.trim().is_empty()) {
            anyhow::bail!("nudge #{} has an empty message", pos + 1);
        }
        match self.nudges.as_slice() {
            [first, second] => {
                if first.message == second.message {
                    anyhow::bail!("the two nudges must have different messages");
                }
                if first.delay_secs == second.delay_secs {
                    anyhow::bail!("the two nudges must have different delays");
                }
            }
            nudges => anyhow::bail!(
                "exactly two [[nudges]] are required, found {}",
                nudges.len()
            ),
        }
        Ok(())
    }
}
