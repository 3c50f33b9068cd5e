pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    /// Groups and supergroups.
    Group,
    Channel,
}

/// A text message received from Telegram, reduced to what the reply
/// pipeline looks at.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub sender_id: u64,
    pub sender_username: Option<String>,
    pub sender_first_name: String,
    pub text: String,
    /// The message replies to one the bot sent.
    pub is_reply_to_bot: bool,
    /// The text contains `@<bot username>`.
    pub mentions_bot: bool,
    pub timestamp: DateTime<Utc>,
}

/// Who the bot is, as reported by `getMe` at startup.
#[derive(Debug, Clone, Default)]
pub struct BotIdentity {
    pub id: u64,
    pub username: String,
}

/// Outbound side of the messaging platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;

    async fn send_typing(&self, chat_id: i64) -> Result<()>;

    /// Register `url` as the webhook, dropping pending updates.
    async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<()>;
}
