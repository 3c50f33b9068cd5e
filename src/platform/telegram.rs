use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, UpdateKind};
use tracing::debug;

use super::{BotIdentity, ChatKind, IncomingMessage, Messenger};
use crate::error::BotError;

/// Telegram rejects longer messages.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Cut `text` to Telegram's message limit on a char boundary.
pub fn truncate_for_telegram(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Byte offsets of every case-insensitive `@username` in `text`.
fn mention_spans(text: &str, username: &str) -> Vec<(usize, usize)> {
    if username.is_empty() {
        return Vec::new();
    }
    let handle = format!("@{}", username);
    let mut spans = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let end = start + handle.len();
        match text.get(start..end) {
            Some(candidate) if candidate.eq_ignore_ascii_case(&handle) => {
                spans.push((start, end));
                start = end;
            }
            _ => {
                start += text[start..].chars().next().map_or(1, char::len_utf8);
            }
        }
    }
    spans
}

pub fn contains_mention(text: &str, username: &str) -> bool {
    !mention_spans(text, username).is_empty()
}

/// Remove every `@username` from `text` and trim the result.
pub fn strip_mention(text: &str, username: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end) in mention_spans(text, username) {
        out.push_str(&text[last..start]);
        last = end;
    }
    out.push_str(&text[last..]);
    out.trim().to_string()
}

/// Parse a webhook body. `Ok(None)` means a well-formed update that carries
/// nothing for the reply pipeline (edits, callbacks, media, anonymous
/// senders).
pub fn parse_update(body: &[u8], me: &BotIdentity) -> Result<Option<IncomingMessage>, BotError> {
    let update: Update =
        serde_json::from_slice(body).map_err(|e| BotError::MalformedPayload(e.to_string()))?;

    match update.kind {
        UpdateKind::Message(msg) => Ok(incoming_from_message(&msg, me)),
        _ => {
            debug!("Ignoring non-message update {:?}", update.id);
            Ok(None)
        }
    }
}

pub fn incoming_from_message(msg: &Message, me: &BotIdentity) -> Option<IncomingMessage> {
    let user = msg.from.as_ref()?;
    let text = msg.text()?.to_string();

    let chat_kind = if msg.chat.is_private() {
        ChatKind::Private
    } else if msg.chat.is_group() || msg.chat.is_supergroup() {
        ChatKind::Group
    } else {
        ChatKind::Channel
    };

    let is_reply_to_bot = msg
        .reply_to_message()
        .and_then(|reply| reply.from.as_ref())
        .is_some_and(|author| me.id != 0 && author.id.0 == me.id);

    Some(IncomingMessage {
        chat_id: msg.chat.id.0,
        chat_kind,
        sender_id: user.id.0,
        sender_username: user.username.clone(),
        sender_first_name: user.first_name.clone(),
        mentions_bot: contains_mention(&text, &me.username),
        text,
        is_reply_to_bot,
        timestamp: msg.date,
    })
}

/// Ask Telegram who we are.
pub async fn identify(bot: &Bot) -> Result<BotIdentity> {
    let me = bot.get_me().await.context("getMe failed")?;
    Ok(BotIdentity {
        id: me.id.0,
        username: me.username().to_string(),
    })
}

/// `Messenger` backed by the Bot API.
#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat_id), truncate_for_telegram(text))
            .await
            .context("sendMessage failed")?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .context("sendChatAction failed")?;
        Ok(())
    }

    async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<()> {
        let url = reqwest::Url::parse(url)
            .with_context(|| format!("Invalid webhook URL: {}", url))?;
        let mut request = self.bot.set_webhook(url).drop_pending_updates(true);
        if let Some(secret) = secret_token {
            request = request.secret_token(secret.to_string());
        }
        request.await.context("setWebhook failed")?;
        Ok(())
    }
}
