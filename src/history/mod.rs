pub mod firestore;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::config::{HistoryBackend, HistoryConfig};
use crate::error::BotError;

use self::firestore::FirestoreStore;
use self::memory::InMemoryStore;

/// Hard cap on how many entries are ever read back as context.
pub const MAX_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }

    /// Unknown roles are read as `user`.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("bot") || s.eq_ignore_ascii_case("assistant") {
            Role::Bot
        } else {
            Role::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHistoryEntry {
    pub role: Role,
    pub text: String,
    pub sender_id: u64,
    /// Display name as resolved for the prompt.
    pub sender_name: String,
    /// Ignored on write by stores that stamp their own time.
    pub timestamp: DateTime<Utc>,
}

/// Backend holding per-chat message history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The newest `limit` entries for `chat_id`, oldest first.
    async fn recent(&self, chat_id: i64, limit: usize) -> Result<Vec<ChatHistoryEntry>, BotError>;

    async fn append(&self, chat_id: i64, entry: &ChatHistoryEntry) -> Result<(), BotError>;
}

/// Fail-soft front for whichever `HistoryStore` is configured.
///
/// The backend is built on first use and shared for the rest of the process.
/// Reads degrade to an empty history and writes only log on failure.
pub struct HistoryAdapter {
    config: HistoryConfig,
    store: OnceCell<Option<Arc<dyn HistoryStore>>>,
}

impl HistoryAdapter {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            store: OnceCell::new(),
        }
    }

    /// Adapter around an already built store.
    #[cfg(test)]
    pub fn with_store(config: HistoryConfig, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            config,
            store: OnceCell::new_with(Some(Some(store))),
        }
    }

    pub fn backend(&self) -> HistoryBackend {
        self.config.backend
    }

    /// Entries read per chat, clamped to `1..=MAX_WINDOW`.
    pub fn window(&self) -> usize {
        self.config.window.clamp(1, MAX_WINDOW)
    }

    pub async fn store(&self) -> Option<&Arc<dyn HistoryStore>> {
        self.store
            .get_or_init(|| async { build_store(&self.config) })
            .await
            .as_ref()
    }

    pub async fn fetch_recent(&self, chat_id: i64) -> Vec<ChatHistoryEntry> {
        let Some(store) = self.store().await else {
            return Vec::new();
        };
        let window = self.window();
        match store.recent(chat_id, window).await {
            Ok(mut entries) => {
                entries.retain(|e| !e.text.trim().is_empty());
                if entries.len() > window {
                    entries.drain(..entries.len() - window);
                }
                entries
            }
            Err(e) => {
                error!("Failed to fetch history for chat {}: {}", chat_id, e);
                Vec::new()
            }
        }
    }

    pub async fn append(&self, chat_id: i64, entry: &ChatHistoryEntry) {
        let Some(store) = self.store().await else {
            return;
        };
        if let Err(e) = store.append(chat_id, entry).await {
            error!(
                "Failed to store {} message for chat {}: {}",
                entry.role.as_str(),
                chat_id,
                e
            );
        }
    }
}

fn build_store(config: &HistoryConfig) -> Option<Arc<dyn HistoryStore>> {
    match config.backend {
        HistoryBackend::None => {
            info!("History disabled; replies will have no conversation context");
            None
        }
        HistoryBackend::Memory => {
            info!("Using in-process history store");
            Some(Arc::new(InMemoryStore::new()))
        }
        HistoryBackend::Firestore => match FirestoreStore::new(config) {
            Ok(store) => {
                info!(
                    "Firestore history initialized for project {}",
                    store.project_id()
                );
                Some(Arc::new(store))
            }
            Err(e) => {
                warn!("Firestore unavailable: {}", e);
                None
            }
        },
    }
}
