use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ChatHistoryEntry, HistoryStore};
use crate::error::BotError;

/// Process-local history. Lost on restart.
#[derive(Default)]
pub struct InMemoryStore {
    chats: Mutex<HashMap<i64, Vec<ChatHistoryEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self, chat_id: i64) -> usize {
        self.chats
            .lock()
            .await
            .get(&chat_id)
            .map_or(0, |entries| entries.len())
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn recent(&self, chat_id: i64, limit: usize) -> Result<Vec<ChatHistoryEntry>, BotError> {
        let chats = self.chats.lock().await;
        let entries = chats.get(&chat_id).map(Vec::as_slice).unwrap_or_default();
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }

    async fn append(&self, chat_id: i64, entry: &ChatHistoryEntry) -> Result<(), BotError> {
        self.chats
            .lock()
            .await
            .entry(chat_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Role;
    use chrono::Utc;

    fn entry(text: &str) -> ChatHistoryEntry {
        ChatHistoryEntry {
            role: Role::User,
            text: text.to_string(),
            sender_id: 5,
            sender_name: "bob".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_chats_are_isolated() {
        let store = InMemoryStore::new();
        store.append(1, &entry("one")).await.unwrap();
        store.append(2, &entry("two")).await.unwrap();
        store.append(2, &entry("three")).await.unwrap();

        assert_eq!(store.len(1).await, 1);
        assert_eq!(store.len(2).await, 2);
        let recent = store.recent(2, 10).await.unwrap();
        assert_eq!(recent[0].text, "two");
        assert_eq!(recent[1].text, "three");
    }

    #[tokio::test]
    async fn test_recent_limit_keeps_newest() {
        let store = InMemoryStore::new();
        for text in ["a", "b", "c", "d"] {
            store.append(9, &entry(text)).await.unwrap();
        }
        let recent = store.recent(9, 2).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["c", "d"]);
        assert!(store.recent(404, 10).await.unwrap().is_empty());
    }
}
