use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatHistoryEntry, HistoryStore, Role};
use crate::config::{FirestoreConfig, HistoryConfig};
use crate::error::BotError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

/// Supplies the bearer token for each Firestore request.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, BotError>;
}

struct StaticToken(String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, BotError> {
        Ok(self.0.clone())
    }
}

/// Tokens minted from a service-account key. `gcp_auth` caches them and
/// fetches a new one shortly before expiry.
struct ServiceAccountTokens(CustomServiceAccount);

#[async_trait]
impl TokenSource for ServiceAccountTokens {
    async fn token(&self) -> Result<String, BotError> {
        let token = self
            .0
            .token(&[DATASTORE_SCOPE])
            .await
            .map_err(|e| BotError::storage(format!("token refresh failed: {e}")))?;
        Ok(token.as_str().to_string())
    }
}

/// History kept in Cloud Firestore, spoken to over its REST API.
///
/// Documents live under
/// `artifacts/{app_id}/public/data/telegram_chat_history/{chat_id}/messages`.
pub struct FirestoreStore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    /// `projects/{project}/databases/(default)`
    database: String,
    app_id: String,
    api_key: Option<String>,
    tokens: Option<Arc<dyn TokenSource>>,
    writer_id: String,
}

#[derive(Deserialize)]
struct RunQueryItem {
    document: Option<Document>,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    fields: HashMap<String, Value>,
}

/// Service-account JSON from inline config or the key file, if either is set.
fn load_credentials(config: &FirestoreConfig) -> Result<Option<String>, BotError> {
    if let Some(json) = config.credentials_json.as_ref().filter(|j| !j.trim().is_empty()) {
        return Ok(Some(json.clone()));
    }
    match &config.credentials_file {
        Some(path) => std::fs::read_to_string(path).map(Some).map_err(|e| {
            BotError::storage(format!(
                "cannot read service account file {}: {}",
                path.display(),
                e
            ))
        }),
        None => Ok(None),
    }
}

/// Configured project id, or the one named in the service-account key.
fn resolve_project_id(config: &FirestoreConfig, credentials: Option<&str>) -> Option<String> {
    let configured = config.project_id.trim();
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    let key: Value = serde_json::from_str(credentials?).ok()?;
    key.get("project_id")?
        .as_str()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

impl FirestoreStore {
    pub fn new(config: &HistoryConfig) -> Result<Self, BotError> {
        let firestore = &config.firestore;
        let credentials = load_credentials(firestore)?;
        let project_id = resolve_project_id(firestore, credentials.as_deref())
            .ok_or(BotError::ConfigurationMissing("history.firestore.project_id"))?;

        let tokens: Option<Arc<dyn TokenSource>> = match (&firestore.access_token, credentials) {
            (Some(token), _) => Some(Arc::new(StaticToken(token.clone()))),
            (None, Some(json)) => {
                let account = CustomServiceAccount::from_json(&json).map_err(|e| {
                    BotError::storage(format!("invalid service account credentials: {e}"))
                })?;
                Some(Arc::new(ServiceAccountTokens(account)))
            }
            (None, None) => None,
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(BotError::storage)?;

        Ok(Self {
            client,
            base_url: firestore.base_url.trim_end_matches('/').to_string(),
            database: format!("projects/{}/databases/(default)", project_id),
            project_id,
            app_id: config.app_id.clone(),
            api_key: firestore.api_key.clone(),
            tokens,
            writer_id: format!("anonymous_user_{}", uuid::Uuid::new_v4()),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    #[cfg(test)]
    fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Resource name of the chat document, relative to the API root.
    fn chat_name(&self, chat_id: i64) -> String {
        format!(
            "{}/documents/artifacts/{}/public/data/telegram_chat_history/{}",
            self.database, self.app_id, chat_id
        )
    }

    async fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, BotError> {
        let mut request = self.client.post(url);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }
        if let Some(tokens) = &self.tokens {
            request = request.bearer_auth(tokens.token().await?);
        }
        Ok(request)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BotError> {
        let response = request.send().await.map_err(BotError::storage)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::StorageUnavailable(format!(
                "Firestore error ({}): {}",
                status, body
            )));
        }
        Ok(response)
    }
}

fn string_field<'a>(fields: &'a HashMap<String, Value>, name: &str) -> Option<&'a str> {
    fields.get(name)?.get("stringValue")?.as_str()
}

fn entry_from_fields(fields: &HashMap<String, Value>) -> Option<ChatHistoryEntry> {
    let text = string_field(fields, "text")?.trim().to_string();
    let role = string_field(fields, "role").map_or(Role::User, Role::parse);
    let sender_name = string_field(fields, "sender_username")
        .unwrap_or_default()
        .to_string();
    let sender_id = fields
        .get("sender_id")
        .and_then(|v| v.get("integerValue"))
        .and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_u64(),
        })
        .unwrap_or_default();
    let timestamp = fields
        .get("timestamp")
        .and_then(|v| v.get("timestampValue"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default();

    Some(ChatHistoryEntry {
        role,
        text,
        sender_id,
        sender_name,
        timestamp,
    })
}

#[async_trait]
impl HistoryStore for FirestoreStore {
    async fn recent(&self, chat_id: i64, limit: usize) -> Result<Vec<ChatHistoryEntry>, BotError> {
        let url = format!("{}/{}:runQuery", self.base_url, self.chat_name(chat_id));
        let query = json!({
            "structuredQuery": {
                "from": [{ "collectionId": "messages" }],
                "orderBy": [{
                    "field": { "fieldPath": "timestamp" },
                    "direction": "DESCENDING"
                }],
                "limit": limit,
            }
        });

        debug!("Firestore runQuery for chat {}", chat_id);
        let response = self.send(self.post(&url).await?.json(&query)).await?;
        let items: Vec<RunQueryItem> = response.json().await.map_err(BotError::storage)?;

        // Newest first on the wire.
        let mut entries: Vec<ChatHistoryEntry> = items
            .into_iter()
            .filter_map(|item| item.document)
            .filter_map(|doc| entry_from_fields(&doc.fields))
            .collect();
        entries.reverse();
        Ok(entries)
    }

    /// Written through `commit` so Firestore stamps `timestamp` with its own
    /// clock; ordering never depends on the host or Telegram clocks.
    async fn append(&self, chat_id: i64, entry: &ChatHistoryEntry) -> Result<(), BotError> {
        let url = format!("{}/{}/documents:commit", self.base_url, self.database);
        let name = format!(
            "{}/messages/{}",
            self.chat_name(chat_id),
            uuid::Uuid::new_v4().simple()
        );
        let body = json!({
            "writes": [{
                "update": {
                    "name": name,
                    "fields": {
                        "sender_id": { "integerValue": entry.sender_id.to_string() },
                        "sender_username": { "stringValue": entry.sender_name },
                        "text": { "stringValue": entry.text },
                        "role": { "stringValue": entry.role.as_str() },
                        "userId": { "stringValue": self.writer_id },
                    }
                },
                "updateTransforms": [{
                    "fieldPath": "timestamp",
                    "setToServerValue": "REQUEST_TIME"
                }],
                "currentDocument": { "exists": false }
            }]
        });

        self.send(self.post(&url).await?.json(&body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryBackend;
    use mockito::Matcher;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(base_url: &str, access_token: Option<&str>) -> HistoryConfig {
        HistoryConfig {
            backend: HistoryBackend::Firestore,
            app_id: "friends".to_string(),
            window: 10,
            firestore: FirestoreConfig {
                project_id: "demo-project".to_string(),
                access_token: access_token.map(str::to_string),
                base_url: base_url.to_string(),
                ..FirestoreConfig::default()
            },
        }
    }

    fn doc(role: &str, text: &str, ts: &str) -> Value {
        json!({
            "document": {
                "name": "projects/demo-project/databases/(default)/documents/x",
                "fields": {
                    "role": { "stringValue": role },
                    "text": { "stringValue": text },
                    "sender_username": { "stringValue": "alice" },
                    "sender_id": { "integerValue": "42" },
                    "timestamp": { "timestampValue": ts }
                }
            },
            "readTime": "2024-01-01T00:00:00Z"
        })
    }

    /// Hands out `token-1`, `token-2`, ... like a provider whose tokens expire.
    #[derive(Default)]
    struct RotatingTokens {
        issued: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for RotatingTokens {
        async fn token(&self) -> Result<String, BotError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }
    }

    #[test]
    fn test_requires_project_id() {
        let mut cfg = config("http://localhost", None);
        cfg.firestore.project_id = " ".to_string();
        assert!(matches!(
            FirestoreStore::new(&cfg),
            Err(BotError::ConfigurationMissing(_))
        ));
    }

    #[test]
    fn test_writer_id_is_anonymous_uuid() {
        let store = FirestoreStore::new(&config("http://localhost", None)).unwrap();
        assert!(store.writer_id.starts_with("anonymous_user_"));
    }

    #[test]
    fn test_project_id_from_service_account_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"type": "service_account", "project_id": "from-key"}}"#).unwrap();

        let mut cfg = config("http://localhost", Some("override"));
        cfg.firestore.project_id = String::new();
        cfg.firestore.credentials_file = Some(file.path().to_path_buf());

        // The fixed token wins, so the key itself is never parsed for signing.
        let store = FirestoreStore::new(&cfg).unwrap();
        assert_eq!(store.project_id(), "from-key");
        assert!(store.chat_name(5).starts_with("projects/from-key/databases/(default)/documents/"));
    }

    #[test]
    fn test_configured_project_id_wins_over_key() {
        let firestore = FirestoreConfig {
            project_id: "configured".to_string(),
            ..FirestoreConfig::default()
        };
        let key = r#"{"project_id": "from-key"}"#;
        assert_eq!(resolve_project_id(&firestore, Some(key)).as_deref(), Some("configured"));
        assert_eq!(
            resolve_project_id(&FirestoreConfig::default(), Some(key)).as_deref(),
            Some("from-key")
        );
        assert_eq!(resolve_project_id(&FirestoreConfig::default(), None), None);
    }

    #[test]
    fn test_invalid_service_account_is_rejected() {
        let mut cfg = config("http://localhost", None);
        cfg.firestore.credentials_json = Some("not json at all".to_string());
        assert!(matches!(
            FirestoreStore::new(&cfg),
            Err(BotError::StorageUnavailable(_))
        ));
    }

    #[test]
    fn test_unreadable_key_file_is_rejected() {
        let mut cfg = config("http://localhost", None);
        cfg.firestore.credentials_file = Some("/nonexistent/sa.json".into());
        assert!(matches!(
            FirestoreStore::new(&cfg),
            Err(BotError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_reverses_to_chronological() {
        let mut server = mockito::Server::new_async().await;
        let body = json!([
            doc("bot", "newest", "2024-01-01T10:02:00Z"),
            doc("user", "middle", "2024-01-01T10:01:00Z"),
            { "readTime": "2024-01-01T00:00:00Z" },
            doc("user", "oldest", "2024-01-01T10:00:00Z"),
        ]);
        let mock = server
            .mock(
                "POST",
                Matcher::Regex(
                    r"/documents/artifacts/friends/public/data/telegram_chat_history/-100:runQuery"
                        .to_string(),
                ),
            )
            .match_header("authorization", "Bearer token-123")
            .match_body(Matcher::PartialJson(json!({
                "structuredQuery": { "limit": 10 }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let store = FirestoreStore::new(&config(&server.url(), Some("token-123"))).unwrap();
        let entries = store.recent(-100, 10).await.unwrap();

        mock.assert_async().await;
        let texts: Vec<_> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["oldest", "middle", "newest"]);
        assert_eq!(entries[2].role, Role::Bot);
        assert_eq!(entries[0].sender_id, 42);
        assert_eq!(entries[0].sender_name, "alice");
    }

    #[tokio::test]
    async fn test_token_is_fetched_for_every_request() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", Matcher::Regex(":runQuery$".to_string()))
            .match_header("authorization", "Bearer token-1")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", Matcher::Regex(":runQuery$".to_string()))
            .match_header("authorization", "Bearer token-2")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let store = FirestoreStore::new(&config(&server.url(), None))
            .unwrap()
            .with_tokens(Arc::new(RotatingTokens::default()));

        assert!(store.recent(1, 10).await.unwrap().is_empty());
        assert!(store.recent(1, 10).await.unwrap().is_empty());
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_append_commits_with_server_timestamp() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                Matcher::Regex(
                    r"/projects/demo-project/databases/\(default\)/documents:commit$".to_string(),
                ),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(
                    r#""name":"projects/demo-project/databases/\(default\)/documents/artifacts/friends/public/data/telegram_chat_history/7/messages/[0-9a-f]{32}""#
                        .to_string(),
                ),
                Matcher::Regex(r#""setToServerValue":"REQUEST_TIME""#.to_string()),
                Matcher::Regex(r#""text":\{"stringValue":"hello there"\}"#.to_string()),
                Matcher::Regex(r#""sender_id":\{"integerValue":"42"\}"#.to_string()),
            ]))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let store = FirestoreStore::new(&config(&server.url(), None)).unwrap();
        let entry = ChatHistoryEntry {
            role: Role::User,
            text: "hello there".to_string(),
            sender_id: 42,
            sender_name: "Ali".to_string(),
            timestamp: Utc::now(),
        };
        store.append(7, &entry).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_storage_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let store = FirestoreStore::new(&config(&server.url(), None)).unwrap();
        let err = store.recent(1, 10).await.unwrap_err();
        assert!(matches!(err, BotError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_expired_token_surfaces_as_storage_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error": {"status": "UNAUTHENTICATED"}}"#)
            .create_async()
            .await;

        let store = FirestoreStore::new(&config(&server.url(), Some("stale"))).unwrap();
        let err = store.recent(1, 10).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
