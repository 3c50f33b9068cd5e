use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BotError;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Firestore,
    Memory,
    None,
}

impl std::fmt::Display for HistoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryBackend::Firestore => write!(f, "firestore"),
            HistoryBackend::Memory => write!(f, "memory"),
            HistoryBackend::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for HistoryBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(HistoryBackend::Firestore),
            "memory" => Ok(HistoryBackend::Memory),
            "none" | "off" | "" => Ok(HistoryBackend::None),
            other => anyhow::bail!("unknown history backend: {}", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Optional JSON object mapping usernames or user ids to display names.
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            llm: LlmConfig::default(),
            history: HistoryConfig::default(),
            persona: PersonaConfig::default(),
            server: ServerConfig::default(),
            users_file: default_users_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Public base URL; the webhook is registered at `<public_url>/webhook`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Value Telegram echoes in `X-Telegram-Bot-Api-Secret-Token`.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl TelegramConfig {
    pub fn webhook_url(&self) -> Option<String> {
        self.public_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| format!("{}/webhook", u.trim_end_matches('/')))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Full chat-completions endpoint URL.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default)]
    pub backend: HistoryBackend,
    /// Application namespace used in the document path.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_history_window")]
    pub window: usize,
    #[serde(default)]
    pub firestore: FirestoreConfig,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::default(),
            app_id: default_app_id(),
            window: default_history_window(),
            firestore: FirestoreConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FirestoreConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Fixed OAuth2 bearer token. Takes precedence over service-account
    /// credentials; it is never refreshed.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Service-account key file; bearer tokens are minted and refreshed from it.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    /// Service-account key as inline JSON. Wins over `credentials_file`.
    #[serde(default)]
    pub credentials_json: Option<String>,
    #[serde(default = "default_firestore_base_url")]
    pub base_url: String,
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            api_key: None,
            access_token: None,
            credentials_file: None,
            credentials_json: None,
            base_url: default_firestore_base_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,
    /// The one person the relationship question is about.
    #[serde(default = "default_special_person")]
    pub special_person: String,
    #[serde(default = "default_identity_reply")]
    pub identity_reply: String,
    #[serde(default = "default_relationship_reply")]
    pub relationship_reply: String,
    /// Overrides the built-in persona preamble.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            special_person: default_special_person(),
            identity_reply: default_identity_reply(),
            relationship_reply: default_relationship_reply(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.json")
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    220
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_attempt_timeout_ms() -> u64 {
    20_000
}

fn default_app_id() -> String {
    "app".to_string()
}

fn default_history_window() -> usize {
    10
}

fn default_firestore_base_url() -> String {
    "https://firestore.googleapis.com/v1".to_string()
}

fn default_persona_name() -> String {
    "Shruti".to_string()
}

fn default_special_person() -> String {
    "Mufid".to_string()
}

fn default_identity_reply() -> String {
    "I'm Shruti.".to_string()
}

fn default_relationship_reply() -> String {
    "He's my ex-boyfriend, but I still connect with him.".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Config {
    /// Load the TOML file at `path` (defaults when it does not exist), then
    /// apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is injected so tests do
    /// not have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("TELEGRAM_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = get("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(v);
        }
        if let Some(v) = get("PUBLIC_URL").or_else(|| get("RENDER_EXTERNAL_URL")) {
            self.telegram.public_url = Some(v);
        }
        if let Some(v) = get("LLM_API_URL") {
            self.llm.api_url = v;
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("APP_ID") {
            self.history.app_id = v;
        }
        if let Some(v) = get("HISTORY_BACKEND") {
            self.history.backend = v.parse()?;
        }
        if let Some(v) = get("FIRESTORE_PROJECT_ID") {
            self.history.firestore.project_id = v;
        }
        if let Some(v) = get("FIRESTORE_API_KEY") {
            self.history.firestore.api_key = Some(v);
        }
        if let Some(v) = get("FIRESTORE_ACCESS_TOKEN") {
            self.history.firestore.access_token = Some(v);
        }
        if let Some(v) = get("FIREBASE_CONFIG") {
            self.history.firestore.credentials_json = Some(v);
        }
        if let Some(v) = get("GOOGLE_APPLICATION_CREDENTIALS") {
            self.history.firestore.credentials_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("USERS_FILE") {
            self.users_file = PathBuf::from(v);
        }
        if let Some(v) = get("HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {}", v))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(BotError::ConfigurationMissing("telegram.bot_token").into());
        }
        Ok(())
    }
}
