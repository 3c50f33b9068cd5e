mod bot;
mod config;
mod error;
mod history;
mod identity;
mod llm;
mod platform;
mod reply;
mod server;
mod trigger;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;
use crate::identity::UserDirectory;
use crate::platform::telegram::{self, TelegramMessenger};

/// How long in-flight replies and history writes may run after a shutdown
/// signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shruti_bot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.llm.model);
    info!("  LLM configured: {}", config.llm.is_configured());
    info!("  History backend: {}", config.history.backend);
    info!("  Listening on: {}", config.server.bind_address());

    let users = UserDirectory::load(&config.users_file);
    if users.is_empty() {
        info!("No display-name mapping loaded; replies will use first names");
    }

    let bot = Bot::new(&config.telegram.bot_token);
    let me = telegram::identify(&bot)
        .await
        .context("Could not reach Telegram with the configured token")?;
    info!("Running as @{} ({})", me.username, me.id);

    // Create shared state
    let messenger = Arc::new(TelegramMessenger::new(bot));
    let state = Arc::new(AppState::new(config, me, users, messenger));

    match server::register_webhook(&state).await {
        Ok(Some(_)) => {}
        Ok(None) => info!("No public URL configured; call /set_webhook once it is known"),
        Err(e) => warn!("Automatic webhook registration failed: {:#}", e),
    }

    info!("Bot is starting...");
    server::serve(state, server::shutdown_signal(), SHUTDOWN_GRACE).await?;

    info!("Bot stopped");

    Ok(())
}
