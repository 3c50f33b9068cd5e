use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bot::{self, AppState};
use crate::platform::telegram::parse_update;

/// Header Telegram echoes back when the webhook was registered with a secret.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .route("/debug", get(debug_info))
        .route("/set_webhook", get(set_webhook))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight updates and history
/// writes finish for up to `grace`.
pub async fn serve<F>(state: Arc<AppState>, shutdown: F, grace: Duration) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state.config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("Webhook server listening on {}", addr);

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    drain(&state.tasks, grace).await;
    Ok(())
}

/// Stop accepting tracked work and wait for what is running. Returns `false`
/// when `grace` ran out first.
pub async fn drain(tasks: &TaskTracker, grace: Duration) -> bool {
    tasks.close();
    if tasks.is_empty() {
        return true;
    }
    info!("Waiting for {} in-flight task(s)", tasks.len());
    match tokio::time::timeout(grace, tasks.wait()).await {
        Ok(()) => {
            info!("All in-flight work finished");
            true
        }
        Err(_) => {
            warn!("Shutdown grace period elapsed with {} task(s) still running", tasks.len());
            false
        }
    }
}

/// Wait for ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn secret_matches(provided: Option<&str>, expected: &str) -> bool {
    provided.is_some_and(|p| bool::from(p.as_bytes().ct_eq(expected.as_bytes())))
}

/// Point Telegram at `<public_url>/webhook`. `Ok(None)` when no public URL
/// is configured.
pub async fn register_webhook(state: &AppState) -> Result<Option<String>> {
    let Some(url) = state.config.telegram.webhook_url() else {
        return Ok(None);
    };
    state
        .messenger
        .set_webhook(&url, state.config.telegram.webhook_secret.as_deref())
        .await?;
    info!("Webhook registered at {}", url);
    Ok(Some(url))
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(secret) = &state.config.telegram.webhook_secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if !secret_matches(provided, secret) {
            warn!("Rejecting webhook call with missing or wrong secret token");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "ok": false })));
        }
    }

    match parse_update(&body, &state.me) {
        Ok(Some(msg)) => {
            let worker = Arc::clone(&state);
            state.tasks.spawn(async move {
                bot::handle_message(&worker, msg).await;
            });
        }
        Ok(None) => debug!("Update carries no text message; skipping"),
        Err(e) => warn!("Dropping update: {}", e),
    }

    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn debug_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "telegram_token_set": !config.telegram.bot_token.is_empty(),
        "webhook_secret_set": config.telegram.webhook_secret.is_some(),
        "public_url_set": config.telegram.public_url.is_some(),
        "llm_api_key_set": !config.llm.api_key.is_empty(),
        "llm_api_url": config.llm.api_url,
        "llm_model": config.llm.model,
        "app_id": config.history.app_id,
        "history_backend": state.history.backend().to_string(),
        "firestore_project_id_set": !config.history.firestore.project_id.is_empty(),
        "firestore_credentials_set": config.history.firestore.access_token.is_some()
            || config.history.firestore.credentials_json.is_some()
            || config.history.firestore.credentials_file.is_some(),
        "users_loaded": state.users.len(),
        "bot": {
            "id": state.me.id,
            "username": state.me.username,
        },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn set_webhook(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match register_webhook(&state).await {
        Ok(Some(url)) => (StatusCode::OK, Json(json!({ "ok": true, "url": url }))),
        Ok(None) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": "PUBLIC_URL is not set" })),
        ),
        Err(e) => {
            error!("setWebhook failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
        }
    }
}
