use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::history::{ChatHistoryEntry, HistoryAdapter, Role};
use crate::identity::UserDirectory;
use crate::llm::LlmClient;
use crate::platform::{BotIdentity, IncomingMessage, Messenger};
use crate::reply::ReplyGenerator;
use crate::trigger::{Decision, TriggerEvaluator};

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub me: BotIdentity,
    pub users: UserDirectory,
    pub triggers: TriggerEvaluator,
    pub history: Arc<HistoryAdapter>,
    pub replies: ReplyGenerator,
    pub messenger: Arc<dyn Messenger>,
    /// Webhook processing and history writes still in flight; drained on
    /// shutdown.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(
        config: Config,
        me: BotIdentity,
        users: UserDirectory,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let triggers = TriggerEvaluator::new(&me.username, &config.persona);
        let history = Arc::new(HistoryAdapter::new(config.history.clone()));
        let replies = ReplyGenerator::new(LlmClient::new(config.llm.clone()), &config.persona);
        Self {
            config,
            me,
            users,
            triggers,
            history,
            replies,
            messenger,
            tasks: TaskTracker::new(),
        }
    }

    #[cfg(test)]
    pub fn with_history(mut self, history: HistoryAdapter) -> Self {
        self.history = Arc::new(history);
        self
    }
}

/// What the pipeline did with one message.
#[derive(Debug)]
pub enum Outcome {
    Ignored,
    Canned(String),
    Replied {
        text: String,
        /// Detached history write; its result never reaches the caller.
        persistence: JoinHandle<()>,
    },
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(100).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

async fn send(state: &AppState, chat_id: i64, text: &str) {
    if let Err(e) = state.messenger.send_text(chat_id, text).await {
        error!("Failed to send message to chat {}: {:#}", chat_id, e);
    }
}

/// Run one inbound message through trigger → history → generation → send,
/// then persist the exchange in the background.
pub async fn handle_message(state: &AppState, msg: IncomingMessage) -> Outcome {
    let display_name = state.users.display_name(
        msg.sender_username.as_deref(),
        msg.sender_id,
        &msg.sender_first_name,
    );

    let reply = match state.triggers.evaluate(&msg) {
        Decision::Ignore => {
            debug!("Ignoring message in chat {}", msg.chat_id);
            return Outcome::Ignored;
        }
        Decision::Canned(text) => {
            info!("Canned reply for {} in chat {}", display_name, msg.chat_id);
            send(state, msg.chat_id, &text).await;
            return Outcome::Canned(text);
        }
        Decision::Respond => {
            info!(
                "Message from {} ({}) in chat {}: {}",
                display_name,
                msg.sender_id,
                msg.chat_id,
                preview(&msg.text)
            );

            // Send "typing" indicator
            state.messenger.send_typing(msg.chat_id).await.ok();

            let history = state.history.fetch_recent(msg.chat_id).await;
            state
                .replies
                .generate(&display_name, &msg.text, &history)
                .await
        }
    };

    send(state, msg.chat_id, &reply).await;

    let persistence = spawn_persist(state, &msg, &display_name, &reply);
    Outcome::Replied {
        text: reply,
        persistence,
    }
}

fn spawn_persist(
    state: &AppState,
    msg: &IncomingMessage,
    display_name: &str,
    reply: &str,
) -> JoinHandle<()> {
    let history = Arc::clone(&state.history);
    let chat_id = msg.chat_id;

    let user_entry = ChatHistoryEntry {
        role: Role::User,
        text: msg.text.clone(),
        sender_id: msg.sender_id,
        // Same name the prompt uses for the new message.
        sender_name: display_name.to_string(),
        timestamp: msg.timestamp,
    };
    let bot_entry = ChatHistoryEntry {
        role: Role::Bot,
        text: reply.to_string(),
        sender_id: state.me.id,
        sender_name: if state.me.username.is_empty() {
            format!("{}Bot", state.config.persona.name)
        } else {
            state.me.username.clone()
        },
        timestamp: Utc::now(),
    };

    state.tasks.spawn(async move {
        history.append(chat_id, &user_entry).await;
        history.append(chat_id, &bot_entry).await;
    })
}
