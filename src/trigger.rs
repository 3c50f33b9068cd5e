use crate::config::PersonaConfig;
use crate::platform::telegram::strip_mention;
use crate::platform::{ChatKind, IncomingMessage};

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Ignore,
    Canned(String),
    Respond,
}

/// Decides whether and how the bot answers. Pure; holds only the persona's
/// fixed lines.
pub struct TriggerEvaluator {
    bot_username: String,
    special_person: String,
    identity_reply: String,
    relationship_reply: String,
}

impl TriggerEvaluator {
    pub fn new(bot_username: &str, persona: &PersonaConfig) -> Self {
        Self {
            bot_username: bot_username.to_string(),
            special_person: normalize(&persona.special_person),
            identity_reply: persona.identity_reply.clone(),
            relationship_reply: persona.relationship_reply.clone(),
        }
    }

    pub fn evaluate(&self, msg: &IncomingMessage) -> Decision {
        // Commands are someone else's business.
        if msg.text.starts_with('/') {
            return Decision::Ignore;
        }

        match msg.chat_kind {
            ChatKind::Private => {}
            ChatKind::Group if msg.mentions_bot || msg.is_reply_to_bot => {}
            ChatKind::Group | ChatKind::Channel => return Decision::Ignore,
        }

        let clean = normalize(&strip_mention(&msg.text, &self.bot_username));
        if is_identity_query(&clean) {
            return Decision::Canned(self.identity_reply.clone());
        }
        if self.is_relationship_query(&clean) {
            return Decision::Canned(self.relationship_reply.clone());
        }

        Decision::Respond
    }

    fn is_relationship_query(&self, clean: &str) -> bool {
        let person = self.special_person.as_str();
        if person.is_empty() || !clean.contains(person) {
            return false;
        }
        clean.contains("relationship")
            || clean.contains("dating")
            || clean.contains(&format!("who is {} to you", person))
    }
}

/// Lowercase and collapse runs of whitespace.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_identity_query(clean: &str) -> bool {
    clean.contains("who are you")
}
