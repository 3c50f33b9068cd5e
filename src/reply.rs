use tracing::{error, info, warn};

use crate::config::PersonaConfig;
use crate::history::ChatHistoryEntry;
use crate::llm::LlmClient;

fn default_persona(persona: &PersonaConfig) -> String {
    let name = &persona.name;
    let special = &persona.special_person;
    format!(
        "You are \"{name}\", a Telegram chatbot with the personality of a quick-witted, \
slightly sarcastic, but ultimately helpful and friendly AI. You live in a group chat with \
close friends. Your goal is humorous, engaging and personalized replies.\n\n\
Rules:\n\
1. Always use the name of the person you are talking to.\n\
2. If the person is {special}, act as {special}'s girlfriend: affectionate, playful, a little \
teasing, always supportive. For anyone else keep a friendly, witty, slightly sarcastic tone.\n\
3. Be clever and use light sarcasm; witty, never mean. Write like a human, not a machine.\n\
4. Respond directly to what was said before adding commentary. Use the recent conversation \
for context.\n\
5. Keep it short: one to three sentences."
    )
}

/// Build the full prompt sent to the generation endpoint.
pub fn build_prompt(
    persona: &str,
    history: &[ChatHistoryEntry],
    display_name: &str,
    text: &str,
) -> String {
    let mut prompt = persona.trim_end().to_string();

    if !history.is_empty() {
        let lines: Vec<String> = history
            .iter()
            .map(|entry| format!("[{}] {}: {}", entry.role.as_str(), entry.sender_name, entry.text))
            .collect();
        prompt.push_str("\n\nRecent conversation:\n");
        prompt.push_str(&lines.join("\n"));
    }

    prompt.push_str(&format!("\n\nNew message from {}:\n{}", display_name, text));
    prompt
}

pub fn fallback_reply(display_name: &str) -> String {
    format!(
        "Hey {}! I'm having trouble connecting to my AI brain right now. \
Try again in a bit, or ask me something simple like 'who are you?'",
        display_name
    )
}

pub fn unconfigured_reply(display_name: &str) -> String {
    format!(
        "Hey {}, my brain is on airplane mode right now. \
Try again once the API key finds its coffee.",
        display_name
    )
}

/// Turns a message plus recent history into the bot's reply. Never fails:
/// every error path ends in a canned fallback line.
pub struct ReplyGenerator {
    llm: LlmClient,
    persona: String,
}

impl ReplyGenerator {
    pub fn new(llm: LlmClient, persona: &PersonaConfig) -> Self {
        let persona = persona
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_persona(persona));
        Self { llm, persona }
    }

    #[cfg(test)]
    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub async fn generate(
        &self,
        display_name: &str,
        text: &str,
        history: &[ChatHistoryEntry],
    ) -> String {
        if !self.llm.is_configured() {
            warn!("LLM credentials missing; sending the airplane-mode reply");
            return unconfigured_reply(display_name);
        }

        let prompt = build_prompt(&self.persona, history, display_name, text);
        info!(
            "Generating reply for {} with {} history entries (model {})",
            display_name,
            history.len(),
            self.llm.model()
        );

        match self.llm.complete(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Reply generation failed: {}", e);
                fallback_reply(display_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::history::Role;
    use crate::llm::RetryPolicy;
    use chrono::Utc;
    use std::time::Duration;

    fn entry(role: Role, name: &str, text: &str) -> ChatHistoryEntry {
        ChatHistoryEntry {
            role,
            text: text.to_string(),
            sender_id: 1,
            sender_name: name.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn generator(api_url: &str) -> ReplyGenerator {
        let llm = LlmClient::new(LlmConfig {
            api_url: api_url.to_string(),
            api_key: "sk-test".to_string(),
            ..LlmConfig::default()
        })
        .with_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
        });
        ReplyGenerator::new(llm, &PersonaConfig::default())
    }

    #[test]
    fn test_prompt_layout() {
        let history = vec![
            entry(Role::User, "alice", "anyone up?"),
            entry(Role::Bot, "ShrutiBot", "always, sadly"),
        ];
        let prompt = build_prompt("You are Shruti.", &history, "Mufid", "miss me?");
        assert_eq!(
            prompt,
            "You are Shruti.\n\nRecent conversation:\n\
[user] alice: anyone up?\n\
[bot] ShrutiBot: always, sadly\n\
\nNew message from Mufid:\nmiss me?"
        );
    }

    #[test]
    fn test_prompt_without_history() {
        let prompt = build_prompt("Persona", &[], "Alex", "hi");
        assert_eq!(prompt, "Persona\n\nNew message from Alex:\nhi");
        assert!(!prompt.contains("Recent conversation"));
    }

    #[test]
    fn test_default_persona_mentions_names() {
        let generator = ReplyGenerator::new(
            LlmClient::new(LlmConfig::default()),
            &PersonaConfig::default(),
        );
        assert!(generator.persona().contains("\"Shruti\""));
        assert!(generator.persona().contains("Mufid"));
    }

    #[test]
    fn test_custom_system_prompt() {
        let persona = PersonaConfig {
            system_prompt: Some("Be brief.".to_string()),
            ..PersonaConfig::default()
        };
        let generator = ReplyGenerator::new(LlmClient::new(LlmConfig::default()), &persona);
        assert_eq!(generator.persona(), "Be brief.");
    }

    #[tokio::test]
    async fn test_unconfigured_llm_uses_airplane_reply() {
        let generator = ReplyGenerator::new(
            LlmClient::new(LlmConfig::default()),
            &PersonaConfig::default(),
        );
        let reply = generator.generate("Alex", "hi", &[]).await;
        assert_eq!(reply, unconfigured_reply("Alex"));
    }

    #[tokio::test]
    async fn test_three_transient_failures_fall_back() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let generator = generator(&format!("{}/chat", server.url()));
        let reply = generator.generate("Priya", "hello", &[]).await;

        assert_eq!(reply, fallback_reply("Priya"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generated_text_is_returned() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body(r#"{"choices": [{"message": {"content": "Priya, bold of you to assume I sleep."}}]}"#)
            .create_async()
            .await;

        let generator = generator(&format!("{}/chat", server.url()));
        let reply = generator
            .generate("Priya", "are you awake?", &[entry(Role::User, "priya", "hey")])
            .await;
        assert_eq!(reply, "Priya, bold of you to assume I sleep.");
    }
}
