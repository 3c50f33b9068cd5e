//! Prints who the configured token belongs to, plus the steps for filling in
//! `users.json`.
//!
//! Usage: `cargo run --bin bot_info` with `TELEGRAM_TOKEN` set (or in `.env`).

use anyhow::{Context, Result};
use serde_json::json;
use teloxide::prelude::*;

fn report(username: &str, id: u64, first_name: &str) -> String {
    let example = json!({
        "some_username": "Display Name",
        "123456789": "Name For A User Without Username",
    });
    let example = serde_json::to_string_pretty(&example).unwrap_or_default();

    format!(
        "🤖 Bot: @{username} (ID: {id})\n\
📝 Bot Name: {first_name}\n\
\n\
✅ Bot is working! Now:\n\
1. Add this bot to your group\n\
2. Mention @{username} in the group; the server log shows each sender's id and username\n\
3. Map usernames (lowercase, without @) or numeric ids to display names in users.json:\n\
\n\
{example}\n"
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let token = std::env::var("TELEGRAM_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .context("TELEGRAM_TOKEN not found in environment variables")?;

    let bot = Bot::new(token.trim());
    let me = bot.get_me().await.context("Error getting bot info")?;

    print!("{}", report(me.username(), me.id.0, &me.first_name));
    Ok(())
}
