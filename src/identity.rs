use std::collections::HashMap;
use std::path::Path;

use tracing::{error, info, warn};

/// Static username/user-id → display name mapping, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    names: HashMap<String, String>,
}

impl UserDirectory {
    /// Build from `(key, display name)` pairs. Keys are matched
    /// case-insensitively.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let names = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().trim().to_lowercase(), v.into()))
            .collect();
        Self { names }
    }

    /// Load a JSON object file. A missing or unreadable file yields an empty
    /// directory; lookups then fall back to the platform first name.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(
                "{} not found; using Telegram first names as display names",
                path.display()
            );
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(serde_json::Value::Object(map)) => {
                let pairs = map.into_iter().map(|(k, v)| {
                    let name = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, name)
                });
                let directory = Self::from_pairs(pairs);
                info!(
                    "Loaded {} display names from {}",
                    directory.len(),
                    path.display()
                );
                directory
            }
            Ok(_) => {
                warn!("{} is not a JSON object; ignoring it", path.display());
                Self::default()
            }
            Err(e) => {
                error!("Failed to parse {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Username first, then numeric id, then the first name Telegram sent.
    pub fn display_name(&self, username: Option<&str>, user_id: u64, first_name: &str) -> String {
        username
            .map(|u| u.trim_start_matches('@').to_lowercase())
            .and_then(|u| self.names.get(&u))
            .or_else(|| self.names.get(&user_id.to_string()))
            .cloned()
            .unwrap_or_else(|| {
                if first_name.trim().is_empty() {
                    "there".to_string()
                } else {
                    first_name.to_string()
                }
            })
    }
}
