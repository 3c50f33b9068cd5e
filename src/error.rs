use thiserror::Error;

/// Failure taxonomy shared by the reply pipeline.
///
/// None of these escape the webhook handler: the generator and the history
/// adapter each map them to a fallback value and a log line.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("missing required setting: {0}")]
    ConfigurationMissing(&'static str),

    #[error("generation endpoint unavailable: {0}")]
    TransientProvider(String),

    #[error("generation endpoint rejected the request ({status}): {body}")]
    PermanentProvider { status: u16, body: String },

    #[error("unexpected generation response: {0}")]
    MalformedProviderResponse(String),

    #[error("history store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("malformed inbound payload: {0}")]
    MalformedPayload(String),
}

impl BotError {
    /// Whether another attempt against the generation endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::TransientProvider(_))
    }

    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        BotError::TransientProvider(err.to_string())
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        BotError::StorageUnavailable(err.to_string())
    }
}
