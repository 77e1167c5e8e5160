use thiserror::Error;

/// Errors surfaced by venue calls, market analysis and startup validation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BotError {
    /// Network failure or timeout that survived every retry
    #[error("transient network failure after {attempts} attempt(s): {reason}")]
    TransientNetwork { attempts: u32, reason: String },

    #[error("rate limited by exchange after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    /// Non-retryable business error returned by the venue
    #[error("exchange rejected request ({code}): {message}")]
    ExchangeRejected { code: i64, message: String },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed exchange response: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(String),

    /// The position state machine refused a transition
    #[error("invalid position transition: {0}")]
    InvalidState(String),
}

impl BotError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BotError::TransientNetwork { .. } | BotError::RateLimited { .. }
        )
    }

    /// Short stable label, used for log fields and failure de-duplication
    pub fn kind(&self) -> &'static str {
        match self {
            BotError::TransientNetwork { .. } => "transient_network",
            BotError::RateLimited { .. } => "rate_limited",
            BotError::ExchangeRejected { .. } => "exchange_rejected",
            BotError::InsufficientData(_) => "insufficient_data",
            BotError::Configuration(_) => "configuration",
            BotError::Decode(_) => "decode",
            BotError::Io(_) => "io",
            BotError::InvalidState(_) => "invalid_state",
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Decode(err.to_string())
    }
}
