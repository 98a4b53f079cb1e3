use std::time::Duration;

/// Failure of a synthesis or transcription call. Transient variants are worth
/// another attempt; terminal ones will fail the same way again.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Terminal: never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("credentials rejected: {0}")]
    Authentication(String),

    // Transient
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("provider is shedding load")]
    Overloaded,
    #[error("provider returned unusable audio: {0}")]
    InvalidAudio(String),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Network(_)
                | Self::Overloaded
                | Self::InvalidAudio(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::QuotaExhausted(_) | Self::Authentication(_)
        )
    }

    /// Wait requested by the provider itself, if any.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable label used in log fields and chunk error text.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::QuotaExhausted(_) => "quota_exhausted",
            Self::Authentication(_) => "authentication",
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network",
            Self::Overloaded => "overloaded",
            Self::InvalidAudio(_) => "invalid_audio",
            Self::Cancelled => "cancelled",
        }
    }

    /// Map a non-success HTTP response onto a variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 | 413 | 422 => Self::InvalidInput(body),
            401 | 403 => Self::Authentication(body),
            402 => Self::QuotaExhausted(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            503 | 529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidInput(format!("unexpected status {status}: {body}")),
        }
    }
}
