use thiserror::Error;

pub type Result<T> = std::result::Result<T, GuestError>;

/// Failure taxonomy shared by every guest-mode component.
///
/// Recoverable per-component conditions (a malformed stream line, a single
/// endpoint miss) never reach this type; anything that prevents a
/// `GenerationResult` does.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuestError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("token acquisition failed: {0}")]
    TokenAcquisition(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    RateLimited,
    TokenAcquisition,
    Validation,
    Unauthorized,
}

impl GuestError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited(message.into())
    }

    pub fn token(message: impl Into<String>) -> Self {
        Self::TokenAcquisition(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::TokenAcquisition(_) => ErrorKind::TokenAcquisition,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
        }
    }

    /// Message without the category prefix, as carried in batch outcomes.
    pub fn message(&self) -> &str {
        match self {
            Self::Transport(message)
            | Self::Protocol(message)
            | Self::RateLimited(message)
            | Self::TokenAcquisition(message)
            | Self::Validation(message)
            | Self::Unauthorized(message) => message,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }
}

impl From<std::io::Error> for GuestError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
