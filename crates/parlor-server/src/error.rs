use parlor_core::ErrorCode;
use parlor_store::StoreError;

/// Why a command produced an error frame instead of a success.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("rejected: {}", .0.message())]
    Rejected(ErrorCode),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommandError {
    /// Store failures are never shown to clients in detail.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Rejected(code) => *code,
            Self::Store(_) => ErrorCode::Internal,
        }
    }
}

impl From<ErrorCode> for CommandError {
    fn from(code: ErrorCode) -> Self {
        Self::Rejected(code)
    }
}

/// A frame could not be queued for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("send queue full")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// The server could not start.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}
