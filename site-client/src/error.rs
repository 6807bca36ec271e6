//! Error types for the site client.

/// Local storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Failures talking to the identity provider.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The provider answered with an error body.
    #[error("{message}")]
    Provider {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Identity provider unreachable: {0}")]
    Transport(String),

    #[error("Invalid response from identity provider: {0}")]
    InvalidResponse(String),
}

impl IdentityError {
    pub fn status(&self) -> Option<u16> {
        match self {
            IdentityError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for IdentityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            IdentityError::InvalidResponse(err.to_string())
        } else {
            IdentityError::Transport(err.to_string())
        }
    }
}

/// Failures talking to the record store.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("{message}")]
    Store {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Record store unreachable: {0}")]
    Transport(String),

    #[error("Unexpected record shape: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for RecordError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RecordError::Decode(err.to_string())
        } else {
            RecordError::Transport(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RecordError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RecordError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Decode(err.to_string())
    }
}

/// Failures while wiring the client together.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Unknown session backend: {0}")]
    UnknownSessionBackend(String),

    #[error("No session backends configured")]
    NoSessionBackends,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
