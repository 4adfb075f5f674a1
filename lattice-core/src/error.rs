use thiserror::Error;

/// Error taxonomy shared across the orchestrator.
///
/// Handlers map variants onto HTTP statuses; workers use the
/// permanent/transient split to decide between terminal failure and
/// retry-with-backoff.
#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("upstream error: {message}")]
    Upstream { message: String, permanent: bool },

    #[error("queue saturated: {0}")]
    QueueSaturation(String),

    #[error("storage integrity error: {0}")]
    Integrity(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LatticeError>;

impl LatticeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn upstream_permanent(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn is_permanent_upstream(&self) -> bool {
        matches!(self, Self::Upstream { permanent: true, .. })
    }

    /// Sqlite surfaces media-level corruption as textual errors; the outbox
    /// supervisor promotes to the document backend when it sees one.
    pub fn is_disk_integrity(&self) -> bool {
        match self {
            Self::Integrity(message) => {
                let lowered = message.to_ascii_lowercase();
                lowered.contains("disk i/o error")
                    || lowered.contains("database disk image is malformed")
                    || lowered.contains("file is not a database")
            }
            _ => false,
        }
    }
}

impl From<sqlx::Error> for LatticeError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Integrity(other.to_string()),
        }
    }
}

impl From<mongodb::error::Error> for LatticeError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Integrity(err.to_string())
    }
}

impl From<reqwest::Error> for LatticeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Upstream {
                message: err.to_string(),
                permanent: false,
            }
        }
    }
}
