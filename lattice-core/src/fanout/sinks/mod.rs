//! Target-specific sink clients. Each client delivers one chunk of claimed
//! outbox jobs and classifies failures so the worker can pick between
//! retry, terminal failure, and runtime disable.

pub mod analytic;
pub mod archival;
pub mod observability;
pub mod raw;
pub mod vector;

use async_trait::async_trait;

use crate::outbox::{FanoutTarget, OutboxJob};

pub use analytic::AnalyticSink;
pub use archival::ArchivalSink;
pub use observability::ObservabilitySink;
pub use raw::RawEventSink;
pub use vector::VectorSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// Worth retrying with backoff.
    Transient,
    /// The sink rejected the write in a way a retry cannot fix.
    Permanent,
    /// 5xx-shaped upstream failure; counts toward the archival disable
    /// streak and retries otherwise.
    ServerShape,
}

#[derive(Debug, Clone)]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn server_shape(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::ServerShape,
            message: message.into(),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("status={} body={}", status.as_u16(), truncate(body, 300));
        if status.is_server_error() {
            Self::server_shape(message)
        } else if matches!(status.as_u16(), 400 | 404 | 405 | 410 | 422) {
            Self::permanent(message)
        } else {
            Self::transient(message)
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        raw.to_string()
    } else {
        let mut cut = max;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &raw[..cut])
    }
}

/// One chunk of rows delivered to one target. Chunk-level success marks
/// every row succeeded; a chunk-level error applies the same classification
/// to every row (the dedupe key makes redelivery harmless).
#[async_trait]
pub trait FanoutSink: Send + Sync {
    fn target(&self) -> FanoutTarget;

    async fn deliver(&self, jobs: &[OutboxJob]) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let not_found = SinkError::from_status(reqwest::StatusCode::NOT_FOUND, "missing");
        assert_eq!(not_found.kind, SinkErrorKind::Permanent);
        let unavailable =
            SinkError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert_eq!(unavailable.kind, SinkErrorKind::ServerShape);
        let teapot = SinkError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow");
        assert_eq!(teapot.kind, SinkErrorKind::Transient);
    }
}
