//! Non-fatal warnings collected during config load, plus the hard startup
//! rules that can refuse to boot the server.

use thiserror::Error;

/// A single configuration concern worth logging at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning(pub String);

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings(Vec<ConfigWarning>);

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(ConfigWarning(message.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.0.iter()
    }

    /// Emit every warning through tracing at `warn` level.
    pub fn log_all(&self) {
        for warning in &self.0 {
            tracing::warn!(target: "lattice::config", "{warning}");
        }
    }
}

#[derive(Debug, Error)]
pub enum SecurityPostureError {
    #[error("LATTICE_ENV=production requires a non-empty LATTICE_API_KEY")]
    MissingApiKey,
}
