//! Typed error hierarchy for the Roseram workspace orchestrator.
//!
//! Three top-level enums cover the three layers:
//! - `ServiceError`: failures reported by the GitHub and sandbox collaborators
//! - `WorkspaceError`: commands the orchestrator refuses to apply
//! - `ConfigError`: configuration loading and validation failures

use thiserror::Error;

/// Errors from an external collaborator (GitHub branch API, sandbox API).
///
/// These never cross the orchestrator boundary as errors: the state machines
/// record them on the session (`Failed(reason)` / `Error(message)`) or absorb
/// them as skipped poll ticks, depending on [`ServiceError::is_transient`].
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    /// Transient failures are network blips and overloaded upstreams; everything
    /// else is an authoritative answer from the service.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transport(_) => true,
            ServiceError::Api { status, .. } => *status >= 500 || *status == 429,
            ServiceError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ServiceError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ServiceError::Transport(err.to_string())
        }
    }
}

/// Commands rejected by the session orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    #[error("No session for {key}")]
    UnknownSession { key: String },

    #[error("Cannot {command} while {from}")]
    InvalidTransition {
        from: &'static str,
        command: &'static str,
    },

    #[error("Branch '{branch}' was not offered as a fallback")]
    BranchNotOffered { branch: String },

    #[error("Preview for {key} is not running")]
    PreviewNotRunning { key: String },

    #[error("No working branch acquired for {key}")]
    NoBranch { key: String },
}

/// Errors from loading `.roseram/roseram.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
