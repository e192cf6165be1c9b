//! Error taxonomy for cluster provisioning.
//!
//! The variants map onto the handling policy of the orchestrator:
//! connectivity errors are retried inside polling loops, command errors
//! abort the current step, and teardown reclassifies expected transient
//! failures before they ever become an [`Error`].

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while provisioning or tearing down a cluster.
#[derive(Error, Debug)]
pub enum Error {
    /// A node or API endpoint could not be reached.
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// A remote or local command ran but reported failure.
    #[error("{step} failed: {message}")]
    Command { step: String, message: String },

    /// A readiness wait ran out of time.
    #[error(
        "timed out after {}s waiting for {}{}",
        .elapsed.as_secs(),
        .what,
        last_error_suffix(.last_error.as_deref())
    )]
    Timeout {
        what: String,
        elapsed: Duration,
        last_error: Option<String>,
    },

    /// A wait or provisioning run was cancelled by the caller.
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// The cluster definition is invalid.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// An immutable attribute changed; the cluster must be recreated.
    #[error("{field} cannot be changed on an existing cluster; destroy and recreate it")]
    RequiresReplacement { field: String },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn last_error_suffix(last: Option<&str>) -> String {
    last.map(|e| format!(" (last error: {e})")).unwrap_or_default()
}

impl Error {
    /// Create a command error for the named step.
    pub fn command(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create a connection error for the given target.
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a replacement-required error for the named attribute.
    pub fn requires_replacement(field: impl Into<String>) -> Self {
        Self::RequiresReplacement {
            field: field.into(),
        }
    }
}
