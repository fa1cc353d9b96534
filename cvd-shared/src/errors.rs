//! Error types shared by the launcher, its helpers and the CLI.

use thiserror::Error;

/// Result type for launcher operations.
pub type CvdResult<T> = Result<T, CvdError>;

/// Errors that can occur while bringing up or tearing down an instance.
#[derive(Debug, Error)]
pub enum CvdError {
    /// Bad or missing settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Directory, file, socket or shared memory creation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A helper process could not be spawned.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Short read or unexpected bytes on a pipe or socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The host is not configured for virtualization.
    ///
    /// Carries copy-pasteable commands that fix the host.
    #[error("host is not configured: {reason}")]
    HostValidation {
        reason: String,
        commands: Vec<String>,
    },

    /// Delivering a termination signal failed.
    #[error("signal delivery failed: {0}")]
    Signal(String),

    /// The VM backend failed to start or stop.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CvdError {
    /// Remediation commands attached to the error, if any.
    pub fn remediation(&self) -> &[String] {
        match self {
            CvdError::HostValidation { commands, .. } => commands,
            _ => &[],
        }
    }
}
