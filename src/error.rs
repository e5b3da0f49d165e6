/// Fatal error taxonomy
///
/// Anything in here stops the current workflow before a destructive step.
/// Recoverable findings are recorded as [`Issue`] values instead and never
/// travel through `Err`.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::utils::format_bytes;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("configuration tree not found at {0}")]
    MissingConfiguration(PathBuf),

    #[error("backup not found at {0}")]
    BackupNotFound(PathBuf),

    #[error("archive {path} is unreadable: {reason}")]
    UnreadableArchive { path: PathBuf, reason: String },

    #[error("{path} is not a valid snapshot: {reason}")]
    InvalidSnapshot { path: PathBuf, reason: String },

    #[error(
        "insufficient disk space: {} required, {} available (use --force to override)",
        format_bytes(*required),
        format_bytes(*available)
    )]
    InsufficientCapacity { required: u64, available: u64 },

    #[error("cannot reach {host}: {reason}")]
    ConnectivityProbeFailed { host: String, reason: String },

    #[error("required tool '{0}' is not available")]
    MissingTool(String),

    #[error("transfer of {artifact} failed: {reason}")]
    TransferFailed { artifact: String, reason: String },

    #[error("{stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("interrupted during {0}")]
    Interrupted(String),

    #[error("operation declined by operator")]
    Declined,
}

impl VaultError {
    /// True when the error is an operator "no" rather than a failure
    pub fn is_declined(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<VaultError>(), Some(VaultError::Declined))
    }
}

/// Severity of a non-fatal finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Recorded and surfaced, does not stop the pipeline
    Warning,
    /// Needs a human decision (secrets on disk, env values to adjust)
    Deferred,
}

/// A recorded, non-fatal finding from one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub stage: String,
    pub message: String,
}

impl Issue {
    pub fn warning(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn deferred(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Deferred,
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Deferred => "action required",
        };
        write!(f, "[{}] {}: {}", tag, self.stage, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declined_detection() {
        let err: anyhow::Error = VaultError::Declined.into();
        assert!(VaultError::is_declined(&err));

        let err: anyhow::Error = VaultError::MissingTool("ssh".into()).into();
        assert!(!VaultError::is_declined(&err));
    }

    #[test]
    fn test_capacity_message_is_human_readable() {
        let err = VaultError::InsufficientCapacity {
            required: 3 * 1024 * 1024,
            available: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("3.00 MB"));
        assert!(msg.contains("--force"));
    }
}
