use std::time::Duration;

use thiserror::Error;

use crate::shared::models::LabStatus;

/// Every failure the orchestrator reports to its callers.
///
/// Callers branch on the variant (or on [`LabError::kind`]) rather than on
/// message text, so the HTTP layer can map failures without knowing internals.
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Invalid lab configuration: {0}")]
    Validation(String),

    #[error("Port pool exhausted: requested {requested}, {available} available")]
    PortExhaustion { requested: usize, available: usize },

    #[error("Container {container} did not become ready within {timeout:?}")]
    ContainerStartTimeout { container: String, timeout: Duration },

    #[error("Container runtime error: {0}")]
    ContainerRuntime(String),

    #[error("Path escapes the workspace: {0}")]
    PathTraversal(String),

    #[error("Lab {0} not found")]
    SessionNotFound(String),

    #[error("Lab {id} is not ready (status: {status})")]
    SessionNotReady { id: String, status: LabStatus },

    #[error("Lab {id} cannot move from {actual} to {to}")]
    InvalidTransition {
        id: String,
        actual: LabStatus,
        to: LabStatus,
    },

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Cleanup failed for lab {id}: {message}")]
    Cleanup { id: String, message: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Workspace IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LabResult<T> = std::result::Result<T, LabError>;

impl LabError {
    /// Stable identifier for the taxonomy member.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::Validation(_) => "validation_error",
            LabError::PortExhaustion { .. } => "port_exhaustion",
            LabError::ContainerStartTimeout { .. } => "container_start_timeout",
            LabError::ContainerRuntime(_) => "container_runtime_error",
            LabError::PathTraversal(_) => "path_traversal",
            LabError::SessionNotFound(_) => "session_not_found",
            LabError::SessionNotReady { .. } => "session_not_ready",
            LabError::InvalidTransition { .. } => "invalid_transition",
            LabError::UnsupportedAction(_) => "unsupported_action",
            LabError::Cleanup { .. } => "cleanup_error",
            LabError::FileNotFound(_) => "file_not_found",
            LabError::Io(_) => "workspace_io_error",
        }
    }

    /// Transient failures worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LabError::ContainerRuntime(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_per_variant() {
        let errors = vec![
            LabError::Validation("bad".into()),
            LabError::PortExhaustion {
                requested: 2,
                available: 1,
            },
            LabError::PathTraversal("../x".into()),
            LabError::SessionNotFound("lab".into()),
            LabError::UnsupportedAction("delete_everything".into()),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), 5);
    }

    #[test]
    fn only_runtime_errors_are_retryable() {
        assert!(LabError::ContainerRuntime("daemon gone".into()).is_retryable());
        assert!(!LabError::PathTraversal("/etc".into()).is_retryable());
        assert!(!LabError::Validation("x".into()).is_retryable());
    }
}
