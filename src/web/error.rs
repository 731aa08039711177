//! Error taxonomy for the model registry and worker bridge.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the serving core.
pub type Result<T> = std::result::Result<T, ServeError>;

#[derive(Debug, Error)]
pub enum ServeError {
    /// The model id is unknown both in the cache and on disk.
    #[error("model {0} not found")]
    NotFound(String),

    /// A call was attempted against a stopped or dead worker.
    #[error("worker for model {0} is not running")]
    WorkerUnavailable(String),

    /// The worker process could not be spawned or never bound its endpoint.
    #[error("failed to launch worker for model {model_id}: {reason}")]
    LaunchFailure { model_id: String, reason: String },

    /// The worker went away while a call was queued or in flight.
    #[error("worker for model {0} exited before replying")]
    WorkerExited(String),

    /// No reply arrived within the configured call deadline.
    #[error("worker for model {model_id} did not reply within {after:?}")]
    CallTimeout { model_id: String, after: Duration },

    /// A one-shot worker (fit) exited with a non-zero status.
    #[error("worker for model {model_id} failed ({status}): {stderr}")]
    WorkerExitFailure {
        model_id: String,
        status: ExitStatus,
        stderr: String,
    },

    /// Transport failure on an established worker connection.
    #[error("ipc error talking to model {model_id}: {source}")]
    Ipc {
        model_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid metadata in {}: {source}", path.display())]
    InvalidMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed caller input, rejected before it reaches a worker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServeError::NotFound(_))
    }

    /// True for failures caused by the caller's input rather than the server.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, ServeError::InvalidRequest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguished() {
        assert!(ServeError::NotFound("m1".into()).is_not_found());
        assert!(!ServeError::WorkerUnavailable("m1".into()).is_not_found());
        assert!(ServeError::InvalidRequest("empty".into()).is_invalid_request());
    }

    #[test]
    fn test_messages_name_the_model() {
        let err = ServeError::LaunchFailure {
            model_id: "abc".into(),
            reason: "no such file".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to launch worker for model abc: no such file"
        );
    }
}
