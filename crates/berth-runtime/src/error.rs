//! Runtime error taxonomy.

use berth_common::error::BerthError;
use berth_common::types::{ContainerId, ContainerStatus};
use thiserror::Error;

/// Failures of the parent/companion synchronization channel.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer closed the channel at a frame boundary.
    #[error("sync channel closed by peer")]
    Closed,

    /// A message arrived out of sequence.
    #[error("unexpected sync message: expected {expected}, got {got}")]
    Unexpected {
        /// Message type the protocol required.
        expected: String,
        /// Message type actually received.
        got: String,
    },

    /// The peer reported a failure.
    #[error("{0}")]
    Remote(String),

    /// A message that takes no argument carried one.
    #[error("sync message {0} carries an unexpected argument")]
    UnexpectedArgument(String),

    /// A message that takes no descriptor carried one.
    #[error("sync message {0} carries an unexpected file descriptor")]
    UnexpectedFile(String),

    /// A frame could not be decoded.
    #[error("malformed sync frame: {0}")]
    Malformed(String),

    /// The underlying socket failed.
    #[error("sync channel I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by container lifecycle operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid configuration, detected before anything was spawned.
    #[error("invalid container configuration: {0}")]
    Configuration(String),

    /// The requested lifecycle edge is not allowed from the current state.
    #[error("invalid state transition from {current} to {requested}")]
    StateTransition {
        /// State the container is in.
        current: ContainerStatus,
        /// State the operation would move it to.
        requested: ContainerStatus,
    },

    /// The handshake with the companion failed.
    #[error("companion synchronization failed: {0}")]
    Synchronization(#[from] SyncError),

    /// A process did not reach the expected liveness state.
    #[error("{0}")]
    Liveness(String),

    /// A collaborator (cgroup driver, hook, checkpoint engine) failed.
    #[error("{context}: {source}")]
    External {
        /// What the runtime was doing.
        context: String,
        /// The collaborator's error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The operation needs a live container.
    #[error("container {id} is not running")]
    NotRunning {
        /// Container id.
        id: ContainerId,
    },

    /// A second init process was started.
    #[error("container {id} already has init process")]
    AlreadyHasInit {
        /// Container id.
        id: ContainerId,
    },

    /// Shared I/O, serialization, or lookup failure.
    #[error(transparent)]
    Common(#[from] BerthError),
}

impl RuntimeError {
    /// Wraps a collaborator error with what the runtime was doing.
    pub fn external(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Returns `true` if the error means the container does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_not_found())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Common(BerthError::from(e))
    }
}

/// Convenience alias for runtime results.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_has_init_message() {
        let id = ContainerId::new("c1").expect("id");
        let err = RuntimeError::AlreadyHasInit { id };
        assert_eq!(err.to_string(), "container c1 already has init process");
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = RuntimeError::StateTransition {
            current: ContainerStatus::Stopped,
            requested: ContainerStatus::Paused,
        };
        assert_eq!(err.to_string(), "invalid state transition from stopped to paused");
    }

    #[test]
    fn remote_sync_error_keeps_companion_message() {
        let err = RuntimeError::from(SyncError::Remote("mount failed".into()));
        assert!(err.to_string().ends_with("mount failed"));
    }
}
