//! Error types for Vessel

use thiserror::Error;

/// Vessel error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `CGroup` operation failed
    #[error("CGroup error: {message}")]
    CGroup {
        /// Error message
        message: String,
    },

    /// Namespace operation failed
    #[error("Namespace error: {message}")]
    Namespace {
        /// Error message
        message: String,
    },

    /// Network setup or teardown failed
    #[error("Network error: {message}")]
    Network {
        /// Error message
        message: String,
    },

    /// Permission denied
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// Root filesystem directory does not exist
    #[error("rootfs not found at {}", path.display())]
    RootfsMissing {
        /// Expected rootfs path
        path: std::path::PathBuf,
    },

    /// Command string could not be turned into an argument vector
    #[error("Invalid command: {message}")]
    InvalidCommand {
        /// Error message
        message: String,
    },

    /// Host port already bound or listening
    #[error("Port {port} unavailable: {reason}")]
    PortConflict {
        /// Offending host port
        port: u16,
        /// Why it is unavailable
        reason: String,
    },

    /// No container with that name
    #[error("No such container: {name}")]
    ContainerNotFound {
        /// Container name
        name: String,
    },

    /// Container name already taken
    #[error("Container {name} already exists")]
    ContainerExists {
        /// Container name
        name: String,
    },

    /// Operation not valid in the container's current state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message
        message: String,
    },

    /// Operation needs a host capability that is missing
    #[error("Unsupported on this host: {operation}")]
    Unsupported {
        /// Operation that was attempted
        operation: String,
    },

    /// Operation exceeded its deadline
    #[error("Timed out: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Shorthand for [`Error::InvalidConfig`]
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::CGroup`]
    pub fn cgroup(message: impl Into<String>) -> Self {
        Self::CGroup {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Namespace`]
    pub fn namespace(message: impl Into<String>) -> Self {
        Self::Namespace {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Network`]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

/// Result type alias for Vessel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a best-effort cleanup step.
///
/// Cleanup never aborts a stop or remove; callers log `Failed` and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Resource was released
    Done,
    /// Nothing to release
    Skipped,
    /// Release failed; the reason is kept for logging
    Failed(String),
}

impl CleanupOutcome {
    /// Combine two outcomes, keeping the first failure
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Failed(a), _) => Self::Failed(a),
            (_, Self::Failed(b)) => Self::Failed(b),
            (Self::Done, _) | (_, Self::Done) => Self::Done,
            (Self::Skipped, Self::Skipped) => Self::Skipped,
        }
    }

    /// Whether the step failed
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Emit a warning for failed outcomes
    pub fn log(&self, container: &str, step: &str) {
        match self {
            Self::Failed(reason) => {
                tracing::warn!(container, step, reason = %reason, "Cleanup step failed");
            }
            Self::Done => tracing::debug!(container, step, "Cleanup step done"),
            Self::Skipped => {}
        }
    }
}
