//! Error types for orchestration operations

use crate::state::ServiceState;

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration error (bad service order, bad marker, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command executor errors
    #[error("Command execution error: {0}")]
    CommandExecutor(#[from] command_executor::Error),

    /// A service failed while the orchestrator was bringing the platform up
    #[error("Failed to start {service}: {source}")]
    StartupFailed {
        /// The service that failed
        service: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// One-shot initialization failed
    #[error("Failed to initialize {service}: {reason}")]
    Init {
        /// The service being initialized
        service: String,
        /// What went wrong
        reason: String,
    },

    /// Upgrade failed; the state directory was restored from backup
    #[error("Failed to upgrade {service}: {reason}")]
    Upgrade {
        /// The service being upgraded
        service: String,
        /// What went wrong
        reason: String,
    },

    /// HTTP or SSH call failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed response body
    #[error("Decode error: {0}")]
    Decode(String),

    /// Readiness probe exceeded its attempt bound
    #[error("Service not ready after {attempts} attempts")]
    Timeout {
        /// Number of probe attempts made
        attempts: u32,
    },

    /// Readiness probe got an answer that retrying cannot change
    #[error("Readiness check failed: {0}")]
    ProbeFailed(String),

    /// Lifecycle transition not allowed from the current state
    #[error("{service}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// The service
        service: String,
        /// Current state
        from: ServiceState,
        /// Requested state
        to: ServiceState,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error as the cause of a failed startup
    pub fn startup_failed(service: impl Into<String>, source: Error) -> Self {
        Self::StartupFailed {
            service: service.into(),
            source: Box::new(source),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
