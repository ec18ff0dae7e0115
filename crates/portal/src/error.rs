//! Error types for the portal

/// Error types for the portal
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad or missing startup parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Lifecycle or orchestration failure
    #[error(transparent)]
    Orchestration(#[from] service_orchestration::Error),

    /// Command executor errors
    #[error("Command execution error: {0}")]
    CommandExecutor(#[from] command_executor::Error),

    /// HTTP or SSH call failed before a response arrived
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed response body or event line
    #[error("Decode error: {0}")]
    Decode(String),

    /// The server answered with an unexpected status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code
        status: u16,
        /// Start of the response body
        body: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration file could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Shorthand for [`Error::Configuration`]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<Error> for service_orchestration::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Orchestration(e) => e,
            Error::CommandExecutor(e) => Self::CommandExecutor(e),
            Error::Transport(reason) => Self::Transport(reason),
            Error::Decode(reason) => Self::Decode(reason),
            Error::Http { status, body } => Self::Transport(format!("HTTP {}: {}", status, body)),
            Error::Io(e) => Self::Io(e),
            Error::Configuration(reason) => Self::Config(reason),
            Error::Yaml(e) => Self::Config(e.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
