use thiserror::Error;

/// Errors that can occur anywhere in the policy network
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Unknown subject or dataset
    #[error("Dataset '{0}' was not found")]
    NotFound(String),

    /// Malformed input such as a missing identifier or body
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A storage node or peer could not be reached in time
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Encoding or serialization failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Malformed or unauthorized inbound gossip message
    #[error("Dropped gossip message: {0}")]
    Dropped(String),

    /// Operation exists on the surface but has no implementation
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using PolicyError
pub type Result<T> = std::result::Result<T, PolicyError>;

impl PolicyError {
    /// Short, stable name of the error kind, used as a log field and metric label
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyError::NotFound(_) => "not_found",
            PolicyError::BadRequest(_) => "bad_request",
            PolicyError::Unavailable(_) => "unavailable",
            PolicyError::Internal(_) => "internal",
            PolicyError::Dropped(_) => "dropped",
            PolicyError::NotImplemented(_) => "not_implemented",
            PolicyError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        PolicyError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for PolicyError {
    fn from(err: config::ConfigError) -> Self {
        PolicyError::Config(err.to_string())
    }
}
