//! Error types for the gateway

use std::io;
use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Unknown, inactive or malformed client credential
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Customer is over its plan limit
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No node matched at any relaxation level, or every dial attempt failed
    #[error("No available node: {0}")]
    NoAvailableNode(String),

    /// Dial or relay I/O failure against a specific node
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Selected node vanished between selection and handoff
    #[error("Registry inconsistency: {0}")]
    RegistryInconsistency(String),

    /// Exit node reached, but it could not reach the client's target
    #[error("Target error: {0}")]
    Target(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::AuthFailure(msg.into())
    }

    pub fn quota<S: Into<String>>(msg: S) -> Self {
        Error::QuotaExceeded(msg.into())
    }

    pub fn no_available_node<S: Into<String>>(msg: S) -> Self {
        Error::NoAvailableNode(msg.into())
    }

    pub fn node_unreachable<S: Into<String>>(msg: S) -> Self {
        Error::NodeUnreachable(msg.into())
    }

    pub fn inconsistency<S: Into<String>>(msg: S) -> Self {
        Error::RegistryInconsistency(msg.into())
    }

    pub fn target<S: Into<String>>(msg: S) -> Self {
        Error::Target(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether a session should retry selection once after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NodeUnreachable(_) | Error::RegistryInconsistency(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Internal(format!("usage service: {}", e))
    }
}

impl From<tokio_util::codec::LinesCodecError> for Error {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                Error::Protocol("control message too long".to_string())
            }
            tokio_util::codec::LinesCodecError::Io(e) => Error::Io(e),
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::protocol("invalid header");
        assert_eq!(e.to_string(), "Protocol error: invalid header");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::node_unreachable("dial").is_retryable());
        assert!(Error::inconsistency("gone").is_retryable());
        assert!(!Error::no_available_node("none").is_retryable());
        assert!(!Error::auth("bad key").is_retryable());
        assert!(!Error::quota("over").is_retryable());
    }
}
