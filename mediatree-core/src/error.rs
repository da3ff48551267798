//! Error types for the mesh control plane

use http::StatusCode;
use thiserror::Error;

/// Control plane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Topology broken: {0}")]
    TopologyBroken(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Port exhaustion: {0}")]
    PortExhaustion(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status an API layer should answer with for this error
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NoCapacity(_) | Self::PortExhaustion(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::TopologyBroken(_)
            | Self::StateStore(_)
            | Self::Runtime(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::StateStore(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::NotFound("session".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::AlreadyExists("sess-A".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::NoCapacity("injection".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Protocol("502".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_display() {
        let err = Error::TopologyBroken("injection inj-1 has no relay root".into());
        assert_eq!(
            err.to_string(),
            "Topology broken: injection inj-1 has no relay root"
        );
        assert!(Error::NotFound(String::new()).is_not_found());
        assert!(!Error::Runtime(String::new()).is_not_found());
    }
}
