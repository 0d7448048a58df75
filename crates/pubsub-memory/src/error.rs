use proven_pubsub::ConnectionError;
use thiserror::Error;

/// Errors returned by the in-memory service.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The resource is already present.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The resource or ack id is unknown.
    #[error("{0} not found")]
    NotFound(String),

    /// An injected failure.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The connection was released.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError for Error {
    fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
