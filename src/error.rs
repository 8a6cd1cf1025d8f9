//! Error types for the messaging runtime.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the messaging runtime.
///
/// Fatal configuration and topology errors abort startup before any message
/// is consumed. Publish-path errors surface to the caller in direct mode and
/// are recorded on the outbox row in outbox mode. Consumer-path errors never
/// reach the caller; they are classified and routed by the retry engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid runtime configuration (bad option value, missing auth material)
    #[error("configuration error: {0}")]
    Config(String),

    /// Topic or subject failed validation
    #[error("invalid subject: {0}")]
    Subject(String),

    /// Broker transport failure (connect, reconnect, flush)
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker rejected the credentials; terminal, not retried
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Broker-side publish rejection
    #[error("publish failed: {0}")]
    Publish(String),

    /// No broker ack within the configured publish timeout
    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// Publish queue filled up while the connection was down
    #[error("publish queue exhausted while reconnecting (limit {0})")]
    Backpressure(usize),

    /// Incoming payload was not a valid envelope
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// Stream/consumer spec conflict or incompatible remote state
    #[error("topology error: {0}")]
    Topology(String),

    /// Outbox/inbox record missing where one was expected
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a publish-path failure should leave the outbox lease in place
    /// for the stale sweeper instead of marking the record failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(_) | Error::PublishTimeout(_) | Error::Backpressure(_) => true,
            Error::Database(e) => {
                matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Connection("lost".into()).is_transient());
        assert!(Error::PublishTimeout(Duration::from_secs(5)).is_transient());
        assert!(Error::Backpressure(100).is_transient());
        assert!(!Error::Publish("payload too large".into()).is_transient());
        assert!(!Error::Envelope("missing event_id".into()).is_transient());
    }
}
