//! Error types for broker operations

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur while talking to the message broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transport connection could not be established (network, auth, vhost)
    #[error("failed to connect to broker: {0}")]
    Connection(String),

    /// Channel could not be opened or configured (queue declaration, qos)
    #[error("broker channel error: {0}")]
    Channel(String),

    /// Message could not be handed to the broker
    #[error("failed to publish message: {0}")]
    Publish(String),

    /// Ack or reject could not be delivered to the broker
    #[error("failed to settle delivery: {0}")]
    Acknowledge(String),

    /// No live channel, e.g. while a reconnect is in progress
    #[error("no broker channel available")]
    NoChannel,

    /// The connection manager has been closed
    #[error("broker connection manager is closed")]
    Closed,
}
