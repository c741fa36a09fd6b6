//! Message broker access
//!
//! Readings travel through a single durable work queue. Producers and consumers
//! each own a [`ConnectionManager`], which keeps one channel alive over any
//! [`Connector`] and reconnects on a fixed delay when the connection drops.
//!
//! Two transports are provided:
//! - [`amqp::AmqpConnector`] for RabbitMQ (feature `amqp`)
//! - [`memory::MemoryBroker`] for tests and broker-less local runs

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod error;
pub mod manager;
pub mod memory;
pub mod transport;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use error::{BrokerError, BrokerResult};
pub use manager::{ConnectionManager, RECONNECT_DELAY};
pub use memory::{MemoryBroker, MemoryBrokerStats};
pub use transport::{
    Acknowledger, BrokerChannel, CONSUMER_PREFETCH, ChannelRole, ChannelSetup, Connector,
    DeliveryStream, OutgoingMessage, QueueMessage,
};
