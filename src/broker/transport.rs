//! Transport abstraction between the connection manager and a concrete broker
//!
//! A [`Connector`] performs the whole connection contract in one call: open the
//! transport, open a channel, declare the working queue as durable and apply the
//! role-specific channel settings (prefetch for consumers, publisher confirms for
//! publishers). The resulting [`BrokerChannel`] is then shared by the manager.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::BoxStream;
use serde::Serialize;

use super::error::{BrokerError, BrokerResult};

/// Maximum number of unacknowledged deliveries handed to a consumer channel
pub const CONSUMER_PREFETCH: u16 = 1;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// What a channel is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Publishes readings, with publisher confirms enabled
    Publisher,

    /// Consumes readings with manual acks and a prefetch limit
    Consumer,
}

/// Everything a transport needs to prepare a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSetup {
    pub queue: String,
    pub dead_letter_queue: Option<String>,
    pub role: ChannelRole,
}

impl ChannelSetup {
    /// Prefetch limit applied to the channel, if any
    pub fn prefetch(&self) -> Option<u16> {
        match self.role {
            ChannelRole::Consumer => Some(CONSUMER_PREFETCH),
            ChannelRole::Publisher => None,
        }
    }
}

/// A message about to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: &'static str,

    /// Ask the broker to write the message to stable storage
    pub persistent: bool,

    pub timestamp: DateTime<Utc>,
}

impl OutgoingMessage {
    /// Serialize a value into a persistent JSON message
    pub fn persistent_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            content_type: JSON_CONTENT_TYPE,
            persistent: true,
            timestamp: Utc::now().trunc_subsecs(0),
        })
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    async fn reject(&self, requeue: bool) -> BrokerResult<()>;
}

/// A delivery received from the queue
///
/// The body is the serialized reading. The message must be settled exactly once,
/// either with [`QueueMessage::ack`] or [`QueueMessage::reject`].
pub struct QueueMessage {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
    pub timestamp: Option<DateTime<Utc>>,
    acker: Box<dyn Acknowledger>,
}

impl QueueMessage {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        persistent: bool,
        redelivered: bool,
        timestamp: Option<DateTime<Utc>>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            persistent,
            redelivered,
            timestamp,
            acker,
        }
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("persistent", &self.persistent)
            .field("redelivered", &self.redelivered)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Stream of deliveries for one subscription. It ends when the channel is lost.
pub type DeliveryStream = BoxStream<'static, BrokerResult<QueueMessage>>;

/// An open, configured channel on a live connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()>;

    /// Subscribe to a queue with manual acknowledgement
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    fn is_open(&self) -> bool;

    /// Resolves once the underlying connection is lost or closed
    async fn closed(&self);

    /// Close the channel, then the connection
    async fn close(&self) -> BrokerResult<()>;
}

/// Factory for broker channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, setup: &ChannelSetup) -> BrokerResult<Arc<dyn BrokerChannel>>;
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Publish(format!("failed to serialize message: {err}"))
    }
}
