//! Message types for actor communication
//!
//! Each actor owns an mpsc command channel. Requests that expect an answer
//! carry a oneshot `respond_to` sender.

use tokio::sync::oneshot;

/// Commands that can be sent to the PublisherActor
#[derive(Debug)]
pub enum PublisherCommand {
    /// Run one synthesis round immediately, bypassing the interval timer
    PublishNow {
        /// Number of readings handed to the broker
        respond_to: oneshot::Sender<usize>,
    },

    /// Refresh the sensor cache immediately
    RefreshNow {
        /// Number of active sensors cached afterwards
        respond_to: oneshot::Sender<usize>,
    },

    GetStats {
        respond_to: oneshot::Sender<PublisherStats>,
    },

    /// Stop both timers and exit; the final stats are sent back
    Shutdown {
        respond_to: oneshot::Sender<PublisherStats>,
    },
}

/// Counters kept by the publisher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Sensors currently cached
    pub cached_sensors: usize,

    /// Synthesis rounds run so far
    pub rounds: u64,

    /// Readings handed to the broker
    pub published: u64,

    /// Readings lost because no channel was available or the publish failed
    pub dropped: u64,

    /// Readings refused because of non-finite sensor bounds
    pub invalid_config: u64,

    pub refresh_failures: u64,
}

/// Commands that can be sent to the ConsumerActor
#[derive(Debug)]
pub enum ConsumerCommand {
    GetStats {
        respond_to: oneshot::Sender<ConsumerStats>,
    },

    /// Stop after the in-flight message is settled; the final stats are sent back
    Shutdown {
        respond_to: oneshot::Sender<ConsumerStats>,
    },
}

/// Counters kept by the consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub unknown_sensor: u64,
    pub duplicates: u64,
    pub alerts_raised: u64,

    /// Times a subscription was (re)established
    pub subscriptions: u64,
}
