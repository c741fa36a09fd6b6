//! Connection manager: owns the broker channel and keeps it alive
//!
//! ```text
//!   start()
//!     │
//!     ▼
//!  ┌──────────┐  ok   ┌───────────┐  connection lost  ┌─────────────┐
//!  │connecting│──────▶│ connected │──────────────────▶│clear channel│
//!  └──────────┘       └───────────┘                   └──────┬──────┘
//!     ▲   │ err                                              │
//!     │   ▼                                                  │
//!     └─ sleep RECONNECT_DELAY ◀─────────────────────────────┘
//! ```
//!
//! The supervisor task never gives up. It stops only when [`ConnectionManager::close`]
//! cancels it. While a reconnect is in progress no channel is published, so
//! callers see [`BrokerError::NoChannel`] instead of a half-dead channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::error::{BrokerError, BrokerResult};
use super::transport::{
    BrokerChannel, ChannelRole, ChannelSetup, Connector, DeliveryStream, OutgoingMessage,
};
use crate::config::BrokerSettings;

/// Fixed delay between two connection attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for a graceful close against an unresponsive broker
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    setup: ChannelSetup,
    addr: String,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,

    /// Bumped every time a fresh channel is installed
    generation: watch::Sender<u64>,

    attempts: AtomicU64,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: &BrokerSettings,
        role: ChannelRole,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0);

        Arc::new(Self {
            connector,
            setup: ChannelSetup {
                queue: settings.queue.clone(),
                dead_letter_queue: settings.dead_letter_queue.clone(),
                role,
            },
            addr: settings.display_addr(),
            channel: RwLock::new(None),
            generation,
            attempts: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &str {
        &self.setup.queue
    }

    pub fn role(&self) -> ChannelRole {
        self.setup.role
    }

    /// Number of connection attempts made so far
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Perform a single connection attempt and install the resulting channel
    #[instrument(skip(self), fields(addr = %self.addr, queue = %self.setup.queue))]
    pub async fn connect(&self) -> BrokerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let channel = self.connector.connect(&self.setup).await?;

        *self.channel.write().await = Some(channel);
        self.generation.send_modify(|generation| *generation += 1);

        info!(
            "connected to broker at {}, queue \"{}\" ready",
            self.addr, self.setup.queue
        );
        Ok(())
    }

    /// Spawn the supervisor that connects and reconnects in the background
    ///
    /// The initial connection uses the same retry loop, so the broker being
    /// down at startup is not fatal.
    pub async fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            warn!("broker supervisor already running");
            return;
        }

        let manager = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { manager.supervise().await }));
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(()) => {
                    if let Some(channel) = self.current().await {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = channel.closed() => {}
                        }
                    }

                    self.clear_channel().await;
                    warn!(
                        "connection to broker lost, reconnecting in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                }
                Err(BrokerError::Closed) => break,
                Err(err) => {
                    error!(
                        error = %err,
                        "broker connection failed, retrying in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        debug!("broker supervisor stopped");
    }

    /// The current channel, if one is installed and still open
    pub async fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel
            .read()
            .await
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    pub async fn is_connected(&self) -> bool {
        self.current().await.is_some()
    }

    async fn clear_channel(&self) {
        if self.channel.write().await.take().is_some() {
            debug!("broker channel discarded");
        }
    }

    /// Wait until a usable channel is available
    ///
    /// Returns `None` once the manager is closed.
    pub async fn wait_for_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut generation = self.generation.subscribe();

        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            if let Some(channel) = self.current().await {
                return Some(channel);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = generation.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Publish to the working queue on the current channel
    pub async fn publish(&self, message: OutgoingMessage) -> BrokerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let channel = self.current().await.ok_or(BrokerError::NoChannel)?;
        channel.publish(&self.setup.queue, message).await
    }

    /// Start consuming the working queue on the current channel
    pub async fn subscribe(&self, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let channel = self.current().await.ok_or(BrokerError::NoChannel)?;
        channel.consume(&self.setup.queue, consumer_tag).await
    }

    /// Stop reconnecting and close the channel and connection
    ///
    /// Errors while closing are logged, never returned, so shutdown always completes.
    pub async fn close(&self) {
        self.cancel.cancel();

        if let Some(supervisor) = self.supervisor.lock().await.take()
            && let Err(err) = supervisor.await
        {
            error!(error = %err, "broker supervisor task failed");
        }

        let Some(channel) = self.channel.write().await.take() else {
            info!("broker connection manager closed");
            return;
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await {
            Ok(Ok(())) => info!("broker connection closed"),
            Ok(Err(err)) => error!(error = %err, "error while closing broker connection"),
            Err(_) => error!(
                "broker did not confirm close within {}s",
                CLOSE_TIMEOUT.as_secs()
            ),
        }
    }
}
