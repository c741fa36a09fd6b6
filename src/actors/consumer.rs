//! ConsumerActor - settles deliveries from the reading queue
//!
//! The actor handles one delivery at a time. With the consumer channel's
//! prefetch of 1 the broker never hands out a second reading before the first
//! one is acknowledged or rejected.
//!
//! When the delivery stream ends (connection lost) the actor waits for the
//! connection manager to come back and subscribes again. Commands are served
//! between deliveries and while waiting for a channel.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use super::messages::{ConsumerCommand, ConsumerStats};
use crate::broker::{ConnectionManager, DeliveryStream, QueueMessage, RECONNECT_DELAY};
use crate::processor::{Outcome, ReadingProcessor};

pub const DEFAULT_CONSUMER_TAG: &str = "sensor-consumer";

enum Flow {
    Continue,
    Stop(oneshot::Sender<ConsumerStats>),
    Closed,
}

pub struct ConsumerActor {
    manager: Arc<ConnectionManager>,
    processor: ReadingProcessor,
    consumer_tag: String,
    command_rx: mpsc::Receiver<ConsumerCommand>,
    stats: ConsumerStats,
}

impl ConsumerActor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        processor: ReadingProcessor,
        command_rx: mpsc::Receiver<ConsumerCommand>,
    ) -> Self {
        Self {
            manager,
            processor,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            command_rx,
            stats: ConsumerStats::default(),
        }
    }

    #[instrument(skip(self), fields(queue = %self.manager.queue()))]
    pub async fn run(mut self) {
        debug!("starting consumer");

        let reply = 'outer: loop {
            // The subscription is polled to completion across commands, a
            // consume request must not be issued twice for one channel.
            let subscription = subscribe(Arc::clone(&self.manager), self.consumer_tag.clone());
            tokio::pin!(subscription);

            let mut deliveries = loop {
                tokio::select! {
                    subscribed = &mut subscription => match subscribed {
                        Some(deliveries) => break deliveries,
                        None => {
                            info!("connection manager closed, consumer stopping");
                            break 'outer None;
                        }
                    },

                    cmd = self.command_rx.recv() => match self.handle_command(cmd) {
                        Flow::Continue => {}
                        Flow::Stop(reply) => break 'outer Some(reply),
                        Flow::Closed => break 'outer None,
                    },
                }
            };
            self.stats.subscriptions += 1;

            loop {
                tokio::select! {
                    next = deliveries.next() => match next {
                        Some(Ok(message)) => self.handle_message(message).await,
                        Some(Err(err)) => {
                            error!(error = %err, "delivery stream failed, resubscribing");
                            break;
                        }
                        None => {
                            warn!("delivery stream ended, waiting for broker connection");
                            break;
                        }
                    },

                    cmd = self.command_rx.recv() => match self.handle_command(cmd) {
                        Flow::Continue => {}
                        Flow::Stop(reply) => break 'outer Some(reply),
                        Flow::Closed => break 'outer None,
                    },
                }
            }
        };

        info!(
            "consumer stopped: {} received, {} acknowledged, {} rejected",
            self.stats.received, self.stats.acknowledged, self.stats.rejected
        );

        if let Some(reply) = reply {
            let _ = reply.send(self.stats);
        }
    }

    fn handle_command(&mut self, cmd: Option<ConsumerCommand>) -> Flow {
        match cmd {
            Some(ConsumerCommand::GetStats { respond_to }) => {
                let _ = respond_to.send(self.stats);
                Flow::Continue
            }
            Some(ConsumerCommand::Shutdown { respond_to }) => {
                info!("consumer shutting down");
                Flow::Stop(respond_to)
            }
            None => {
                warn!("command channel closed, shutting down");
                Flow::Closed
            }
        }
    }

    async fn handle_message(&mut self, message: QueueMessage) {
        self.stats.received += 1;
        if message.redelivered {
            debug!(delivery_tag = message.delivery_tag, "redelivered message");
        }

        match self.processor.process(&message.body).await {
            Ok(outcome) => {
                match &outcome {
                    Outcome::Processed { alerts } => {
                        self.stats.alerts_raised += alerts.len() as u64;
                    }
                    Outcome::Duplicate => self.stats.duplicates += 1,
                    Outcome::UnknownSensor { .. } => self.stats.unknown_sensor += 1,
                }

                match message.ack().await {
                    Ok(()) => self.stats.acknowledged += 1,
                    Err(err) => error!(
                        error = %err,
                        delivery_tag = message.delivery_tag,
                        "failed to acknowledge message, broker will redeliver"
                    ),
                }
            }
            Err(err) => {
                error!(
                    error = %err,
                    stage = %err.stage(),
                    transient = err.is_transient(),
                    delivery_tag = message.delivery_tag,
                    "failed to process reading, rejecting without requeue"
                );

                match message.reject(false).await {
                    Ok(()) => self.stats.rejected += 1,
                    Err(err) => error!(
                        error = %err,
                        delivery_tag = message.delivery_tag,
                        "failed to reject message"
                    ),
                }
            }
        }
    }
}

/// Wait for a channel and subscribe. `None` once the manager is closed.
async fn subscribe(manager: Arc<ConnectionManager>, consumer_tag: String) -> Option<DeliveryStream> {
    loop {
        manager.wait_for_channel().await?;

        match manager.subscribe(&consumer_tag).await {
            Ok(deliveries) => {
                info!("waiting for readings on queue \"{}\"", manager.queue());
                return Some(deliveries);
            }
            Err(err) => {
                error!(
                    error = %err,
                    "failed to subscribe, retrying in {}s",
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Handle for controlling the ConsumerActor
#[derive(Clone)]
pub struct ConsumerHandle {
    sender: mpsc::Sender<ConsumerCommand>,
}

impl ConsumerHandle {
    pub fn spawn(manager: Arc<ConnectionManager>, processor: ReadingProcessor) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = ConsumerActor::new(manager, processor, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn get_stats(&self) -> Option<ConsumerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsumerCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Stop consuming once the in-flight message is settled
    pub async fn shutdown(&self) -> anyhow::Result<ConsumerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsumerCommand::Shutdown { respond_to: tx })
            .await
            .context("consumer is not running")?;

        rx.await.context("consumer stopped before replying")
    }
}
