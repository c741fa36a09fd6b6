//! PublisherActor - synthesizes readings and publishes them
//!
//! Two independent timers drive the actor:
//! - refresh: reload the active sensor list from the configuration API
//! - publish: generate one reading per cached sensor and publish it
//!
//! A failed refresh keeps the previous cache. Publishing is at-most-once: a
//! reading that cannot be handed to the broker is logged and dropped.

use std::sync::Arc;

use anyhow::Context;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::messages::{PublisherCommand, PublisherStats};
use crate::SensorConfig;
use crate::broker::{ConnectionManager, OutgoingMessage};
use crate::config::PublisherSettings;
use crate::sensors::SensorDirectory;
use crate::simulator;

pub struct PublisherActor {
    manager: Arc<ConnectionManager>,
    directory: Arc<dyn SensorDirectory>,
    settings: PublisherSettings,
    sensors: Vec<SensorConfig>,
    rng: StdRng,
    command_rx: mpsc::Receiver<PublisherCommand>,
    stats: PublisherStats,
}

impl PublisherActor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        directory: Arc<dyn SensorDirectory>,
        settings: PublisherSettings,
        rng: StdRng,
        command_rx: mpsc::Receiver<PublisherCommand>,
    ) -> Self {
        Self {
            manager,
            directory,
            settings,
            sensors: Vec::new(),
            rng,
            command_rx,
            stats: PublisherStats::default(),
        }
    }

    #[instrument(skip(self), fields(queue = %self.manager.queue()))]
    pub async fn run(mut self) {
        info!(
            "starting publisher (publish every {:?}, refresh every {:?})",
            self.settings.publish_interval, self.settings.refresh_interval
        );

        self.refresh_sensors().await;

        let start = Instant::now();
        let mut publish_interval = time::interval_at(
            start + self.settings.publish_interval,
            self.settings.publish_interval,
        );
        let mut refresh_interval = time::interval_at(
            start + self.settings.refresh_interval,
            self.settings.refresh_interval,
        );

        loop {
            tokio::select! {
                _ = publish_interval.tick() => {
                    self.publish_round().await;
                }

                _ = refresh_interval.tick() => {
                    self.refresh_sensors().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(PublisherCommand::PublishNow { respond_to }) => {
                        let published = self.publish_round().await;
                        let _ = respond_to.send(published);
                    }
                    Some(PublisherCommand::RefreshNow { respond_to }) => {
                        let cached = self.refresh_sensors().await;
                        let _ = respond_to.send(cached);
                    }
                    Some(PublisherCommand::GetStats { respond_to }) => {
                        let _ = respond_to.send(self.stats);
                    }
                    Some(PublisherCommand::Shutdown { respond_to }) => {
                        info!("publisher shutting down");
                        let _ = respond_to.send(self.stats);
                        break;
                    }
                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                }
            }
        }

        debug!("publisher stopped");
    }

    /// Reload the sensor cache, returns the number of cached sensors
    async fn refresh_sensors(&mut self) -> usize {
        match self.directory.list_active().await {
            Ok(sensors) => {
                info!("loaded {} active sensors", sensors.len());
                self.sensors = sensors;
            }
            Err(err) => {
                self.stats.refresh_failures += 1;
                error!(
                    error = %err,
                    "failed to fetch sensors, keeping {} cached",
                    self.sensors.len()
                );
            }
        }

        self.stats.cached_sensors = self.sensors.len();
        self.sensors.len()
    }

    /// One synthesis round, returns the number of readings published
    async fn publish_round(&mut self) -> usize {
        self.stats.rounds += 1;

        if self.sensors.is_empty() {
            debug!("no active sensors to simulate");
            return 0;
        }

        let mut published = 0;
        for sensor in &self.sensors {
            let reading = match simulator::generate_reading(sensor, &mut self.rng) {
                Ok(reading) => reading,
                Err(err) => {
                    self.stats.invalid_config += 1;
                    error!(error = %err, "skipping sensor {}", sensor.sensor_id);
                    continue;
                }
            };

            let message = match OutgoingMessage::persistent_json(&reading) {
                Ok(message) => message,
                Err(err) => {
                    self.stats.dropped += 1;
                    error!(error = %err, "failed to serialize reading");
                    continue;
                }
            };

            match self.manager.publish(message).await {
                Ok(()) => {
                    published += 1;
                    debug!(
                        "published reading for {}: {}°C, {}%",
                        reading.sensor_id, reading.temperature, reading.humidity
                    );
                }
                Err(err) => {
                    self.stats.dropped += 1;
                    warn!(
                        error = %err,
                        "reading for {} dropped",
                        reading.sensor_id
                    );
                }
            }
        }

        self.stats.published += published as u64;
        published
    }
}

/// Handle for controlling the PublisherActor
#[derive(Clone)]
pub struct PublisherHandle {
    sender: mpsc::Sender<PublisherCommand>,
}

impl PublisherHandle {
    /// Spawn a publisher seeded from the operating system
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        directory: Arc<dyn SensorDirectory>,
        settings: PublisherSettings,
    ) -> Self {
        Self::spawn_with_rng(manager, directory, settings, StdRng::from_os_rng())
    }

    pub fn spawn_with_rng(
        manager: Arc<ConnectionManager>,
        directory: Arc<dyn SensorDirectory>,
        settings: PublisherSettings,
        rng: StdRng,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = PublisherActor::new(manager, directory, settings, rng, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a synthesis round now
    pub async fn publish_now(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PublisherCommand::PublishNow { respond_to: tx })
            .await
            .context("publisher is not running")?;

        Ok(rx.await?)
    }

    /// Refresh the sensor cache now
    pub async fn refresh_now(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PublisherCommand::RefreshNow { respond_to: tx })
            .await
            .context("publisher is not running")?;

        Ok(rx.await?)
    }

    pub async fn get_stats(&self) -> Option<PublisherStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PublisherCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Stop the publisher and return its final stats
    pub async fn shutdown(&self) -> anyhow::Result<PublisherStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PublisherCommand::Shutdown { respond_to: tx })
            .await
            .context("publisher is not running")?;

        Ok(rx.await?)
    }
}
