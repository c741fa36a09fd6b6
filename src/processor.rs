//! Processing of a single delivered reading
//!
//! ```text
//! RECEIVED ─▶ DECODED ─▶ PERSISTED ─▶ EVALUATED ─▶ ACKNOWLEDGED
//!    │           │           │
//!    └───────────┴───────────┴──── failure ──▶ REJECTED (no requeue)
//! ```
//!
//! An unknown sensor is not a failure: the message is acknowledged and nothing
//! is stored. Settling the message with the broker is left to the caller, the
//! processor only decides the outcome.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::sensors::{SensorDirectory, SensorDirectoryError};
use crate::storage::{ReadingStore, StorageError};
use crate::{AlertEvent, Reading, thresholds};

const BANNER_WIDTH: usize = 80;

/// Stages a message goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    Persisted,
    Evaluated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "RECEIVED",
            Stage::Decoded => "DECODED",
            Stage::Persisted => "PERSISTED",
            Stage::Evaluated => "EVALUATED",
        };
        f.write_str(name)
    }
}

/// Successful result of processing one message
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Reading stored and evaluated; `alerts` may be empty
    Processed { alerts: Vec<AlertEvent> },

    /// Reading was already stored by an earlier delivery
    Duplicate,

    /// No configuration for this sensor; nothing was stored
    UnknownSensor { sensor_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed reading payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid reading from sensor {sensor_id}: {reason}")]
    InvalidReading { sensor_id: String, reason: String },

    #[error("sensor lookup failed: {0}")]
    SensorLookup(#[from] SensorDirectoryError),

    #[error("failed to persist {what}: {source}")]
    Storage {
        what: &'static str,
        stage: Stage,
        #[source]
        source: StorageError,
    },
}

impl ProcessError {
    /// Transient errors might succeed on a later attempt, permanent ones never will
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessError::SensorLookup(_) | ProcessError::Storage { .. }
        )
    }

    /// Last stage the message reached before the failure
    pub fn stage(&self) -> Stage {
        match self {
            ProcessError::Decode(_) => Stage::Received,
            ProcessError::InvalidReading { .. } | ProcessError::SensorLookup(_) => Stage::Decoded,
            ProcessError::Storage { stage, .. } => *stage,
        }
    }
}

/// Decodes, persists and evaluates readings
#[derive(Clone)]
pub struct ReadingProcessor {
    sensors: Arc<dyn SensorDirectory>,
    store: Arc<dyn ReadingStore>,
}

impl ReadingProcessor {
    pub fn new(sensors: Arc<dyn SensorDirectory>, store: Arc<dyn ReadingStore>) -> Self {
        Self { sensors, store }
    }

    pub fn decode(body: &[u8]) -> Result<Reading, ProcessError> {
        let reading: Reading = serde_json::from_slice(body)?;

        for (metric, value) in [
            ("temperature", reading.temperature),
            ("humidity", reading.humidity),
        ] {
            if !value.is_finite() {
                return Err(ProcessError::InvalidReading {
                    sensor_id: reading.sensor_id,
                    reason: format!("{metric} is not a finite number"),
                });
            }
        }

        Ok(reading)
    }

    /// Run one message body through the pipeline
    #[instrument(skip_all, fields(sensor_id = tracing::field::Empty))]
    pub async fn process(&self, body: &[u8]) -> Result<Outcome, ProcessError> {
        let reading = Self::decode(body)?;
        tracing::Span::current().record("sensor_id", reading.sensor_id.as_str());
        debug!(stage = %Stage::Decoded, "reading decoded");

        let Some(sensor) = self.sensors.get(&reading.sensor_id).await? else {
            warn!(
                "sensor {} not found in configuration, discarding reading",
                reading.sensor_id
            );
            return Ok(Outcome::UnknownSensor {
                sensor_id: reading.sensor_id,
            });
        };

        let inserted = self
            .store
            .append_reading(&reading)
            .await
            .map_err(|source| ProcessError::Storage {
                what: "reading",
                stage: Stage::Decoded,
                source,
            })?;
        debug!(stage = %Stage::Persisted, inserted, "reading stored");

        let alerts = thresholds::evaluate(&sensor, &reading);
        debug!(stage = %Stage::Evaluated, alerts = alerts.len(), "thresholds checked");

        // Re-applying alerts is idempotent and completes a delivery that failed
        // after the reading was stored.
        for alert in &alerts {
            self.store
                .append_alert(alert)
                .await
                .map_err(|source| ProcessError::Storage {
                    what: "alert",
                    stage: Stage::Persisted,
                    source,
                })?;
        }

        if !inserted {
            debug!("reading at {} was already processed", reading.timestamp);
            return Ok(Outcome::Duplicate);
        }

        if alerts.is_empty() {
            info!(
                "sensor \"{}\" ({}) within normal range: {}°C, {}%",
                sensor.name, sensor.sensor_id, reading.temperature, reading.humidity
            );
        } else {
            log_alerts(&alerts);
        }

        Ok(Outcome::Processed { alerts })
    }
}

fn log_alerts(alerts: &[AlertEvent]) {
    let separator = "=".repeat(BANNER_WIDTH);
    warn!("{}", separator);
    warn!("ALERT TRIGGERED - CRITICAL");
    for alert in alerts {
        warn!(kind = %alert.kind, "{}", alert.message);
    }
    warn!("{}", separator);
}
