//! In-memory storage backend (no persistence)
//!
//! Same deduplication rules as the SQLite backend, without a database. Useful
//! for tests and for local runs. Writes can be switched off to simulate a
//! failing store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, ReadingStore, StoreStats};
use super::error::{StorageError, StorageResult};
use super::schema::timestamp_to_millis;
use crate::sensors::{SensorDirectory, SensorDirectoryError};
use crate::{AlertEvent, AlertKind, Reading, SensorConfig};

#[derive(Debug, Default)]
struct MemoryState {
    sensors: HashMap<String, SensorConfig>,
    readings: Vec<Reading>,
    alerts: Vec<AlertEvent>,
    reading_keys: HashSet<(String, i64)>,
    alert_keys: HashSet<(String, AlertKind, i64)>,
}

/// In-memory storage backend
#[derive(Debug)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    writable: AtomicBool,
    alerts_writable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            writable: AtomicBool::new(true),
            alerts_writable: AtomicBool::new(true),
        }
    }

    pub fn with_sensors(sensors: impl IntoIterator<Item = SensorConfig>) -> Self {
        let state = MemoryState {
            sensors: sensors
                .into_iter()
                .map(|sensor| (sensor.sensor_id.clone(), sensor))
                .collect(),
            ..Default::default()
        };

        Self {
            state: RwLock::new(state),
            writable: AtomicBool::new(true),
            alerts_writable: AtomicBool::new(true),
        }
    }

    pub async fn upsert_sensor(&self, sensor: SensorConfig) {
        self.state
            .write()
            .await
            .sensors
            .insert(sensor.sensor_id.clone(), sensor);
    }

    /// Make every subsequent write fail with [`StorageError::Unavailable`]
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Fail alert writes only, readings are still stored
    pub fn set_alerts_writable(&self, writable: bool) {
        self.alerts_writable.store(writable, Ordering::SeqCst);
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory store is read-only".to_string()))
        }
    }

    /// Every stored reading, in insertion order
    pub async fn readings(&self) -> Vec<Reading> {
        self.state.read().await.readings.clone()
    }

    /// Every stored alert, in insertion order
    pub async fn alerts(&self) -> Vec<AlertEvent> {
        self.state.read().await.alerts.clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first<T>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut items: Vec<T> = items.collect();
    // stable sort keeps later inserts first among equal timestamps
    items.reverse();
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
    items
}

#[async_trait]
impl ReadingStore for MemoryBackend {
    async fn append_reading(&self, reading: &Reading) -> StorageResult<bool> {
        self.ensure_writable()?;

        let mut state = self.state.write().await;
        let key = (
            reading.sensor_id.clone(),
            timestamp_to_millis(&reading.timestamp),
        );
        if !state.reading_keys.insert(key) {
            debug!("in-memory backend: duplicate reading ignored");
            return Ok(false);
        }

        state.readings.push(reading.clone());
        Ok(true)
    }

    async fn append_alert(&self, alert: &AlertEvent) -> StorageResult<bool> {
        self.ensure_writable()?;
        if !self.alerts_writable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("alert table is read-only".to_string()));
        }

        let mut state = self.state.write().await;
        let key = (
            alert.sensor_id.clone(),
            alert.kind,
            timestamp_to_millis(&alert.created_at),
        );
        if !state.alert_keys.insert(key) {
            return Ok(false);
        }

        state.alerts.push(alert.clone());
        Ok(true)
    }

    async fn latest_readings(&self) -> StorageResult<Vec<Reading>> {
        let state = self.state.read().await;

        let mut latest: HashMap<&str, &Reading> = HashMap::new();
        for reading in &state.readings {
            latest
                .entry(reading.sensor_id.as_str())
                .and_modify(|current| {
                    if reading.timestamp > current.timestamp {
                        *current = reading;
                    }
                })
                .or_insert(reading);
        }

        let mut readings: Vec<Reading> = latest.into_values().cloned().collect();
        readings.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        Ok(readings)
    }

    async fn readings_by_sensor(
        &self,
        sensor_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Reading>> {
        let state = self.state.read().await;
        let matching = state
            .readings
            .iter()
            .filter(|r| r.sensor_id == sensor_id)
            .cloned();

        let mut readings = newest_first(matching, |r| r.timestamp);
        readings.truncate(limit);
        Ok(readings)
    }

    async fn alerts_by_sensor(
        &self,
        sensor_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<AlertEvent>> {
        let state = self.state.read().await;
        let matching = state
            .alerts
            .iter()
            .filter(|a| a.sensor_id == sensor_id)
            .cloned();

        let mut alerts = newest_first(matching, |a| a.created_at);
        alerts.truncate(limit);
        Ok(alerts)
    }

    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<AlertEvent>> {
        let state = self.state.read().await;
        let matching = state
            .alerts
            .iter()
            .filter(|a| a.created_at > since)
            .cloned();

        Ok(newest_first(matching, |a| a.created_at))
    }

    async fn get_stats(&self) -> StorageResult<StoreStats> {
        let state = self.state.read().await;
        Ok(StoreStats {
            sensors: state.sensors.len() as u64,
            readings: state.readings.len() as u64,
            alerts: state.alerts.len() as u64,
        })
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let writable = self.writable.load(Ordering::SeqCst);
        let state = self.state.read().await;

        Ok(HealthStatus {
            healthy: writable,
            message: if writable {
                "In-memory storage operational".to_string()
            } else {
                "In-memory storage is read-only".to_string()
            },
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_readings".to_string(), state.readings.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}

#[async_trait]
impl SensorDirectory for MemoryBackend {
    async fn get(&self, sensor_id: &str) -> Result<Option<SensorConfig>, SensorDirectoryError> {
        Ok(self.state.read().await.sensors.get(sensor_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<SensorConfig>, SensorDirectoryError> {
        let state = self.state.read().await;
        let mut sensors: Vec<SensorConfig> = state
            .sensors
            .values()
            .filter(|sensor| sensor.active)
            .cloned()
            .collect();
        sensors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sensors)
    }
}
