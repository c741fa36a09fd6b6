//! Database rows and their mapping to domain types
//!
//! Timestamps are stored as Unix milliseconds (`INTEGER`), so uniqueness on
//! `(sensor_id, timestamp)` is exact and range scans use plain integer indexes.

use chrono::{DateTime, Utc};

use super::error::StorageError;
use crate::{AlertEvent, AlertKind, Reading, SensorConfig};

pub fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// A row of `sensor_readings`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "storage-sqlite", derive(sqlx::FromRow))]
pub struct ReadingRow {
    pub sensor_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: i64,
}

impl From<&Reading> for ReadingRow {
    fn from(reading: &Reading) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            timestamp: timestamp_to_millis(&reading.timestamp),
        }
    }
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Self {
            sensor_id: row.sensor_id,
            temperature: row.temperature,
            humidity: row.humidity,
            timestamp: millis_to_timestamp(row.timestamp),
        }
    }
}

/// A row of `alerts`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "storage-sqlite", derive(sqlx::FromRow))]
pub struct AlertRow {
    pub sensor_id: String,
    pub alert_type: String,
    pub message: String,
    pub temperature: f64,
    pub humidity: f64,
    pub threshold_exceeded: String,
    pub created_at: i64,
}

impl From<&AlertEvent> for AlertRow {
    fn from(alert: &AlertEvent) -> Self {
        Self {
            sensor_id: alert.sensor_id.clone(),
            alert_type: alert.kind.as_str().to_string(),
            message: alert.message.clone(),
            temperature: alert.temperature,
            humidity: alert.humidity,
            threshold_exceeded: alert.threshold_exceeded.clone(),
            created_at: timestamp_to_millis(&alert.created_at),
        }
    }
}

impl TryFrom<AlertRow> for AlertEvent {
    type Error = StorageError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let kind = AlertKind::parse(&row.alert_type).ok_or_else(|| {
            StorageError::SerializationError(format!("unknown alert type {:?}", row.alert_type))
        })?;

        Ok(Self {
            sensor_id: row.sensor_id,
            kind,
            message: row.message,
            temperature: row.temperature,
            humidity: row.humidity,
            threshold_exceeded: row.threshold_exceeded,
            created_at: millis_to_timestamp(row.created_at),
        })
    }
}

/// A row of `sensors`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "storage-sqlite", derive(sqlx::FromRow))]
pub struct SensorRow {
    pub sensor_id: String,
    pub name: String,
    pub location: Option<String>,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub min_humidity: f64,
    pub max_humidity: f64,
    pub active: bool,
}

impl From<SensorRow> for SensorConfig {
    fn from(row: SensorRow) -> Self {
        Self {
            sensor_id: row.sensor_id,
            name: row.name,
            location: row.location,
            min_temperature: row.min_temperature,
            max_temperature: row.max_temperature,
            min_humidity: row.min_humidity,
            max_humidity: row.max_humidity,
            active: row.active,
        }
    }
}
