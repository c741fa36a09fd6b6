pub mod actors;
pub mod broker;
pub mod config;
pub mod processor;
pub mod sensors;
pub mod simulator;
pub mod storage;
pub mod thresholds;
pub mod util;

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Threshold configuration of a single sensor
///
/// Owned by the configuration layer. The pipeline only ever reads it and trusts
/// that `min < max` holds for both metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub min_humidity: f64,
    pub max_humidity: f64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A single temperature/humidity measurement
///
/// This is also the queue wire format. A payload without `timestamp`, or with
/// a null one, is stamped with the time it was decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub temperature: f64,
    pub humidity: f64,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Parse an ISO-8601 timestamp
///
/// Timestamps with an offset are converted to UTC, timestamps without one are
/// taken to be UTC already.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(timestamp) => Ok(timestamp.with_timezone(&Utc)),
        Err(err) => raw
            .parse::<NaiveDateTime>()
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw).map_err(serde::de::Error::custom),
        None => Ok(Utc::now()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    LowTemperature,
    HighTemperature,
    LowHumidity,
    HighHumidity,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LowTemperature => "LOW_TEMPERATURE",
            AlertKind::HighTemperature => "HIGH_TEMPERATURE",
            AlertKind::LowHumidity => "LOW_HUMIDITY",
            AlertKind::HighHumidity => "HIGH_HUMIDITY",
        }
    }

    pub fn parse(value: &str) -> Option<AlertKind> {
        match value {
            "LOW_TEMPERATURE" => Some(AlertKind::LowTemperature),
            "HIGH_TEMPERATURE" => Some(AlertKind::HighTemperature),
            "LOW_HUMIDITY" => Some(AlertKind::LowHumidity),
            "HIGH_HUMIDITY" => Some(AlertKind::HighHumidity),
            _ => None,
        }
    }

    pub fn is_temperature(&self) -> bool {
        matches!(self, AlertKind::LowTemperature | AlertKind::HighTemperature)
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold violation raised for one metric of one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub sensor_id: String,
    #[serde(rename = "alert_type")]
    pub kind: AlertKind,
    pub message: String,
    pub temperature: f64,
    pub humidity: f64,
    /// Which bound was crossed, e.g. `max_temperature: 26°C`
    pub threshold_exceeded: String,
    /// Timestamp of the triggering reading
    pub created_at: DateTime<Utc>,
}
