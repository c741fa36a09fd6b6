//! Reading store trait definition

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::{AlertEvent, Reading};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Row counts of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sensors: u64,
    pub readings: u64,
    pub alerts: u64,
}

/// Append-only persistence of readings and alerts
///
/// Writes are idempotent: a reading is unique on `(sensor_id, timestamp)` and an
/// alert on `(sensor_id, kind, created_at)`. Inserting a duplicate is not an error,
/// the write methods report `false` instead.
///
/// Implementations must be `Send + Sync` as they are shared across tasks.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Persist a reading. Returns `false` if it was already stored.
    async fn append_reading(&self, reading: &Reading) -> StorageResult<bool>;

    /// Persist an alert. Returns `false` if it was already stored.
    async fn append_alert(&self, alert: &AlertEvent) -> StorageResult<bool>;

    /// The most recent reading of every sensor that has one, ordered by sensor id
    async fn latest_readings(&self) -> StorageResult<Vec<Reading>>;

    /// The `limit` most recent readings of a sensor, newest first
    async fn readings_by_sensor(&self, sensor_id: &str, limit: usize)
    -> StorageResult<Vec<Reading>>;

    /// The `limit` most recent alerts of a sensor, newest first
    async fn alerts_by_sensor(&self, sensor_id: &str, limit: usize)
    -> StorageResult<Vec<AlertEvent>>;

    /// All alerts created after `since`, newest first
    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<AlertEvent>>;

    async fn get_stats(&self) -> StorageResult<StoreStats>;

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend is operational.
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
