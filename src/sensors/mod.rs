//! Read access to sensor configuration
//!
//! The pipeline never writes sensor configuration. It reads it either from the
//! configuration API ([`http::HttpSensorDirectory`], used by the publisher) or
//! straight from the shared database (the SQLite store, used by the consumer).

pub mod http;

use async_trait::async_trait;

use crate::SensorConfig;
use crate::storage::StorageError;

pub use http::HttpSensorDirectory;

#[derive(Debug, thiserror::Error)]
pub enum SensorDirectoryError {
    #[error("configuration API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("configuration API returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("configuration API reported failure: {0}")]
    Unsuccessful(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Source of sensor configurations
#[async_trait]
pub trait SensorDirectory: Send + Sync {
    /// Look up a single sensor, `None` if it does not exist
    async fn get(&self, sensor_id: &str) -> Result<Option<SensorConfig>, SensorDirectoryError>;

    /// All sensors currently flagged active
    async fn list_active(&self) -> Result<Vec<SensorConfig>, SensorDirectoryError>;
}
