//! Sensor configuration API client
//!
//! The API wraps every payload as `{ "success": bool, "data": ... }`. Threshold
//! bounds come from a decimal column and may be serialized either as JSON numbers
//! or as strings; both are accepted. A bound that cannot be read becomes `NaN`,
//! which the simulator refuses with an explicit error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{SensorDirectory, SensorDirectoryError};
use crate::SensorConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<Option<T>, SensorDirectoryError> {
        if !self.success {
            return Err(SensorDirectoryError::Unsuccessful(
                self.error.unwrap_or_else(|| "no error message".to_string()),
            ));
        }
        Ok(self.data)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

fn bound(value: Option<Numeric>) -> f64 {
    match value {
        Some(Numeric::Number(number)) => number,
        Some(Numeric::Text(text)) => text.trim().parse().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}

#[derive(Debug, Deserialize)]
struct SensorPayload {
    sensor_id: String,
    name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    min_temperature: Option<Numeric>,
    #[serde(default)]
    max_temperature: Option<Numeric>,
    #[serde(default)]
    min_humidity: Option<Numeric>,
    #[serde(default)]
    max_humidity: Option<Numeric>,
    #[serde(default)]
    active: Option<bool>,
}

impl From<SensorPayload> for SensorConfig {
    fn from(payload: SensorPayload) -> Self {
        Self {
            sensor_id: payload.sensor_id,
            name: payload.name,
            location: payload.location,
            min_temperature: bound(payload.min_temperature),
            max_temperature: bound(payload.max_temperature),
            min_humidity: bound(payload.min_humidity),
            max_humidity: bound(payload.max_humidity),
            active: payload.active.unwrap_or(true),
        }
    }
}

/// Reads sensor configuration from `{base_url}/api/sensors`
pub struct HttpSensorDirectory {
    client: Client,
    base_url: String,
}

impl HttpSensorDirectory {
    pub fn new(base_url: &str) -> Result<Self, SensorDirectoryError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SensorDirectory for HttpSensorDirectory {
    #[instrument(skip(self))]
    async fn get(&self, sensor_id: &str) -> Result<Option<SensorConfig>, SensorDirectoryError> {
        let url = format!("{}/api/sensors/{}", self.base_url, sensor_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("sensor {} not found", sensor_id);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SensorDirectoryError::Status(response.status()));
        }

        let body: ApiResponse<SensorPayload> = response.json().await?;
        Ok(body.into_data()?.map(SensorConfig::from))
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<SensorConfig>, SensorDirectoryError> {
        let url = format!("{}/api/sensors", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(SensorDirectoryError::Status(response.status()));
        }

        let body: ApiResponse<Vec<SensorPayload>> = response.json().await?;
        let sensors: Vec<SensorConfig> = body
            .into_data()?
            .unwrap_or_default()
            .into_iter()
            .map(SensorConfig::from)
            .filter(|sensor| sensor.active)
            .collect();

        debug!("configuration API returned {} active sensors", sensors.len());
        Ok(sensors)
    }
}
