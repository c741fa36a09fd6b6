//! SQLite storage backend
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the consumer's writes
//! - **Connection pooling**: 5 connections
//! - **Migrations**: `sensors`, `sensor_readings` and `alerts` are created by the
//!   embedded sqlx migrations on startup
//!
//! The same database holds sensor configuration, so the backend also serves as
//! the consumer's [`SensorDirectory`].

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, ReadingStore, StoreStats};
use super::error::{StorageError, StorageResult};
use super::schema::{AlertRow, ReadingRow, SensorRow, timestamp_to_millis};
use crate::sensors::{SensorDirectory, SensorDirectoryError};
use crate::{AlertEvent, Reading, SensorConfig};

const SENSOR_COLUMNS: &str = "sensor_id, name, location, min_temperature, max_temperature, \
                              min_humidity, max_humidity, active";

const ALERT_COLUMNS: &str =
    "sensor_id, alert_type, message, temperature, humidity, threshold_exceeded, created_at";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use sensor_pipeline::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./sensors.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    /// Insert or update a sensor configuration
    #[instrument(skip(self, sensor), fields(sensor_id = %sensor.sensor_id))]
    pub async fn upsert_sensor(&self, sensor: &SensorConfig) -> StorageResult<()> {
        let now = timestamp_to_millis(&Utc::now());

        sqlx::query(
            r#"
            INSERT INTO sensors (
                sensor_id, name, location, min_temperature, max_temperature,
                min_humidity, max_humidity, active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (sensor_id) DO UPDATE SET
                name = excluded.name,
                location = excluded.location,
                min_temperature = excluded.min_temperature,
                max_temperature = excluded.max_temperature,
                min_humidity = excluded.min_humidity,
                max_humidity = excluded.max_humidity,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&sensor.sensor_id)
        .bind(&sensor.name)
        .bind(&sensor.location)
        .bind(sensor.min_temperature)
        .bind(sensor.max_temperature)
        .bind(sensor.min_humidity)
        .bind(sensor.max_humidity)
        .bind(sensor.active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("sensor configuration stored");
        Ok(())
    }

    async fn fetch_sensor(&self, sensor_id: &str) -> StorageResult<Option<SensorConfig>> {
        let sql = format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE sensor_id = ?");
        let row: Option<SensorRow> = sqlx::query_as(&sql)
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(SensorConfig::from))
    }

    async fn fetch_active_sensors(&self) -> StorageResult<Vec<SensorConfig>> {
        let sql = format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE active = 1 ORDER BY name");
        let rows: Vec<SensorRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(SensorConfig::from).collect())
    }

    fn alerts_from_rows(rows: Vec<AlertRow>) -> StorageResult<Vec<AlertEvent>> {
        rows.into_iter().map(AlertEvent::try_from).collect()
    }
}

#[async_trait]
impl ReadingStore for SqliteBackend {
    #[instrument(skip(self, reading), fields(sensor_id = %reading.sensor_id))]
    async fn append_reading(&self, reading: &Reading) -> StorageResult<bool> {
        let row = ReadingRow::from(reading);

        let result = sqlx::query(
            r#"
            INSERT INTO sensor_readings (sensor_id, temperature, humidity, timestamp)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (sensor_id, timestamp) DO NOTHING
            "#,
        )
        .bind(&row.sensor_id)
        .bind(row.temperature)
        .bind(row.humidity)
        .bind(row.timestamp)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!("reading at {} already stored", reading.timestamp);
        }
        Ok(inserted)
    }

    #[instrument(skip(self, alert), fields(sensor_id = %alert.sensor_id, kind = %alert.kind))]
    async fn append_alert(&self, alert: &AlertEvent) -> StorageResult<bool> {
        let row = AlertRow::from(alert);

        let result = sqlx::query(
            r#"
            INSERT INTO alerts (
                sensor_id, alert_type, message, temperature, humidity,
                threshold_exceeded, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (sensor_id, alert_type, created_at) DO NOTHING
            "#,
        )
        .bind(&row.sensor_id)
        .bind(&row.alert_type)
        .bind(&row.message)
        .bind(row.temperature)
        .bind(row.humidity)
        .bind(&row.threshold_exceeded)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn latest_readings(&self) -> StorageResult<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT r.sensor_id, r.temperature, r.humidity, r.timestamp
            FROM sensor_readings r
            JOIN (
                SELECT sensor_id, MAX(timestamp) AS latest
                FROM sensor_readings
                GROUP BY sensor_id
            ) l ON l.sensor_id = r.sensor_id AND l.latest = r.timestamp
            ORDER BY r.sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Reading::from).collect())
    }

    #[instrument(skip(self))]
    async fn readings_by_sensor(
        &self,
        sensor_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT sensor_id, temperature, humidity, timestamp
            FROM sensor_readings
            WHERE sensor_id = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Reading::from).collect())
    }

    #[instrument(skip(self))]
    async fn alerts_by_sensor(
        &self,
        sensor_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<AlertEvent>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE sensor_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let rows: Vec<AlertRow> = sqlx::query_as(&sql)
            .bind(sensor_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Self::alerts_from_rows(rows)
    }

    #[instrument(skip(self), fields(since = %since))]
    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<AlertEvent>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE created_at > ? \
             ORDER BY created_at DESC, id DESC"
        );
        let rows: Vec<AlertRow> = sqlx::query_as(&sql)
            .bind(timestamp_to_millis(&since))
            .fetch_all(&self.pool)
            .await?;

        Self::alerts_from_rows(rows)
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<StoreStats> {
        let (sensors, readings, alerts): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sensors),
                (SELECT COUNT(*) FROM sensor_readings),
                (SELECT COUNT(*) FROM alerts)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            sensors: sensors.max(0) as u64,
            readings: readings.max(0) as u64,
            alerts: alerts.max(0) as u64,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite connection pool");
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl SensorDirectory for SqliteBackend {
    async fn get(&self, sensor_id: &str) -> Result<Option<SensorConfig>, SensorDirectoryError> {
        Ok(self.fetch_sensor(sensor_id).await?)
    }

    async fn list_active(&self) -> Result<Vec<SensorConfig>, SensorDirectoryError> {
        Ok(self.fetch_active_sensors().await?)
    }
}
