//! Helper functions for integration tests

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sensor_pipeline::actors::{ConsumerHandle, ConsumerStats};
use sensor_pipeline::broker::{ChannelRole, ConnectionManager, MemoryBroker};
use sensor_pipeline::config::BrokerSettings;
use sensor_pipeline::storage::{
    HealthStatus, MemoryBackend, ReadingStore, StorageResult, StoreStats,
};
use sensor_pipeline::{AlertEvent, Reading, SensorConfig};
use tracing::Level;
use tracing::subscriber::DefaultGuard;

pub const QUEUE: &str = "sensor_data";
pub const DEAD_LETTER_QUEUE: &str = "sensor_data.dead";

pub fn server_room() -> SensorConfig {
    SensorConfig {
        sensor_id: "s1".to_string(),
        name: "Server Room".to_string(),
        location: Some("Building A".to_string()),
        min_temperature: 18.0,
        max_temperature: 26.0,
        min_humidity: 40.0,
        max_humidity: 60.0,
        active: true,
    }
}

pub fn reading_json(sensor_id: &str, temperature: f64, humidity: f64, second: u32) -> String {
    serde_json::json!({
        "sensor_id": sensor_id,
        "temperature": temperature,
        "humidity": humidity,
        "timestamp": format!("2025-06-01T12:00:{second:02}.000Z"),
    })
    .to_string()
}

pub fn broker_settings(dead_letter: bool) -> BrokerSettings {
    BrokerSettings {
        queue: QUEUE.to_string(),
        dead_letter_queue: dead_letter.then(|| DEAD_LETTER_QUEUE.to_string()),
        ..Default::default()
    }
}

/// Start a manager against the in-memory broker and wait until
/// the queues are declared
pub async fn connected_manager(
    broker: &MemoryBroker,
    settings: &BrokerSettings,
    role: ChannelRole,
) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(Arc::new(broker.clone()), settings, role);
    manager.start().await;
    tokio::time::timeout(Duration::from_secs(1), manager.wait_for_channel())
        .await
        .expect("manager did not connect")
        .expect("manager closed");
    manager
}

/// Poll the consumer until `expected` messages were acknowledged or rejected
pub async fn wait_for_settled(consumer: &ConsumerHandle, expected: u64) -> ConsumerStats {
    for _ in 0..300 {
        let stats = consumer.get_stats().await.expect("consumer stopped");
        if stats.acknowledged + stats.rejected >= expected {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("consumer did not settle {expected} messages in time");
}

/// Store wrapper that delays every write, used to observe flow control
pub struct SlowStore {
    inner: Arc<MemoryBackend>,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<MemoryBackend>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ReadingStore for SlowStore {
    async fn append_reading(&self, reading: &Reading) -> StorageResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_reading(reading).await
    }

    async fn append_alert(&self, alert: &AlertEvent) -> StorageResult<bool> {
        self.inner.append_alert(alert).await
    }

    async fn latest_readings(&self) -> StorageResult<Vec<Reading>> {
        self.inner.latest_readings().await
    }

    async fn readings_by_sensor(&self, sensor_id: &str, limit: usize) -> StorageResult<Vec<Reading>> {
        self.inner.readings_by_sensor(sensor_id, limit).await
    }

    async fn alerts_by_sensor(&self, sensor_id: &str, limit: usize) -> StorageResult<Vec<AlertEvent>> {
        self.inner.alerts_by_sensor(sensor_id, limit).await
    }

    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<AlertEvent>> {
        self.inner.recent_alerts(since).await
    }

    async fn get_stats(&self) -> StorageResult<StoreStats> {
        self.inner.get_stats().await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

/// Captures formatted log output of the current thread
///
/// Works with the default current-thread test runtime, where spawned actors
/// are polled on the test thread.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: DefaultGuard,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn install() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .without_time()
            .with_writer(move || CaptureWriter(Arc::clone(&writer)))
            .finish();

        Self {
            buffer,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Index of the first line containing every fragment
    pub fn position(&self, fragments: &[&str]) -> Option<usize> {
        self.lines()
            .iter()
            .position(|line| fragments.iter().all(|f| line.contains(f)))
    }
}
