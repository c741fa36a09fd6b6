//! Integration tests for SQLite persistence
//!
//! These tests verify that:
//! - Processed readings and alerts survive reopening the database
//! - Redelivered readings stay deduplicated across restarts
//! - Queries return the stored data newest first

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use sensor_pipeline::AlertKind;
use sensor_pipeline::processor::{Outcome, ReadingProcessor};
use sensor_pipeline::storage::ReadingStore;
use sensor_pipeline::storage::sqlite::SqliteBackend;
use tempfile::tempdir;

use crate::helpers::*;

#[tokio::test]
async fn test_processed_readings_survive_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("readings.db");

    {
        let store = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        store.upsert_sensor(&server_room()).await.unwrap();
        let processor = ReadingProcessor::new(store.clone(), store.clone());

        let outcome = processor
            .process(reading_json("s1", 30.0, 38.0, 0).as_bytes())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Processed { ref alerts } if alerts.len() == 2));

        processor
            .process(reading_json("s1", 22.0, 50.0, 10).as_bytes())
            .await
            .unwrap();

        store.close().await.unwrap();
    }

    let store = Arc::new(SqliteBackend::new(&db_path).await.unwrap());

    let readings = store.readings_by_sensor("s1", 10).await.unwrap();
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].temperature, 22.0);
    assert_eq!(
        readings[1].timestamp,
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    );

    let alerts = store.alerts_by_sensor("s1", 10).await.unwrap();
    let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.contains(&AlertKind::HighTemperature));
    assert!(kinds.contains(&AlertKind::LowHumidity));

    // A redelivery after the restart is recognised
    let processor = ReadingProcessor::new(store.clone(), store.clone());
    let outcome = processor
        .process(reading_json("s1", 30.0, 38.0, 0).as_bytes())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Duplicate);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.sensors, 1);
    assert_eq!(stats.readings, 2);
    assert_eq!(stats.alerts, 2);
}

#[tokio::test]
async fn test_recent_alerts_window() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(
        SqliteBackend::new(temp_dir.path().join("alerts.db"))
            .await
            .unwrap(),
    );
    store.upsert_sensor(&server_room()).await.unwrap();
    let processor = ReadingProcessor::new(store.clone(), store.clone());

    for second in [0, 20, 40] {
        processor
            .process(reading_json("s1", 27.5, 50.0, second).as_bytes())
            .await
            .unwrap();
    }

    let since = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(10);
    let recent = store.recent_alerts(since).await.unwrap();

    let seconds: Vec<i64> = recent
        .iter()
        .map(|a| (a.created_at - since).num_seconds())
        .collect();
    assert_eq!(seconds, vec![30, 10]);
}

#[tokio::test]
async fn test_health_check_reports_healthy_database() {
    let temp_dir = tempdir().unwrap();
    let store = SqliteBackend::new(temp_dir.path().join("health.db"))
        .await
        .unwrap();

    let health = store.health_check().await.unwrap();
    assert!(health.healthy);

    store.close().await.unwrap();
}
