//! Full pipeline: configuration API → publisher → queue → consumer → SQLite

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use sensor_pipeline::SensorConfig;
use sensor_pipeline::actors::{ConsumerHandle, PublisherHandle};
use sensor_pipeline::broker::{ChannelRole, MemoryBroker};
use sensor_pipeline::config::PublisherSettings;
use sensor_pipeline::processor::ReadingProcessor;
use sensor_pipeline::sensors::HttpSensorDirectory;
use sensor_pipeline::storage::ReadingStore;
use sensor_pipeline::storage::sqlite::SqliteBackend;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn lab() -> SensorConfig {
    SensorConfig {
        sensor_id: "s2".to_string(),
        name: "Lab".to_string(),
        location: None,
        min_temperature: 15.0,
        max_temperature: 25.0,
        min_humidity: 30.0,
        max_humidity: 50.0,
        active: true,
    }
}

async fn mock_api(sensors: &[SensorConfig]) -> MockServer {
    let server = MockServer::start().await;

    // Bounds come back as decimal strings, the way the configuration API stores them
    let data: Vec<serde_json::Value> = sensors
        .iter()
        .map(|s| {
            serde_json::json!({
                "sensor_id": s.sensor_id,
                "name": s.name,
                "location": s.location,
                "min_temperature": format!("{:.2}", s.min_temperature),
                "max_temperature": format!("{:.2}", s.max_temperature),
                "min_humidity": format!("{:.2}", s.min_humidity),
                "max_humidity": format!("{:.2}", s.max_humidity),
                "active": s.active,
            })
        })
        .collect();

    Mock::given(method("GET"))
        .and(path("/api/sensors"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "success": true, "data": data })),
        )
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn test_published_readings_are_persisted() {
    let api = mock_api(&[server_room(), lab()]).await;

    let temp_dir = tempdir().unwrap();
    let store = Arc::new(
        SqliteBackend::new(temp_dir.path().join("pipeline.db"))
            .await
            .unwrap(),
    );
    store.upsert_sensor(&server_room()).await.unwrap();
    store.upsert_sensor(&lab()).await.unwrap();

    let broker = MemoryBroker::new();
    let settings = broker_settings(false);

    let publisher_manager = connected_manager(&broker, &settings, ChannelRole::Publisher).await;
    let consumer_manager = connected_manager(&broker, &settings, ChannelRole::Consumer).await;

    let publisher = PublisherHandle::spawn_with_rng(
        publisher_manager.clone(),
        Arc::new(HttpSensorDirectory::new(&api.uri()).unwrap()),
        PublisherSettings {
            publish_interval: std::time::Duration::from_secs(3600),
            refresh_interval: std::time::Duration::from_secs(3600),
            api_url: api.uri(),
        },
        StdRng::seed_from_u64(42),
    );
    let consumer = ConsumerHandle::spawn(
        consumer_manager.clone(),
        ReadingProcessor::new(store.clone(), store.clone()),
    );

    assert_eq!(publisher.refresh_now().await.unwrap(), 2);
    assert_eq!(publisher.publish_now().await.unwrap(), 2);

    let stats = wait_for_settled(&consumer, 2).await;
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.unknown_sensor, 0);

    let latest = store.latest_readings().await.unwrap();
    let ids: Vec<&str> = latest.iter().map(|r| r.sensor_id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s2"]);

    let store_stats = store.get_stats().await.unwrap();
    assert_eq!(store_stats.readings, 2);
    assert_eq!(store_stats.alerts, stats.alerts_raised);

    publisher.shutdown().await.unwrap();
    consumer.shutdown().await.unwrap();
    publisher_manager.close().await;
    consumer_manager.close().await;
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_api_outage_keeps_cached_sensors() {
    let api = mock_api(&[server_room()]).await;
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker, &broker_settings(false), ChannelRole::Publisher).await;

    let publisher = PublisherHandle::spawn_with_rng(
        manager.clone(),
        Arc::new(HttpSensorDirectory::new(&api.uri()).unwrap()),
        PublisherSettings {
            publish_interval: std::time::Duration::from_secs(3600),
            refresh_interval: std::time::Duration::from_secs(3600),
            api_url: api.uri(),
        },
        StdRng::seed_from_u64(1),
    );
    assert_eq!(publisher.refresh_now().await.unwrap(), 1);

    api.reset().await;
    Mock::given(method("GET"))
        .and(path("/api/sensors"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&api)
        .await;

    assert_eq!(publisher.refresh_now().await.unwrap(), 1);
    assert_eq!(publisher.publish_now().await.unwrap(), 1);

    let stats = publisher.shutdown().await.unwrap();
    assert_eq!(stats.refresh_failures, 1);
    manager.close().await;
}
