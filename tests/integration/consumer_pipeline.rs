//! End-to-end tests of the consume path
//!
//! These tests verify that:
//! - Valid readings are persisted, evaluated and acknowledged
//! - Unknown sensors are acknowledged without storing anything
//! - Failures reject the message without requeue (into the dead-letter queue)
//! - Prefetch = 1 keeps at most one message outstanding

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sensor_pipeline::AlertKind;
use sensor_pipeline::actors::ConsumerHandle;
use sensor_pipeline::broker::{ChannelRole, MemoryBroker};
use sensor_pipeline::processor::ReadingProcessor;
use sensor_pipeline::storage::MemoryBackend;

use crate::helpers::*;

struct Pipeline {
    broker: MemoryBroker,
    store: Arc<MemoryBackend>,
    consumer: ConsumerHandle,
}

async fn pipeline(dead_letter: bool) -> Pipeline {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryBackend::with_sensors([server_room()]));
    let manager = connected_manager(
        &broker,
        &broker_settings(dead_letter),
        ChannelRole::Consumer,
    )
    .await;

    let consumer = ConsumerHandle::spawn(
        manager,
        ReadingProcessor::new(store.clone(), store.clone()),
    );

    Pipeline {
        broker,
        store,
        consumer,
    }
}

#[tokio::test]
async fn test_high_temperature_is_persisted_alerted_and_acked() {
    let logs = LogCapture::install();
    let p = pipeline(false).await;

    p.broker.inject(QUEUE, reading_json("s1", 30.0, 50.0, 0));
    let stats = wait_for_settled(&p.consumer, 1).await;

    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.alerts_raised, 1);

    let readings = p.store.readings().await;
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].temperature, 30.0);

    let alerts = p.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::HighTemperature);
    assert_eq!(alerts[0].created_at, readings[0].timestamp);

    assert_eq!(p.broker.ready_count(QUEUE), 0);
    assert_eq!(p.broker.unacked_count(QUEUE), 0);
    assert_eq!(p.broker.stats().acknowledged, 1);

    // alert lines are framed by a banner on both sides
    let banner = "=".repeat(80);
    let open = logs.position(&["WARN", &banner]).expect("no opening banner");
    let title = logs
        .position(&["WARN", "ALERT TRIGGERED - CRITICAL"])
        .expect("no alert title");
    let message = logs
        .position(&["WARN", "HIGH_TEMPERATURE", &alerts[0].message])
        .expect("no alert message");
    let lines = logs.lines();
    assert_eq!((title, message), (open + 1, open + 2));
    assert!(lines[message + 1].contains("WARN"));
    assert!(lines[message + 1].contains(&banner));
}

#[tokio::test]
async fn test_unknown_sensor_is_acked_without_storing() {
    let logs = LogCapture::install();
    let p = pipeline(false).await;

    p.broker.inject(QUEUE, reading_json("ghost", 30.0, 50.0, 0));
    let stats = wait_for_settled(&p.consumer, 1).await;

    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.unknown_sensor, 1);
    assert!(p.store.readings().await.is_empty());
    assert!(p.store.alerts().await.is_empty());
    assert_eq!(p.broker.stats().acknowledged, 1);
    assert!(
        logs.position(&["WARN", "sensor ghost not found in configuration"])
            .is_some()
    );
}

#[tokio::test]
async fn test_low_humidity_raises_single_alert() {
    let p = pipeline(false).await;

    p.broker.inject(QUEUE, reading_json("s1", 22.0, 38.0, 0));
    wait_for_settled(&p.consumer, 1).await;

    let alerts = p.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::LowHumidity);
    assert_eq!(alerts[0].threshold_exceeded, "min_humidity: 40%");
}

#[tokio::test]
async fn test_store_failure_rejects_without_requeue() {
    let logs = LogCapture::install();
    let p = pipeline(false).await;
    p.store.set_writable(false);

    p.broker.inject(QUEUE, reading_json("s1", 30.0, 50.0, 0));
    let stats = wait_for_settled(&p.consumer, 1).await;

    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.acknowledged, 0);
    assert!(p.store.alerts().await.is_empty());

    // Not requeued: the message is gone from the working queue
    assert_eq!(p.broker.ready_count(QUEUE), 0);
    assert_eq!(p.broker.unacked_count(QUEUE), 0);
    assert_eq!(p.broker.stats().rejected, 1);

    assert!(
        logs.position(&[
            "ERROR",
            "rejecting without requeue",
            "stage=DECODED",
            "transient=true",
        ])
        .is_some()
    );
}

#[tokio::test]
async fn test_rejected_messages_land_in_dead_letter_queue() {
    let p = pipeline(true).await;

    p.broker.inject(QUEUE, "{\"sensor_id\": ");
    p.broker
        .inject(QUEUE, r#"{"sensor_id":"s1","temperature":"hot","humidity":50}"#);
    let stats = wait_for_settled(&p.consumer, 2).await;

    assert_eq!(stats.rejected, 2);
    assert_eq!(p.broker.ready_count(DEAD_LETTER_QUEUE), 2);
    assert_eq!(p.broker.stats().dead_lettered, 2);
    assert_eq!(
        p.broker.ready_bodies(DEAD_LETTER_QUEUE)[0],
        b"{\"sensor_id\": ".to_vec()
    );
}

#[tokio::test]
async fn test_redelivered_reading_is_not_duplicated() {
    let p = pipeline(false).await;
    let body = reading_json("s1", 22.0, 38.0, 5);

    p.broker.inject(QUEUE, body.clone());
    p.broker.inject(QUEUE, body);
    let stats = wait_for_settled(&p.consumer, 2).await;

    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(p.store.readings().await.len(), 1);
    assert_eq!(p.store.alerts().await.len(), 1);
}

#[tokio::test]
async fn test_prefetch_keeps_one_message_outstanding() {
    let broker = MemoryBroker::new();
    let sensors = Arc::new(MemoryBackend::with_sensors([server_room()]));
    let store = Arc::new(SlowStore::new(sensors.clone(), Duration::from_millis(20)));
    let manager =
        connected_manager(&broker, &broker_settings(false), ChannelRole::Consumer).await;
    let consumer = ConsumerHandle::spawn(manager, ReadingProcessor::new(sensors.clone(), store));

    for second in 0..5 {
        broker.inject(QUEUE, reading_json("s1", 21.0, 50.0, second));
    }

    let stats = wait_for_settled(&consumer, 5).await;
    assert_eq!(stats.acknowledged, 5);
    assert_eq!(broker.max_outstanding(), 1);
    assert_eq!(sensors.readings().await.len(), 5);

    // Readings are stored in queue order
    let seconds: Vec<u32> = sensors
        .readings()
        .await
        .iter()
        .map(|r| chrono::Timelike::second(&r.timestamp))
        .collect();
    assert_eq!(seconds, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_shutdown_reports_final_stats() {
    let p = pipeline(false).await;

    p.broker.inject(QUEUE, reading_json("s1", 21.0, 50.0, 0));
    wait_for_settled(&p.consumer, 1).await;

    let stats = p.consumer.shutdown().await.unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.subscriptions, 1);

    // The actor is gone, later requests fail
    assert!(p.consumer.get_stats().await.is_none());
}
