//! Connection loss and recovery tests
//!
//! All tests run on a paused clock so the fixed reconnect delay elapses instantly.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use sensor_pipeline::SensorConfig;
use sensor_pipeline::actors::{ConsumerHandle, PublisherHandle};
use sensor_pipeline::broker::{ChannelRole, ConnectionManager, MemoryBroker, RECONNECT_DELAY};
use sensor_pipeline::config::PublisherSettings;
use sensor_pipeline::processor::ReadingProcessor;
use sensor_pipeline::storage::MemoryBackend;

use crate::helpers::*;

fn quiet_publisher_settings() -> PublisherSettings {
    PublisherSettings {
        publish_interval: Duration::from_secs(3600),
        refresh_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_consumer_resubscribes_after_connection_loss() {
    let broker = MemoryBroker::new();
    let store = Arc::new(MemoryBackend::with_sensors([server_room()]));
    let manager =
        connected_manager(&broker, &broker_settings(false), ChannelRole::Consumer).await;
    let consumer = ConsumerHandle::spawn(
        manager.clone(),
        ReadingProcessor::new(store.clone(), store.clone()),
    );

    broker.inject(QUEUE, reading_json("s1", 21.0, 50.0, 0));
    wait_for_settled(&consumer, 1).await;

    broker.disconnect();
    broker.inject(QUEUE, reading_json("s1", 21.0, 50.0, 1));

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_secs(1)).await;
    let stats = wait_for_settled(&consumer, 2).await;

    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(broker.connect_attempts().len(), 2);
    assert_eq!(store.readings().await.len(), 2);

    consumer.shutdown().await.unwrap();
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsettled_message_is_redelivered_once_reconnected() {
    let broker = MemoryBroker::new();
    let sensors = Arc::new(MemoryBackend::with_sensors([server_room()]));
    let store = Arc::new(SlowStore::new(sensors.clone(), Duration::from_secs(2)));
    let manager =
        connected_manager(&broker, &broker_settings(false), ChannelRole::Consumer).await;
    let consumer = ConsumerHandle::spawn(
        manager.clone(),
        ReadingProcessor::new(sensors.clone(), store),
    );

    broker.inject(QUEUE, reading_json("s1", 30.0, 50.0, 0));

    // Drop the connection while the reading is being written
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.unacked_count(QUEUE), 1);
    broker.disconnect();

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_secs(5)).await;
    let stats = wait_for_settled(&consumer, 1).await;

    // First delivery could not be acknowledged, the redelivery is a duplicate
    assert_eq!(stats.received, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(sensors.readings().await.len(), 1);
    assert_eq!(sensors.alerts().await.len(), 1);
    assert_eq!(broker.stats().redelivered, 1);
    assert_eq!(broker.ready_count(QUEUE), 0);

    consumer.shutdown().await.unwrap();
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_publisher_drops_while_disconnected_and_resumes() {
    let broker = MemoryBroker::new();
    let directory = Arc::new(MemoryBackend::with_sensors([server_room()]));
    let manager =
        connected_manager(&broker, &broker_settings(false), ChannelRole::Publisher).await;
    let publisher = PublisherHandle::spawn_with_rng(
        manager.clone(),
        directory,
        quiet_publisher_settings(),
        StdRng::seed_from_u64(3),
    );

    assert_eq!(publisher.publish_now().await.unwrap(), 1);

    broker.disconnect();
    assert_eq!(publisher.publish_now().await.unwrap(), 0);

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_secs(1)).await;
    assert_eq!(publisher.publish_now().await.unwrap(), 1);

    let stats = publisher.shutdown().await.unwrap();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(broker.ready_count(QUEUE), 2);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_persistent_readings_survive_broker_restart() {
    let broker = MemoryBroker::new();
    let sensors = Arc::new(MemoryBackend::with_sensors(["s1", "s2", "s3"].map(|id| {
        SensorConfig {
            sensor_id: id.to_string(),
            ..server_room()
        }
    })));

    let publisher_manager =
        connected_manager(&broker, &broker_settings(false), ChannelRole::Publisher).await;
    let publisher = PublisherHandle::spawn_with_rng(
        publisher_manager.clone(),
        sensors.clone(),
        quiet_publisher_settings(),
        StdRng::seed_from_u64(9),
    );
    assert_eq!(publisher.publish_now().await.unwrap(), 3);
    publisher.shutdown().await.unwrap();
    publisher_manager.close().await;

    broker.restart();
    assert_eq!(broker.queue_is_durable(QUEUE), Some(true));
    assert_eq!(broker.ready_count(QUEUE), 3);

    let consumer_manager =
        connected_manager(&broker, &broker_settings(false), ChannelRole::Consumer).await;
    let consumer = ConsumerHandle::spawn(
        consumer_manager.clone(),
        ReadingProcessor::new(sensors.clone(), sensors.clone()),
    );

    let stats = wait_for_settled(&consumer, 3).await;
    assert_eq!(stats.acknowledged, 3);
    assert_eq!(sensors.readings().await.len(), 3);

    consumer.shutdown().await.unwrap();
    consumer_manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_completes_while_broker_unreachable() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let store = Arc::new(MemoryBackend::new());

    let manager = ConnectionManager::new(
        Arc::new(broker.clone()),
        &broker_settings(false),
        ChannelRole::Consumer,
    );
    manager.start().await;
    let consumer = ConsumerHandle::spawn(
        manager.clone(),
        ReadingProcessor::new(store.clone(), store),
    );

    tokio::time::sleep(RECONNECT_DELAY * 3 + Duration::from_millis(500)).await;
    assert_eq!(broker.connect_attempts().len(), 4);

    let stats = consumer.shutdown().await.unwrap();
    assert_eq!(stats.subscriptions, 0);

    manager.close().await;
    assert!(manager.is_closed());
    assert_eq!(broker.open_channels(), 0);

    // No further attempts once closed
    tokio::time::sleep(RECONNECT_DELAY * 2).await;
    assert_eq!(broker.connect_attempts().len(), 4);
}
