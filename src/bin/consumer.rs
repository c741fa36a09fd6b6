use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sensor_pipeline::{
    actors::ConsumerHandle,
    broker::{AmqpConnector, ChannelRole, ConnectionManager},
    config::{BrokerSettings, ConsumerSettings},
    processor::ReadingProcessor,
    storage::{ReadingStore, sqlite::SqliteBackend},
    util::{get_log_level, shutdown_signal},
};
use tracing::{error, info, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Persists sensor readings from the queue and raises threshold alerts
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Queue to consume from (overrides RABBITMQ_QUEUE_SENSOR_DATA)
    #[arg(long)]
    queue: Option<String>,

    /// SQLite database file (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<PathBuf>,
}

fn init() {
    let level = get_log_level();
    let filter = filter::Targets::new().with_targets(vec![
        ("sensor_pipeline", level),
        ("sensor_consumer", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut broker = BrokerSettings::from_env().context("invalid broker configuration")?;
    let mut settings = ConsumerSettings::from_env().context("invalid consumer configuration")?;

    if let Some(queue) = args.queue {
        broker.queue = queue;
    }
    if let Some(database) = args.database {
        settings.database_path = database;
    }

    // The store is required, the broker may come up later.
    let store = Arc::new(
        SqliteBackend::new(&settings.database_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open database {}",
                    settings.database_path.display()
                )
            })?,
    );

    let health = store.health_check().await.context("database health check failed")?;
    anyhow::ensure!(health.healthy, "database unhealthy: {}", health.message);
    info!("database ready: {}", health.message);

    let manager = ConnectionManager::new(
        Arc::new(AmqpConnector::new(&broker)),
        &broker,
        ChannelRole::Consumer,
    );
    manager.start().await;

    info!(
        "consumer started: broker {}, queue \"{}\"",
        broker.display_addr(),
        broker.queue
    );

    let processor = ReadingProcessor::new(store.clone(), store.clone());
    let consumer = ConsumerHandle::spawn(manager.clone(), processor);

    shutdown_signal().await;
    info!("shutdown signal received");

    match consumer.shutdown().await {
        Ok(stats) => info!(
            "processed {} messages: {} acknowledged, {} rejected, {} alerts",
            stats.received, stats.acknowledged, stats.rejected, stats.alerts_raised
        ),
        Err(e) => warn!("consumer did not stop cleanly: {e:#}"),
    }

    manager.close().await;

    if let Err(e) = store.close().await {
        error!("failed to close database: {e}");
    }
    info!("consumer stopped");

    Ok(())
}
