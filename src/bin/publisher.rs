use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sensor_pipeline::{
    actors::PublisherHandle,
    broker::{AmqpConnector, ChannelRole, ConnectionManager},
    config::{BrokerSettings, PublisherSettings},
    sensors::HttpSensorDirectory,
    util::{get_log_level, shutdown_signal},
};
use tracing::{info, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Publishes synthetic temperature and humidity readings for every active sensor
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Queue to publish to (overrides RABBITMQ_QUEUE_SENSOR_DATA)
    #[arg(long)]
    queue: Option<String>,

    /// Publish interval in milliseconds (overrides SENSOR_INTERVAL_MS)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Base URL of the sensor configuration API (overrides API_PRINCIPAL_URL)
    #[arg(long)]
    api_url: Option<String>,
}

fn init() {
    let level = get_log_level();
    let filter = filter::Targets::new().with_targets(vec![
        ("sensor_pipeline", level),
        ("sensor_publisher", level),
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
    let mut settings = PublisherSettings::from_env().context("invalid publisher configuration")?;

    if let Some(queue) = args.queue {
        broker.queue = queue;
    }
    if let Some(interval_ms) = args.interval_ms {
        anyhow::ensure!(interval_ms > 0, "--interval-ms must be greater than zero");
        settings.publish_interval = Duration::from_millis(interval_ms);
    }
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url.trim_end_matches('/').to_string();
    }

    let directory = HttpSensorDirectory::new(&settings.api_url)
        .context("failed to build sensor API client")?;

    let manager = ConnectionManager::new(
        Arc::new(AmqpConnector::new(&broker)),
        &broker,
        ChannelRole::Publisher,
    );
    manager.start().await;

    info!(
        "publisher started: broker {}, queue \"{}\", api {}",
        broker.display_addr(),
        broker.queue,
        settings.api_url
    );

    let publisher = PublisherHandle::spawn(manager.clone(), Arc::new(directory), settings);

    shutdown_signal().await;
    info!("shutdown signal received");

    match publisher.shutdown().await {
        Ok(stats) => info!(
            "published {} readings in {} rounds ({} dropped)",
            stats.published, stats.rounds, stats.dropped
        ),
        Err(e) => warn!("publisher did not stop cleanly: {e:#}"),
    }

    manager.close().await;
    info!("publisher stopped");

    Ok(())
}
