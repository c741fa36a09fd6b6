pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_QUEUE_SENSOR_DATA: &str = "RABBITMQ_QUEUE_SENSOR_DATA";
pub const BROKER_DEAD_LETTER_QUEUE: &str = "BROKER_DEAD_LETTER_QUEUE";

pub const SENSOR_INTERVAL_MS: &str = "SENSOR_INTERVAL_MS";
pub const SENSOR_REFRESH_INTERVAL_MS: &str = "SENSOR_REFRESH_INTERVAL_MS";
pub const API_PRINCIPAL_URL: &str = "API_PRINCIPAL_URL";

pub const DATABASE_PATH: &str = "DATABASE_PATH";

pub const LOG_LEVEL: &str = "LOG_LEVEL";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_CREDENTIAL: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_QUEUE: &str = "sensor_data";
pub const DEFAULT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_DATABASE_PATH: &str = "./sensors.db";

/// Read a variable from the process environment, treating empty values as unset
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Log level from `LOG_LEVEL`, defaulting to `info`
pub fn get_log_level() -> tracing::level_filters::LevelFilter {
    env_lookup(LOG_LEVEL)
        .and_then(|level| level.parse().ok())
        .unwrap_or(tracing::level_filters::LevelFilter::INFO)
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(21.456), 21.46);
        assert_eq!(round2(-3.333), -3.33);
        assert_eq!(round2(40.0), 40.0);
    }
}
