//! Process configuration
//!
//! Every setting is read once at startup from the environment. The `from_lookup`
//! constructors take the lookup function explicitly so settings can be built from
//! a plain map in tests.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::trace;

use crate::util::{self, env_lookup};

/// Everything except RFC 3986 unreserved characters
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: e.to_string(),
            }),
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn positive_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let millis: u64 = parse_or(lookup, key, default)?;
    if millis == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: millis.to_string(),
            reason: "interval must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}

/// Message broker connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,

    /// Working queue for sensor readings
    pub queue: String,

    /// Queue receiving readings rejected by the consumer (optional)
    pub dead_letter_queue: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: util::DEFAULT_HOST.to_string(),
            port: util::DEFAULT_PORT,
            user: util::DEFAULT_CREDENTIAL.to_string(),
            password: util::DEFAULT_CREDENTIAL.to_string(),
            vhost: util::DEFAULT_VHOST.to_string(),
            queue: util::DEFAULT_QUEUE.to_string(),
            dead_letter_queue: None,
        }
    }
}

impl BrokerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let settings = Self {
            host: string_or(&lookup, util::RABBITMQ_HOST, util::DEFAULT_HOST),
            port: parse_or(&lookup, util::RABBITMQ_PORT, util::DEFAULT_PORT)?,
            user: string_or(&lookup, util::RABBITMQ_USER, util::DEFAULT_CREDENTIAL),
            password: string_or(&lookup, util::RABBITMQ_PASSWORD, util::DEFAULT_CREDENTIAL),
            vhost: string_or(&lookup, util::RABBITMQ_VHOST, util::DEFAULT_VHOST),
            queue: string_or(&lookup, util::RABBITMQ_QUEUE_SENSOR_DATA, util::DEFAULT_QUEUE),
            dead_letter_queue: lookup(util::BROKER_DEAD_LETTER_QUEUE),
        };

        trace!(
            "broker settings: {}:{} vhost={} queue={} dlq={:?}",
            settings.host, settings.port, settings.vhost, settings.queue, settings.dead_letter_queue
        );

        Ok(settings)
    }

    /// AMQP URI for this broker. The default vhost `/` is left implicit.
    ///
    /// User, password and vhost are percent-encoded, so a vhost named `/prod`
    /// becomes `%2Fprod`.
    pub fn amqp_uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => String::new(),
            other => format!("/{}", utf8_percent_encode(other, URI_COMPONENT)),
        };
        format!(
            "amqp://{}:{}@{}:{}{}",
            utf8_percent_encode(&self.user, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            vhost
        )
    }

    /// Broker address for log lines (no credentials)
    pub fn display_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Settings of the reading publisher
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    /// Time between two synthesis rounds
    pub publish_interval: Duration,

    /// Time between two refreshes of the active sensor list
    pub refresh_interval: Duration,

    /// Base URL of the sensor configuration API
    pub api_url: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_millis(util::DEFAULT_INTERVAL_MS),
            refresh_interval: Duration::from_millis(util::DEFAULT_REFRESH_INTERVAL_MS),
            api_url: util::DEFAULT_API_URL.to_string(),
        }
    }
}

impl PublisherSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            publish_interval: positive_millis(
                &lookup,
                util::SENSOR_INTERVAL_MS,
                util::DEFAULT_INTERVAL_MS,
            )?,
            refresh_interval: positive_millis(
                &lookup,
                util::SENSOR_REFRESH_INTERVAL_MS,
                util::DEFAULT_REFRESH_INTERVAL_MS,
            )?,
            api_url: string_or(&lookup, util::API_PRINCIPAL_URL, util::DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// Settings of the reading consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// SQLite database holding sensors, readings and alerts
    pub database_path: PathBuf,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(util::DEFAULT_DATABASE_PATH),
        }
    }
}

impl ConsumerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_path: PathBuf::from(string_or(
                &lookup,
                util::DATABASE_PATH,
                util::DEFAULT_DATABASE_PATH,
            )),
        })
    }
}
