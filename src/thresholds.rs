//! Threshold evaluation
//!
//! Temperature and humidity are evaluated independently against the sensor's
//! configured bounds. Bounds are exclusive: a value exactly equal to `min` or
//! `max` is within range.
//!
//! ```text
//! value < min  → BelowMin  → LOW_*  alert
//! value > max  → AboveMax  → HIGH_* alert
//! otherwise    → Within    → no alert
//! ```
//!
//! Evaluation is pure. The same `(SensorConfig, Reading)` pair always yields the
//! same events, in the same order (temperature first).

use crate::{AlertEvent, AlertKind, Reading, SensorConfig};

/// Position of a single value relative to its `[min, max]` bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvaluation {
    Within,
    BelowMin,
    AboveMax,
}

impl MetricEvaluation {
    pub fn evaluate(value: f64, min: f64, max: f64) -> MetricEvaluation {
        if value < min {
            return MetricEvaluation::BelowMin;
        }

        if value > max {
            return MetricEvaluation::AboveMax;
        }

        MetricEvaluation::Within
    }
}

#[derive(Debug, Clone, Copy)]
enum Metric {
    Temperature,
    Humidity,
}

impl Metric {
    fn label(&self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Humidity => "Humidity",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Humidity => "%",
        }
    }

    fn alert_kind(&self, evaluation: MetricEvaluation) -> Option<AlertKind> {
        match (self, evaluation) {
            (_, MetricEvaluation::Within) => None,
            (Metric::Temperature, MetricEvaluation::BelowMin) => Some(AlertKind::LowTemperature),
            (Metric::Temperature, MetricEvaluation::AboveMax) => Some(AlertKind::HighTemperature),
            (Metric::Humidity, MetricEvaluation::BelowMin) => Some(AlertKind::LowHumidity),
            (Metric::Humidity, MetricEvaluation::AboveMax) => Some(AlertKind::HighHumidity),
        }
    }
}

/// Evaluate a reading against its sensor's thresholds
///
/// Returns at most one temperature event followed by at most one humidity event.
pub fn evaluate(sensor: &SensorConfig, reading: &Reading) -> Vec<AlertEvent> {
    let checks = [
        (
            Metric::Temperature,
            reading.temperature,
            sensor.min_temperature,
            sensor.max_temperature,
        ),
        (
            Metric::Humidity,
            reading.humidity,
            sensor.min_humidity,
            sensor.max_humidity,
        ),
    ];

    checks
        .into_iter()
        .filter_map(|(metric, value, min, max)| {
            let evaluation = MetricEvaluation::evaluate(value, min, max);
            let kind = metric.alert_kind(evaluation)?;
            Some(build_event(sensor, reading, metric, kind, value, min, max))
        })
        .collect()
}

fn build_event(
    sensor: &SensorConfig,
    reading: &Reading,
    metric: Metric,
    kind: AlertKind,
    value: f64,
    min: f64,
    max: f64,
) -> AlertEvent {
    let unit = metric.unit();
    let (direction, bound_name, bound) = match kind {
        AlertKind::LowTemperature | AlertKind::LowHumidity => {
            ("is below minimum threshold of", "min", min)
        }
        AlertKind::HighTemperature | AlertKind::HighHumidity => {
            ("exceeds maximum threshold of", "max", max)
        }
    };

    let title = kind.as_str().replace('_', " ");
    let message = format!(
        "{title} ALERT: Sensor \"{}\" ({}) - {} {value}{unit} {direction} {bound}{unit}",
        sensor.name,
        sensor.sensor_id,
        metric.label(),
    );

    AlertEvent {
        sensor_id: sensor.sensor_id.clone(),
        kind,
        message,
        temperature: reading.temperature,
        humidity: reading.humidity,
        threshold_exceeded: format!("{bound_name}_{}: {bound}{unit}", metric.key()),
        created_at: reading.timestamp,
    }
}
