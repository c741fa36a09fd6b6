//! Synthetic reading generation
//!
//! Each metric is drawn independently:
//!
//! - 90 %: uniform in `center ± 15 % of (max - min)`
//! - 10 %: out of bounds, below `min` or above `max` (even odds) by a uniform
//!   margin, [`TEMPERATURE_MARGIN`] or [`HUMIDITY_MARGIN`]
//!
//! Values are rounded to two decimals. Margins start at 0.1 so a rounded
//! out-of-bounds value is still strictly outside the exclusive bounds.

use std::ops::RangeInclusive;

use chrono::{SubsecRound, Utc};
use rand::Rng;

use crate::util::round2;
use crate::{Reading, SensorConfig};

/// Width of the normal band as a fraction of `max - min`
pub const VARIATION_FRACTION: f64 = 0.3;

/// Per-metric probability of an out-of-bounds value
pub const OUT_OF_BOUNDS_PROBABILITY: f64 = 0.1;

pub const TEMPERATURE_MARGIN: RangeInclusive<f64> = 0.1..=5.0;
pub const HUMIDITY_MARGIN: RangeInclusive<f64> = 0.1..=10.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SimulationError {
    #[error("sensor {sensor_id} has a non-finite {field} ({value})")]
    InvalidBounds {
        sensor_id: String,
        field: &'static str,
        value: f64,
    },
}

fn validate(sensor: &SensorConfig) -> Result<(), SimulationError> {
    let bounds = [
        ("min_temperature", sensor.min_temperature),
        ("max_temperature", sensor.max_temperature),
        ("min_humidity", sensor.min_humidity),
        ("max_humidity", sensor.max_humidity),
    ];

    match bounds.into_iter().find(|(_, value)| !value.is_finite()) {
        Some((field, value)) => Err(SimulationError::InvalidBounds {
            sensor_id: sensor.sensor_id.clone(),
            field,
            value,
        }),
        None => Ok(()),
    }
}

fn synthesize<R: Rng>(min: f64, max: f64, margin: RangeInclusive<f64>, rng: &mut R) -> f64 {
    if rng.random_bool(OUT_OF_BOUNDS_PROBABILITY) {
        let offset = rng.random_range(margin);
        return if rng.random_bool(0.5) {
            min - offset
        } else {
            max + offset
        };
    }

    let center = (min + max) / 2.0;
    center + (rng.random::<f64>() - 0.5) * (max - min) * VARIATION_FRACTION
}

/// Generate one reading for a sensor, stamped with the current time
pub fn generate_reading<R: Rng>(
    sensor: &SensorConfig,
    rng: &mut R,
) -> Result<Reading, SimulationError> {
    validate(sensor)?;

    let temperature = synthesize(
        sensor.min_temperature,
        sensor.max_temperature,
        TEMPERATURE_MARGIN,
        rng,
    );
    let humidity = synthesize(
        sensor.min_humidity,
        sensor.max_humidity,
        HUMIDITY_MARGIN,
        rng,
    );

    Ok(Reading {
        sensor_id: sensor.sensor_id.clone(),
        temperature: round2(temperature),
        humidity: round2(humidity),
        timestamp: Utc::now().trunc_subsecs(3),
    })
}
