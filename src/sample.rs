// sample.rs
// Purpose: Typed sensor observations validated at the store boundary

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ForecastError, ForecastResult};

const MAX_DEVICE_ID_LEN: usize = 64;

/// Reported health of the device when the sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    Maintenance,
}

/// Cooling fan actuator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanStatus {
    On,
    Off,
}

/// One sensor observation. Immutable once stored.
///
/// Every field is required: a document with a missing field fails to
/// deserialize instead of being defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub servo_angle: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub lux: f64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub fan_status: FanStatus,
    pub status: DeviceStatus,
}

impl Sample {
    /// Check structural invariants and truncate the timestamp to whole seconds.
    pub fn validate(mut self) -> ForecastResult<Self> {
        validate_device_id(&self.device_id)?;

        let numeric = [
            ("servo_angle", self.servo_angle),
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("lux", self.lux),
            ("voltage", self.voltage),
            ("current", self.current),
            ("power", self.power),
        ];
        for (field, value) in numeric {
            if !value.is_finite() {
                return Err(ForecastError::validation(field, "value must be finite"));
            }
        }
        if !(0.0..=180.0).contains(&self.servo_angle) {
            return Err(ForecastError::validation(
                "servo_angle",
                "must be between 0 and 180 degrees",
            ));
        }
        if !(0.0..=100.0).contains(&self.humidity) {
            return Err(ForecastError::validation(
                "humidity",
                "must be between 0 and 100 percent",
            ));
        }

        self.timestamp = self
            .timestamp
            .with_nanosecond(0)
            .ok_or_else(|| ForecastError::validation("timestamp", "cannot truncate to seconds"))?;
        Ok(self)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> ForecastResult<Self> {
        let sample: Sample = serde_json::from_str(raw)
            .map_err(|e| ForecastError::serialization("sample document", e))?;
        sample.validate()
    }

    pub fn value(&self, field: SensorField) -> f64 {
        match field {
            SensorField::ServoAngle => self.servo_angle,
            SensorField::Temperature => self.temperature,
            SensorField::Humidity => self.humidity,
            SensorField::Lux => self.lux,
            SensorField::Voltage => self.voltage,
            SensorField::Current => self.current,
            SensorField::Power => self.power,
        }
    }
}

/// Device identifiers are short, filesystem-safe tokens because they end up
/// in artifact file names.
pub fn validate_device_id(device_id: &str) -> ForecastResult<()> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ForecastError::validation(
            "device_id",
            format!("must be 1 to {MAX_DEVICE_ID_LEN} characters"),
        ));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ForecastError::validation(
            "device_id",
            "only letters, digits, '_' and '-' are allowed",
        ));
    }
    Ok(())
}

/// Numeric sensor channels a model can be trained to forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorField {
    ServoAngle,
    Temperature,
    Humidity,
    Lux,
    Voltage,
    Current,
    Power,
}

impl SensorField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorField::ServoAngle => "servo_angle",
            SensorField::Temperature => "temperature",
            SensorField::Humidity => "humidity",
            SensorField::Lux => "lux",
            SensorField::Voltage => "voltage",
            SensorField::Current => "current",
            SensorField::Power => "power",
        }
    }
}

impl fmt::Display for SensorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorField {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "servo_angle" => Ok(SensorField::ServoAngle),
            "temperature" => Ok(SensorField::Temperature),
            "humidity" => Ok(SensorField::Humidity),
            "lux" => Ok(SensorField::Lux),
            "voltage" => Ok(SensorField::Voltage),
            "current" => Ok(SensorField::Current),
            "power" => Ok(SensorField::Power),
            other => Err(ForecastError::validation(
                "target",
                format!("unknown sensor field '{other}'"),
            )),
        }
    }
}
