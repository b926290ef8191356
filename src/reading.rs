//! Sensor reading types.
//!
//! A [`Reading`] is the decoded JSON object carried by one MQTT message. It
//! keeps every key the sensor sent; only `temperature` and `humidity` are
//! interpreted, and only when building a [`SensorDataRow`].

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload key holding the temperature value.
pub const TEMPERATURE_KEY: &str = "temperature";

/// Payload key holding the relative humidity value.
pub const HUMIDITY_KEY: &str = "humidity";

/// Reasons a payload cannot be decoded into a [`Reading`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Reasons a decoded reading cannot produce metric values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    #[error("missing field '{0}'")]
    Missing(&'static str),

    #[error("field '{0}' is not a number")]
    NotNumeric(&'static str),
}

/// A decoded sensor message, preserved key for key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading(Map<String, Value>);

impl Reading {
    /// Decode a raw MQTT payload.
    ///
    /// The payload must be UTF-8 text holding a JSON object.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DecodeError::NotAnObject(json_kind(&other))),
        }
    }

    /// Look up a raw field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Extract temperature and humidity.
    ///
    /// A field that is absent or `null` is reported as missing. Temperature
    /// is checked first.
    pub fn metrics(&self) -> Result<(f64, f64), MetricsError> {
        let temperature = self.number(TEMPERATURE_KEY)?;
        let humidity = self.number(HUMIDITY_KEY)?;
        Ok((temperature, humidity))
    }

    fn number(&self, key: &'static str) -> Result<f64, MetricsError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Err(MetricsError::Missing(key)),
            Some(value) => value.as_f64().ok_or(MetricsError::NotNumeric(key)),
        }
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Reading {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Row written to the `sensor_data` table.
///
/// `timestamp` is assigned by this service when the message is handled,
/// never taken from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorDataRow {
    pub timestamp: NaiveDateTime,
    pub temperature: f64,
    pub humidity: f64,
}

impl SensorDataRow {
    pub fn new(timestamp: NaiveDateTime, temperature: f64, humidity: f64) -> Self {
        Self {
            timestamp,
            temperature,
            humidity,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
