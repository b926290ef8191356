//! Configuration module for the sensor ingest service.
//!
//! All settings come from environment variables (optionally seeded from a
//! `.env` file by the binary). Broker, TLS, record log and database settings
//! are required; transport tuning knobs fall back to defaults.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default MQTT keep-alive in seconds
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Keep-alive bounds accepted by the broker connection
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const MAX_KEEP_ALIVE_SECS: u64 = 3600;

/// Default base delay for reconnect backoff (in milliseconds)
const DEFAULT_RECONNECT_BASE_MS: u64 = 500;

/// Default cap for reconnect backoff (in milliseconds)
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Default request channel capacity of the MQTT client
const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Default MySQL port
const DEFAULT_DB_PORT: u16 = 3306;

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error for {var}: variable is not set")]
    Missing { var: &'static str },

    #[error("Configuration error for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

impl ConfigError {
    /// Name of the environment variable that caused the error.
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigError::Missing { var } | ConfigError::Invalid { var, .. } => var,
        }
    }
}

/// Broker endpoint, session identity and transport tuning.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub username: String,
    pub password: String,
    pub client_id: String,

    /// PEM file holding the CA that signed the broker certificate
    pub ca_cert_path: PathBuf,

    pub keep_alive: Duration,

    /// First reconnect delay; doubles per consecutive failure up to `reconnect_max`
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,

    /// Capacity of the client request channel
    pub channel_capacity: usize,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

/// Relational store connection settings.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

/// Configuration for the sensor ingest service.
///
/// Required variables:
/// - `MQTT_BROKER_HOST`, `MQTT_BROKER_PORT`, `MQTT_TOPIC`
/// - `MQTT_USERNAME`, `MQTT_PASSWORD`, `MQTT_CLIENT_ID`
/// - `CA_CERT_PATH`, `LOG_FILE`
/// - `DB_HOST`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`
///
/// Optional variables:
/// - `MQTT_KEEP_ALIVE_SECS` (default: 60)
/// - `MQTT_RECONNECT_BASE_MS` (default: 500)
/// - `MQTT_RECONNECT_MAX_MS` (default: 30000)
/// - `MQTT_CHANNEL_CAPACITY` (default: 10)
/// - `DB_PORT` (default: 3306)
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,

    /// Path of the JSON array record log
    pub log_file: PathBuf,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or empty, or
    /// if a numeric variable does not parse or is out of range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sensor_ingest::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Broker: {}:{}", config.broker.host, config.broker.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let keep_alive_secs = vars.parse_or("MQTT_KEEP_ALIVE_SECS", DEFAULT_KEEP_ALIVE_SECS)?;
        if !(MIN_KEEP_ALIVE_SECS..=MAX_KEEP_ALIVE_SECS).contains(&keep_alive_secs) {
            return Err(ConfigError::Invalid {
                var: "MQTT_KEEP_ALIVE_SECS",
                message: format!(
                    "keep-alive {}s outside allowed range ({}..={}s)",
                    keep_alive_secs, MIN_KEEP_ALIVE_SECS, MAX_KEEP_ALIVE_SECS
                ),
            });
        }

        let reconnect_base_ms = vars.parse_or("MQTT_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)?;
        if reconnect_base_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "MQTT_RECONNECT_BASE_MS",
                message: "reconnect delay must be greater than 0".to_string(),
            });
        }

        let reconnect_max_ms = vars.parse_or("MQTT_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?;
        if reconnect_max_ms < reconnect_base_ms {
            return Err(ConfigError::Invalid {
                var: "MQTT_RECONNECT_MAX_MS",
                message: format!(
                    "maximum delay {}ms is below base delay {}ms",
                    reconnect_max_ms, reconnect_base_ms
                ),
            });
        }

        let channel_capacity = vars.parse_or("MQTT_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?;
        if channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "MQTT_CHANNEL_CAPACITY",
                message: "channel capacity must be greater than 0".to_string(),
            });
        }

        let broker = BrokerConfig {
            host: vars.required("MQTT_BROKER_HOST")?,
            port: vars.parse_required("MQTT_BROKER_PORT")?,
            topic: vars.required("MQTT_TOPIC")?,
            username: vars.required("MQTT_USERNAME")?,
            password: vars.required("MQTT_PASSWORD")?,
            client_id: vars.required("MQTT_CLIENT_ID")?,
            ca_cert_path: PathBuf::from(vars.required("CA_CERT_PATH")?),
            keep_alive: Duration::from_secs(keep_alive_secs),
            reconnect_base: Duration::from_millis(reconnect_base_ms),
            reconnect_max: Duration::from_millis(reconnect_max_ms),
            channel_capacity,
        };

        let database = DatabaseConfig {
            host: vars.required("DB_HOST")?,
            port: vars.parse_or("DB_PORT", DEFAULT_DB_PORT)?,
            user: vars.required("DB_USER")?,
            password: vars.required("DB_PASSWORD")?,
            name: vars.required("DB_NAME")?,
        };

        let log_file = PathBuf::from(vars.required("LOG_FILE")?);

        Ok(Self {
            broker,
            database,
            log_file,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        match (self.lookup)(var) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigError::Missing { var }),
        }
    }

    fn parse_required<T: std::str::FromStr>(&self, var: &'static str) -> Result<T, ConfigError> {
        let value = self.required(var)?;
        Self::parse(var, &value)
    }

    fn parse_or<T: std::str::FromStr>(
        &self,
        var: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        match (self.lookup)(var) {
            Some(value) if !value.trim().is_empty() => Self::parse(var, &value),
            _ => Ok(default),
        }
    }

    fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            message: format!("'{}' is not a valid number", value),
        })
    }
}
