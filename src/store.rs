//! Metric store writer.
//!
//! Persists validated readings into the `sensor_data` table. A connection is
//! opened for each operation and closed before returning, whether the
//! statement succeeded or not. Nothing is retried here.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::Connection;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::reading::SensorDataRow;

const INSERT_SENSOR_DATA: &str =
    "INSERT INTO sensor_data (datetime, temperature, humidity) VALUES (?, ?, ?)";

/// Errors that can occur while writing to the metric store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the login.
    #[error("database connection error: {0}")]
    Connect(#[source] sqlx::Error),

    /// The connection was established but the statement failed.
    #[error("database error during insert: {0}")]
    Query(#[source] sqlx::Error),
}

/// Destination for validated sensor rows.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Insert one row.
    async fn insert(&self, row: &SensorDataRow) -> Result<(), StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// MySQL-backed [`MetricStore`].
#[derive(Debug, Clone)]
pub struct MySqlMetricStore {
    options: MySqlConnectOptions,
}

impl MySqlMetricStore {
    pub fn new(config: &DatabaseConfig) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name);

        Self { options }
    }

    /// Build a store from ready-made connection options.
    pub fn with_options(options: MySqlConnectOptions) -> Self {
        Self { options }
    }

    async fn connect(&self) -> Result<MySqlConnection, StoreError> {
        let conn = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(StoreError::Connect)?;
        debug!("Database connection established");
        Ok(conn)
    }
}

#[async_trait]
impl MetricStore for MySqlMetricStore {
    async fn insert(&self, row: &SensorDataRow) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;

        let result = sqlx::query(INSERT_SENSOR_DATA)
            .bind(row.timestamp)
            .bind(row.temperature)
            .bind(row.humidity)
            .execute(&mut conn)
            .await;

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing database connection");
        }

        let done = result.map_err(StoreError::Query)?;
        info!(
            temperature = row.temperature,
            humidity = row.humidity,
            rows = done.rows_affected(),
            "Inserted data into database"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query("SELECT 1").execute(&mut conn).await;

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing database connection");
        }

        result.map(|_| ()).map_err(StoreError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn unreachable_store() -> MySqlMetricStore {
        // Port 1 on loopback refuses connections immediately.
        let config = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "sensor".to_string(),
            password: "secret".to_string(),
            name: "telemetry".to_string(),
        };
        MySqlMetricStore::new(&config)
    }

    #[test]
    fn test_insert_statement_is_parameterized() {
        assert_eq!(INSERT_SENSOR_DATA.matches('?').count(), 3);
        assert!(INSERT_SENSOR_DATA.starts_with("INSERT INTO sensor_data"));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Query(sqlx::Error::RowNotFound);
        assert!(err.to_string().starts_with("database error during insert"));

        let err = StoreError::Connect(sqlx::Error::PoolTimedOut);
        assert!(err.to_string().starts_with("database connection error"));
    }

    #[tokio::test]
    async fn test_insert_against_unreachable_store() {
        let store = unreachable_store();
        let timestamp = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let row = SensorDataRow::new(timestamp, 21.5, 55.0);

        let err = store.insert(&row).await.unwrap_err();
        assert!(matches!(err, StoreError::Connect(_)));
    }

    #[tokio::test]
    async fn test_ping_against_unreachable_store() {
        let err = unreachable_store().ping().await.unwrap_err();
        assert!(matches!(err, StoreError::Connect(_)));
    }
}
