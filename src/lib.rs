//! Sensor Ingest Library
//!
//! This library provides the components of the telemetry ingestion service:
//!
//! - **config**: Environment-based configuration
//! - **reading**: Decoded sensor payloads and database rows
//! - **record_log**: File-backed JSON array of every decoded reading
//! - **store**: MySQL writer for the `sensor_data` table
//! - **pipeline**: Per-message decode, log and persist steps
//! - **connector**: MQTT connection lifecycle and the dispatch loop
//!
//! # Example
//!
//! ```no_run
//! use sensor_ingest::config::Config;
//! use sensor_ingest::connector::{load_ca_certificate, Connector};
//! use sensor_ingest::pipeline::Pipeline;
//! use sensor_ingest::record_log::RecordLog;
//! use sensor_ingest::store::MySqlMetricStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // TLS must be ready before touching the network
//!     let tls = load_ca_certificate(&config.broker.ca_cert_path).expect("Bad CA certificate");
//!
//!     let mut pipeline = Pipeline::new(
//!         RecordLog::new(&config.log_file),
//!         MySqlMetricStore::new(&config.database),
//!     );
//!     let mut connector = Connector::new(&config.broker, tls);
//!
//!     connector
//!         .run(&mut pipeline, async {
//!             tokio::signal::ctrl_c().await.ok();
//!         })
//!         .await;
//! }
//! ```

// Module declarations
pub mod config;
pub mod connector;
pub mod pipeline;
pub mod reading;
pub mod record_log;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use config::{BrokerConfig, Config, ConfigError, DatabaseConfig};
pub use connector::{
    BrokerEvent, ConnectError, ConnectionState, Connector, DisconnectReason, SubscribeError,
    TlsSetupError,
};
pub use pipeline::{IngestError, MetricOutcome, Outcome, Pipeline, PipelineStats};
pub use reading::{Reading, SensorDataRow};
pub use record_log::{RecordLog, RecordLogError};
pub use store::{MetricStore, MySqlMetricStore, StoreError};
