//! Sensor Ingest - MQTT telemetry ingestion service
//!
//! This service subscribes to one MQTT topic over TLS, appends every decoded
//! reading to a JSON record log and inserts complete temperature/humidity
//! readings into the `sensor_data` MySQL table.
//!
//! ## Features
//!
//! - Mandatory TLS with a configured CA certificate
//! - QoS 1 subscription, renewed on every reconnect
//! - Reconnect with exponential backoff
//! - Record log and database writes isolated from each other
//! - Graceful disconnect on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables, optionally through a
//! `.env` file in the working directory. See [`sensor_ingest::config::Config`].
//! `RUST_LOG` sets the logging filter (default: info).

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensor_ingest::config::Config;
use sensor_ingest::connector::{load_ca_certificate, Connector};
use sensor_ingest::pipeline::Pipeline;
use sensor_ingest::record_log::RecordLog;
use sensor_ingest::store::{MetricStore, MySqlMetricStore};

#[tokio::main]
async fn main() {
    // A missing .env file is fine; the environment may already be populated.
    let dotenv = dotenvy::dotenv();

    init_tracing();

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    info!("Starting Sensor Ingest service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                broker_host = %config.broker.host,
                broker_port = config.broker.port,
                topic = %config.broker.topic,
                client_id = %config.broker.client_id,
                log_file = %config.log_file.display(),
                db_host = %config.database.host,
                db_name = %config.database.name,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        ca_cert = %config.broker.ca_cert_path.display(),
        "Setting up TLS using CA certificate"
    );
    let tls = match load_ca_certificate(&config.broker.ca_cert_path) {
        Ok(tls) => tls,
        Err(e) => {
            error!(error = %e, "Error setting up TLS");
            std::process::exit(1);
        }
    };

    let store = MySqlMetricStore::new(&config.database);
    match store.ping().await {
        Ok(()) => info!("Database reachable"),
        Err(e) => warn!(
            error = %e,
            "Database not reachable at startup, readings will only be logged until it is"
        ),
    }

    let mut pipeline = Pipeline::new(RecordLog::new(&config.log_file), store);
    let mut connector = Connector::new(&config.broker, tls);

    info!(
        host = %config.broker.host,
        port = config.broker.port,
        "Attempting connection to MQTT broker... Press Ctrl+C to exit."
    );

    connector.run(&mut pipeline, shutdown_signal()).await;

    let stats = pipeline.stats();
    info!(
        received = stats.received,
        malformed = stats.malformed,
        logged = stats.logged,
        log_failures = stats.log_failures,
        stored = stats.stored,
        incomplete = stats.incomplete,
        metric_failures = stats.metric_failures,
        "Sensor Ingest stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve when the process receives Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        // Without a signal handler the only way out is killing the process.
        std::future::pending::<()>().await;
    }
}
