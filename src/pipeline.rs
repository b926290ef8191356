//! Per-message ingestion pipeline.
//!
//! Each inbound message goes through decode, record log append, field
//! validation and metric insert. The two writes are independent: a record
//! log failure does not stop the metric insert, and a metric failure leaves
//! the record in the log. [`Pipeline::handle`] never returns an error; every
//! failure is classified as an [`IngestError`], logged and counted.

use chrono::Local;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reading::{DecodeError, MetricsError, Reading, SensorDataRow};
use crate::record_log::{RecordLog, RecordLogError};
use crate::store::{MetricStore, StoreError};

/// Failure classes for one message.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),

    #[error("record log write failed: {0}")]
    LogWriteFailure(#[from] RecordLogError),

    #[error("incomplete reading: {0}")]
    IncompleteReading(#[from] MetricsError),

    #[error("metric store write failed: {0}")]
    MetricWriteFailure(#[from] StoreError),
}

/// What happened to the metric stage of a decoded message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricOutcome {
    /// A row was inserted.
    Stored(SensorDataRow),
    /// Required fields were missing or not numeric; nothing was inserted.
    Incomplete,
    /// The insert was attempted and failed.
    Failed,
}

/// Result of handling one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The payload could not be decoded; nothing was written.
    Malformed,
    /// The payload was decoded and both stages ran.
    Processed { logged: bool, metric: MetricOutcome },
}

/// Counters accumulated across messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Total number of messages handled
    pub received: u64,

    /// Messages discarded because they could not be decoded
    pub malformed: u64,

    /// Messages appended to the record log
    pub logged: u64,

    /// Record log appends that failed
    pub log_failures: u64,

    /// Rows inserted into the metric store
    pub stored: u64,

    /// Messages without usable temperature and humidity
    pub incomplete: u64,

    /// Metric inserts that failed
    pub metric_failures: u64,
}

/// The ingestion pipeline.
///
/// # Example
///
/// ```no_run
/// use sensor_ingest::pipeline::Pipeline;
/// use sensor_ingest::record_log::RecordLog;
/// use sensor_ingest::store::MySqlMetricStore;
/// use sensor_ingest::config::Config;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env().expect("Failed to load config");
///     let mut pipeline = Pipeline::new(
///         RecordLog::new(&config.log_file),
///         MySqlMetricStore::new(&config.database),
///     );
///
///     pipeline
///         .handle("sensors/room1", br#"{"temperature": 21.5, "humidity": 55}"#)
///         .await;
/// }
/// ```
pub struct Pipeline<S> {
    record_log: RecordLog,
    store: S,
    stats: PipelineStats,
}

impl<S: MetricStore> Pipeline<S> {
    pub fn new(record_log: RecordLog, store: S) -> Self {
        Self {
            record_log,
            store,
            stats: PipelineStats::default(),
        }
    }

    /// Handle one message end to end.
    pub async fn handle(&mut self, topic: &str, payload: &[u8]) -> Outcome {
        let span = info_span!("message", id = %Uuid::new_v4(), topic = %topic);
        self.handle_inner(topic, payload).instrument(span).await
    }

    async fn handle_inner(&mut self, topic: &str, payload: &[u8]) -> Outcome {
        self.stats.received += 1;
        let payload_text = String::from_utf8_lossy(payload);

        let reading = match Reading::decode(payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.malformed += 1;
                let e = IngestError::from(e);
                error!(
                    error = %e,
                    topic = %topic,
                    payload = %payload_text,
                    "Error decoding JSON payload"
                );
                return Outcome::Malformed;
            }
        };

        info!(payload = %payload_text, "Received message");

        let logged = match self.record_log.append(&reading).await {
            Ok(count) => {
                self.stats.logged += 1;
                info!(
                    path = %self.record_log.path().display(),
                    records = count,
                    "Appended reading to record log"
                );
                true
            }
            Err(e) => {
                self.stats.log_failures += 1;
                let e = IngestError::from(e);
                error!(error = %e, "Error writing to record log");
                false
            }
        };

        let (temperature, humidity) = match reading.metrics() {
            Ok(values) => values,
            Err(e) => {
                self.stats.incomplete += 1;
                let e = IngestError::from(e);
                warn!(
                    error = %e,
                    payload = %payload_text,
                    "Message missing temperature or humidity, not saved to database"
                );
                return Outcome::Processed {
                    logged,
                    metric: MetricOutcome::Incomplete,
                };
            }
        };

        let row = SensorDataRow::new(Local::now().naive_local(), temperature, humidity);
        let metric = match self.store.insert(&row).await {
            Ok(()) => {
                self.stats.stored += 1;
                MetricOutcome::Stored(row)
            }
            Err(e) => {
                self.stats.metric_failures += 1;
                let e = IngestError::from(e);
                error!(error = %e, "Data not saved to database");
                MetricOutcome::Failed
            }
        };

        Outcome::Processed { logged, metric }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn record_log(&self) -> &RecordLog {
        &self.record_log
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    /// In-memory store that records inserted rows.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<SensorDataRow>>,
        unreachable: bool,
    }

    impl MemoryStore {
        fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Self::default()
            }
        }

        fn rows(&self) -> Vec<SensorDataRow> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetricStore for MemoryStore {
        async fn insert(&self, row: &SensorDataRow) -> Result<(), StoreError> {
            if self.unreachable {
                return Err(StoreError::Connect(sqlx::Error::PoolTimedOut));
            }
            self.rows.lock().unwrap().push(*row);
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            if self.unreachable {
                return Err(StoreError::Connect(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }
    }

    fn pipeline(store: MemoryStore) -> (TempDir, Pipeline<MemoryStore>) {
        let dir = tempdir().unwrap();
        let log = RecordLog::new(dir.path().join("log.json"));
        (dir, Pipeline::new(log, store))
    }

    #[tokio::test]
    async fn test_complete_reading_is_logged_and_stored() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::default());
        let before = Local::now().naive_local();

        let outcome = pipeline
            .handle("sensors/room1", br#"{"temperature": 21.5, "humidity": 55}"#)
            .await;

        let after = Local::now().naive_local();
        let rows = pipeline.store().rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, 21.5);
        assert_eq!(rows[0].humidity, 55.0);
        assert!(rows[0].timestamp >= before && rows[0].timestamp <= after);
        assert_eq!(
            outcome,
            Outcome::Processed {
                logged: true,
                metric: MetricOutcome::Stored(rows[0]),
            }
        );

        let records = pipeline.record_log().load().await.unwrap();
        assert_eq!(records, vec![json!({"temperature": 21.5, "humidity": 55})]);
    }

    #[tokio::test]
    async fn test_payload_timestamp_is_ignored() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::default());

        pipeline
            .handle(
                "sensors/room1",
                br#"{"temperature": 20, "humidity": 40, "timestamp": "1999-01-01 00:00:00"}"#,
            )
            .await;

        let rows = pipeline.store().rows();
        assert!(rows[0].timestamp.and_utc().timestamp() > 946_684_800);
    }

    #[tokio::test]
    async fn test_missing_field_is_logged_only() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::default());

        let outcome = pipeline.handle("sensors/room1", br#"{"humidity": 60}"#).await;

        assert_eq!(
            outcome,
            Outcome::Processed {
                logged: true,
                metric: MetricOutcome::Incomplete,
            }
        );
        assert!(pipeline.store().rows().is_empty());
        assert_eq!(pipeline.record_log().load().await.unwrap(), vec![json!({"humidity": 60})]);
        assert_eq!(pipeline.stats().incomplete, 1);
    }

    #[tokio::test]
    async fn test_null_field_is_incomplete() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::default());

        let outcome = pipeline
            .handle("t", br#"{"temperature": null, "humidity": 60}"#)
            .await;

        assert!(matches!(
            outcome,
            Outcome::Processed {
                metric: MetricOutcome::Incomplete,
                ..
            }
        ));
        assert!(pipeline.store().rows().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_writes_nothing() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::default());

        assert_eq!(pipeline.handle("t", b"not-json").await, Outcome::Malformed);
        assert_eq!(pipeline.handle("t", &[0xc3, 0x28]).await, Outcome::Malformed);
        assert_eq!(pipeline.handle("t", b"[1, 2]").await, Outcome::Malformed);

        assert!(pipeline.store().rows().is_empty());
        assert!(!pipeline.record_log().path().exists());
        assert_eq!(pipeline.stats().malformed, 3);
        assert_eq!(pipeline.stats().logged, 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_keeps_record_in_log() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::unreachable());

        let outcome = pipeline
            .handle("t", br#"{"temperature": 21.5, "humidity": 55}"#)
            .await;

        assert_eq!(
            outcome,
            Outcome::Processed {
                logged: true,
                metric: MetricOutcome::Failed,
            }
        );
        assert_eq!(pipeline.record_log().load().await.unwrap().len(), 1);
        assert_eq!(pipeline.stats().metric_failures, 1);
    }

    #[tokio::test]
    async fn test_log_failure_does_not_block_metric_insert() {
        let dir = tempdir().unwrap();
        // The log path is a directory, so every append fails.
        let log = RecordLog::new(dir.path());
        let mut pipeline = Pipeline::new(log, MemoryStore::default());

        let outcome = pipeline
            .handle("t", br#"{"temperature": 18.0, "humidity": 35.5}"#)
            .await;

        assert!(matches!(
            outcome,
            Outcome::Processed {
                logged: false,
                metric: MetricOutcome::Stored(_),
            }
        ));
        assert_eq!(pipeline.store().rows().len(), 1);
        assert_eq!(pipeline.stats().log_failures, 1);
    }

    #[tokio::test]
    async fn test_counts_over_mixed_stream() {
        let (_dir, mut pipeline) = pipeline(MemoryStore::default());
        let payloads: [&[u8]; 5] = [
            br#"{"temperature": 21.5, "humidity": 55}"#,
            br#"{"humidity": 60}"#,
            b"not-json",
            br#"{"temperature": 22.0, "humidity": 50, "battery": 3.1}"#,
            // Duplicate delivery is not deduplicated.
            br#"{"temperature": 22.0, "humidity": 50, "battery": 3.1}"#,
        ];

        for payload in payloads {
            pipeline.handle("sensors/room1", payload).await;
        }

        assert_eq!(pipeline.record_log().load().await.unwrap().len(), 4);
        assert_eq!(pipeline.store().rows().len(), 3);
        assert_eq!(
            pipeline.stats(),
            &PipelineStats {
                received: 5,
                malformed: 1,
                logged: 4,
                log_failures: 0,
                stored: 3,
                incomplete: 1,
                metric_failures: 0,
            }
        );
    }

    #[test]
    fn test_ingest_error_display() {
        let err = IngestError::from(MetricsError::Missing("temperature"));
        assert_eq!(err.to_string(), "incomplete reading: missing field 'temperature'");

        let err = IngestError::from(StoreError::Connect(sqlx::Error::PoolTimedOut));
        assert!(err
            .to_string()
            .starts_with("metric store write failed: database connection error"));
    }
}
