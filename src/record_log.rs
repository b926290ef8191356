//! Durable record log.
//!
//! Every decoded reading is appended to a single JSON array stored in one
//! file. The whole array is rewritten on each append, so cost grows with the
//! number of stored records; this is sized for periodic sensor sampling.
//!
//! An absent or empty file starts a new array. A file that does not hold a
//! JSON array is discarded with a warning and replaced, losing its previous
//! content. Ingestion is never blocked on a corrupt log.
//!
//! Rewrites go to a sibling `<name>.tmp` file which is then renamed over the
//! log, so a crash mid-write leaves the previous array intact.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::reading::Reading;

/// Indentation used when rewriting the log file.
const INDENT: &[u8] = b"    ";

/// Errors that can occur while appending to the record log.
#[derive(Debug, Error)]
pub enum RecordLogError {
    #[error("failed to read record log {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write record log {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to serialize record log: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// File-backed, append-only list of readings.
#[derive(Debug, Clone)]
pub struct RecordLog {
    path: PathBuf,
}

impl RecordLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one reading and rewrite the file.
    ///
    /// Returns the number of records in the log after the append.
    ///
    /// # Errors
    ///
    /// Returns `RecordLogError::Read` if the existing file cannot be read for
    /// a reason other than not existing; the file is left untouched in that
    /// case. Returns `RecordLogError::Write` if the rewrite fails.
    pub async fn append(&self, record: &Reading) -> Result<usize, RecordLogError> {
        let mut records = self.load_or_reset().await?;
        records.push(Value::Object(record.as_map().clone()));

        let bytes = to_pretty_json(&records)?;
        self.ensure_parent_dir().await?;
        self.replace_contents(&bytes).await?;

        debug!(
            path = %self.path.display(),
            records = records.len(),
            "Record log rewritten"
        );

        Ok(records.len())
    }

    /// Load the stored records.
    ///
    /// Applies the same recovery rules as [`append`](Self::append): a missing,
    /// empty or corrupt file yields an empty list.
    pub async fn load(&self) -> Result<Vec<Value>, RecordLogError> {
        self.load_or_reset().await
    }

    async fn load_or_reset(&self) -> Result<Vec<Value>, RecordLogError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RecordLogError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<Value>(&content) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(_) => {
                warn!(
                    path = %self.path.display(),
                    "Record log does not contain a JSON list, starting fresh"
                );
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not decode record log, starting fresh"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn replace_contents(&self, bytes: &[u8]) -> Result<(), RecordLogError> {
        let tmp = self.temp_path();
        let write_err = |source: io::Error| RecordLogError::Write {
            path: self.path.clone(),
            source,
        };

        tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    async fn ensure_parent_dir(&self) -> Result<(), RecordLogError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| RecordLogError::Write {
                    path: self.path.clone(),
                    source,
                }),
            _ => Ok(()),
        }
    }
}

fn to_pretty_json(records: &[Value]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(INDENT));
    records.serialize(&mut serializer)?;
    Ok(buf)
}
