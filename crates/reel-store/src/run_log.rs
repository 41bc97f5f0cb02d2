// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-run structured JSONL log files under `logs/`.

use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One record in a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogRecord {
    /// Timestamp the record was written.
    pub ts: DateTime<Utc>,
    /// Severity (`info`, `warn`, `error`).
    pub level: String,
    /// Human-readable message.
    pub message: String,
    /// Job the record concerns, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Structured fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Append-only writer for one run's log file.
#[derive(Debug)]
pub struct RunLogger {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl RunLogger {
    pub(crate) fn create(path: PathBuf) -> Result<Self, StoreError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a record.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization problems.
    pub fn log(&self, record: &RunLogRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock().expect("run log lock poisoned");
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|e| StoreError::Io {
                path: self.path.display().to_string(),
                source: e,
            })
    }

    /// Append an info-level message with no job context.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization problems.
    pub fn info(&self, message: impl Into<String>) -> Result<(), StoreError> {
        self.log(&RunLogRecord {
            ts: Utc::now(),
            level: "info".into(),
            message: message.into(),
            job_id: None,
            fields: BTreeMap::new(),
        })
    }

    /// Append a job-scoped record with structured fields.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization problems.
    pub fn job(
        &self,
        job_id: impl Into<String>,
        message: impl Into<String>,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.log(&RunLogRecord {
            ts: Utc::now(),
            level: "info".into(),
            message: message.into(),
            job_id: Some(job_id.into()),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::create(dir.path().join("run.jsonl")).unwrap();
        logger.info("run started").unwrap();
        logger
            .job("Producer:Doc", "job finished", BTreeMap::new())
            .unwrap();

        let text = fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: RunLogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.message, "run started");
        let second: RunLogRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.job_id.as_deref(), Some("Producer:Doc"));
    }
}
