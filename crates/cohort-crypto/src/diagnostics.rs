//! Diagnostic records emitted while decrypting device uploads.
//!
//! The decryptor never persists anything itself; it hands records to a
//! [`DiagnosticSink`]. Raw line bytes are carried as URL-safe base64 so a
//! record is always valid JSON, or as [`REDACTED`] for sensitive media.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LineErrorKind;

/// Placeholder written instead of line contents for sensitive media.
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum DiagnosticRecord {
    /// The envelope line did not yield a key.
    KeyError {
        participant_id: String,
        file_name: String,
        contents: String,
        reason: String,
    },

    /// One line-level decryption error.
    LineError {
        participant_id: String,
        file_name: String,
        kind: LineErrorKind,
        index: usize,
        line: String,
        prev_line: String,
        next_line: String,
    },

    /// Per-file summary, emitted once when any line failed.
    FileSummary {
        participant_id: String,
        file_name: String,
        total_lines: usize,
        error_count: usize,
        error_lines: Vec<String>,
        error_kinds: Vec<LineErrorKind>,
    },
}

impl DiagnosticRecord {
    pub fn file_name(&self) -> &str {
        match self {
            DiagnosticRecord::KeyError { file_name, .. }
            | DiagnosticRecord::LineError { file_name, .. }
            | DiagnosticRecord::FileSummary { file_name, .. } => file_name,
        }
    }
}

/// Append-only destination for diagnostic records.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, record: DiagnosticRecord);
}

impl<T: DiagnosticSink + ?Sized> DiagnosticSink for Arc<T> {
    fn record(&self, record: DiagnosticRecord) {
        (**self).record(record)
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _record: DiagnosticRecord) {}
}

/// Emits records as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, record: DiagnosticRecord) {
        match record {
            DiagnosticRecord::KeyError {
                participant_id,
                file_name,
                reason,
                ..
            } => {
                warn!(
                    participant = %participant_id,
                    file = %file_name,
                    %reason,
                    "decryption key error"
                );
            }
            DiagnosticRecord::LineError {
                participant_id,
                file_name,
                kind,
                index,
                ..
            } => {
                warn!(
                    participant = %participant_id,
                    file = %file_name,
                    %kind,
                    index,
                    "line decryption error"
                );
            }
            DiagnosticRecord::FileSummary {
                participant_id,
                file_name,
                total_lines,
                error_count,
                error_kinds,
                ..
            } => {
                warn!(
                    participant = %participant_id,
                    file = %file_name,
                    total_lines,
                    error_count,
                    kinds = ?error_kinds,
                    "file decrypted with errors"
                );
            }
        }
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, record: DiagnosticRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Appends one JSON object per line to a file.
///
/// Line-level records are verbose and may be switched off; key errors and
/// file summaries are always written.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
    include_line_errors: bool,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>, include_line_errors: bool) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            include_line_errors,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for JsonlSink {
    fn record(&self, record: DiagnosticRecord) {
        if !self.include_line_errors && matches!(record, DiagnosticRecord::LineError { .. }) {
            return;
        }

        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(path = %self.path.display(), "serializing diagnostic record: {e}");
                return;
            }
        };
        line.push(b'\n');

        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(&line) {
            warn!(path = %self.path.display(), "writing diagnostic record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_record() -> DiagnosticRecord {
        DiagnosticRecord::LineError {
            participant_id: "p1".into(),
            file_name: "p1_gps_1.csv".into(),
            kind: LineErrorKind::PaddingError,
            index: 2,
            line: "YQ==".into(),
            prev_line: String::new(),
            next_line: String::new(),
        }
    }

    fn summary_record() -> DiagnosticRecord {
        DiagnosticRecord::FileSummary {
            participant_id: "p1".into(),
            file_name: "p1_gps_1.csv".into(),
            total_lines: 3,
            error_count: 1,
            error_lines: vec!["YQ==".into()],
            error_kinds: vec![LineErrorKind::PaddingError],
        }
    }

    #[test]
    fn test_memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        sink.record(line_record());
        sink.record(summary_record());
        assert_eq!(sink.records(), vec![line_record(), summary_record()]);
    }

    #[test]
    fn test_record_json_is_tagged() {
        let json = serde_json::to_value(line_record()).unwrap();
        assert_eq!(json["record"], "line_error");
        assert_eq!(json["kind"], "padding_error");
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag/records.jsonl");

        let sink = JsonlSink::open(&path, true).unwrap();
        sink.record(line_record());
        sink.record(summary_record());
        drop(sink);

        let sink = JsonlSink::open(&path, true).unwrap();
        sink.record(summary_record());
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<DiagnosticRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], line_record());
    }

    #[test]
    fn test_jsonl_sink_can_skip_line_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        let sink = JsonlSink::open(&path, false).unwrap();
        sink.record(line_record());
        sink.record(summary_record());
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("file_summary"));
    }

    #[test]
    fn test_arc_sink_forwards() {
        let sink = Arc::new(MemorySink::new());
        let shared: Arc<dyn DiagnosticSink> = sink.clone();
        shared.record(summary_record());
        assert_eq!(sink.records().len(), 1);
    }
}
