//! Append-only JSON-lines delay log sink.
//!
//! One file per sub-protocol (MP, AV). Each iteration appends exactly one
//! JSON object, newline-terminated, so a partial write from a crash mid-line
//! is detectable by a line scan on replay — we never rewrite or seek.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::NodeError;
use crate::types::now_secs;

#[derive(Serialize)]
struct LogEntry<'a> {
    session_id: &'a str,
    iteration: u32,
    data: Value,
    timestamp: f64,
}

/// A single append-only delay log file, serialized by a per-file mutex.
pub struct DelayLogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl DelayLogSink {
    /// Open `path` for appending, truncating any existing content — per
    /// spec, delay log files are truncated on verifier startup.
    pub async fn create_truncated(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| NodeError::LogOpen {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one iteration's record. `data` is the sub-protocol-specific
    /// body (e.g. `{"min_sums": {...}}` or `{"delays": {...}}`).
    pub async fn append(&self, session_id: &str, iteration: u32, data: Value) {
        let entry = LogEntry {
            session_id,
            iteration,
            data,
            timestamp: now_secs(),
        };
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "failed to serialize delay log entry");
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::error!(path = %self.path.display(), error = %e, "failed to append delay log entry");
            return;
        }
        if let Err(e) = file.flush().await {
            tracing::error!(path = %self.path.display(), error = %e, "failed to flush delay log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("cpv_log_test_{}", uuid::Uuid::new_v4()));
        let sink = DelayLogSink::create_truncated(&dir).await.unwrap();

        sink.append("S", 1, json!({"min_sums": {"server1_server2": 0.01}}))
            .await;
        sink.append("S", 2, json!({"min_sums": {}})).await;

        let contents = tokio::fs::read_to_string(&dir).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: HashMap<String, Value> = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["session_id"], "S");
        assert_eq!(first["iteration"], 1);

        tokio::fs::remove_file(&dir).await.ok();
    }

    #[tokio::test]
    async fn truncates_existing_file_on_open() {
        let dir = std::env::temp_dir().join(format!("cpv_log_test_{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&dir, b"stale line\n").await.unwrap();

        let sink = DelayLogSink::create_truncated(&dir).await.unwrap();
        sink.append("S", 1, json!({"delays": {}})).await;

        let contents = tokio::fs::read_to_string(&dir).await.unwrap();
        assert!(!contents.contains("stale line"));

        tokio::fs::remove_file(&dir).await.ok();
    }
}
