//! JSON Lines benchmark log.
//!
//! One [`BenchmarkRecord`] per line, append-only. Every append is flushed and
//! `sync_data`'d before it returns, so an interrupted sweep loses at most the
//! record being written. Readers ignore a trailing partial line, which makes
//! the file safe to read while a sweep is still running.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use flowbench_core::benchmark::log::{BenchmarkLog, LogError};
use flowbench_types::benchmark::BenchmarkRecord;

/// File-backed [`BenchmarkLog`].
#[derive(Debug)]
pub struct JsonlBenchmarkLog {
    path: PathBuf,
    /// Serializes appends; `true` once the tail has been checked.
    writer: Mutex<bool>,
}

impl JsonlBenchmarkLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop a partial last line left by an interrupted write so the next
    /// record starts on its own line.
    async fn repair_tail(&self) -> Result<(), LogError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() || bytes.ends_with(b"\n") {
            return Ok(());
        }
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        tracing::warn!(
            path = %self.path.display(),
            dropped_bytes = bytes.len() - keep,
            "Dropping partial record at end of benchmark log"
        );
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(keep as u64).await?;
        file.sync_data().await?;
        Ok(())
    }
}

impl BenchmarkLog for JsonlBenchmarkLog {
    async fn append(&self, record: &BenchmarkRecord) -> Result<(), LogError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut tail_checked = self.writer.lock().await;
        if !*tail_checked {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.repair_tail().await?;
            *tail_checked = true;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<BenchmarkRecord>, LogError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        parse_records(&content)
    }
}

/// Parse log content. A final line without a newline is an in-progress
/// write and is skipped if it does not parse.
pub fn parse_records(content: &str) -> Result<Vec<BenchmarkRecord>, LogError> {
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut records = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BenchmarkRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) if !complete && idx + 1 == lines.len() => {
                tracing::debug!(line = idx + 1, "Ignoring partial trailing line");
            }
            Err(err) => {
                return Err(LogError::Corrupt {
                    line: idx + 1,
                    message: err.to_string(),
                });
            }
        }
    }
    Ok(records)
}
