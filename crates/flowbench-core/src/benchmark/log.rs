//! Append-only benchmark log port.

use flowbench_types::benchmark::BenchmarkRecord;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("benchmark log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode benchmark record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt benchmark log at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

/// Durable, append-only store of benchmark records.
///
/// `append` must not return until the record is durable. `load` returns
/// every complete record in append order.
pub trait BenchmarkLog: Send + Sync {
    fn append(
        &self,
        record: &BenchmarkRecord,
    ) -> impl std::future::Future<Output = Result<(), LogError>> + Send;

    fn load(&self) -> impl std::future::Future<Output = Result<Vec<BenchmarkRecord>, LogError>> + Send;
}

/// Log kept in memory; used for `--dry-run` style previews and tests.
#[derive(Debug, Default)]
pub struct MemoryBenchmarkLog {
    records: Mutex<Vec<BenchmarkRecord>>,
}

impl MemoryBenchmarkLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<BenchmarkRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl BenchmarkLog for MemoryBenchmarkLog {
    async fn append(&self, record: &BenchmarkRecord) -> Result<(), LogError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<BenchmarkRecord>, LogError> {
        Ok(self.records.lock().await.clone())
    }
}
