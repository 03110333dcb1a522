//! Row outcomes, the error-collector seam, and the aggregate run result.
//!
//! The core never writes report files itself. Failing rows are handed to
//! an [`ErrorSink`] collaborator; whoever owns the sink decides how (and
//! whether) to persist a CSV report.

use parking_lot::Mutex;

/// One failing row, immutable after creation.
#[derive(Debug, Clone)]
pub struct RowError {
    /// Human identifier for the participant (usually "first last").
    pub participant: String,
    pub email: Option<String>,
    pub message: String,
    /// 1-based source row number counting the header, when known.
    pub row_number: Option<usize>,
}

/// Collector for per-row failures.
///
/// `record` is called once per failing row. `flush` asks the sink to
/// persist whatever it is going to persist and returns the report path
/// if one was written.
pub trait ErrorSink: Send + Sync {
    fn record(&self, error: RowError);
    fn flush(&self) -> Option<String>;
}

/// In-memory sink. Used by tests and by callers that only want the
/// aggregate counts.
#[derive(Default)]
pub struct MemoryErrorSink {
    errors: Mutex<Vec<RowError>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<RowError> {
        self.errors.lock().clone()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn record(&self, error: RowError) {
        self.errors.lock().push(error);
    }

    fn flush(&self) -> Option<String> {
        None
    }
}

/// Aggregate result of one sync run.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub total_records: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub processing_time_ms: u64,
    pub error_report_path: Option<String>,
}
