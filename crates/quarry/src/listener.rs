//! Run progress callbacks.

use crate::publisher::{ComponentResult, JobError};
use crate::query::Query;
use std::sync::Arc;

/// Observes a run. Every method defaults to doing nothing.
///
/// Calls for different tables may arrive concurrently.
pub trait AnalysisListener: Send + Sync {
    fn job_begin(&self, _tables: &[String]) {}

    fn job_success(&self) {}

    fn job_failed(&self, _errors: &[JobError]) {}

    fn row_processing_begin(&self, _table: &str, _query: &Query) {}

    /// Rows processed so far in `table`.
    fn row_processing_progress(&self, _table: &str, _rows: u64) {}

    fn row_processing_success(&self, _table: &str, _rows: u64) {}

    fn component_success(&self, _result: &ComponentResult) {}

    fn error(&self, _error: &JobError) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalysisListener;

impl AnalysisListener for NoopAnalysisListener {}

/// Logs run progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAnalysisListener;

impl AnalysisListener for TracingAnalysisListener {
    fn job_begin(&self, tables: &[String]) {
        tracing::info!(tables = ?tables, "job started");
    }

    fn job_success(&self) {
        tracing::info!("job completed");
    }

    fn job_failed(&self, errors: &[JobError]) {
        tracing::warn!(errors = errors.len(), "job failed");
    }

    fn row_processing_begin(&self, table: &str, query: &Query) {
        tracing::debug!(table = %table, query = %query, "row processing started");
    }

    fn row_processing_progress(&self, table: &str, rows: u64) {
        tracing::debug!(table = %table, rows, "row processing progress");
    }

    fn row_processing_success(&self, table: &str, rows: u64) {
        tracing::info!(table = %table, rows, "row processing completed");
    }

    fn component_success(&self, result: &ComponentResult) {
        tracing::debug!(table = %result.table, component = %result.name, "component completed");
    }

    fn error(&self, error: &JobError) {
        tracing::error!(table = ?error.table(), error = %error, "job error");
    }
}

/// Fans every callback out to several listeners, in order.
#[derive(Clone, Default)]
pub struct CompositeAnalysisListener {
    listeners: Vec<Arc<dyn AnalysisListener>>,
}

impl CompositeAnalysisListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn AnalysisListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

macro_rules! fan_out {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        for listener in &$self.listeners {
            listener.$method($($arg),*);
        }
    };
}

impl AnalysisListener for CompositeAnalysisListener {
    fn job_begin(&self, tables: &[String]) {
        fan_out!(self.job_begin(tables));
    }

    fn job_success(&self) {
        fan_out!(self.job_success());
    }

    fn job_failed(&self, errors: &[JobError]) {
        fan_out!(self.job_failed(errors));
    }

    fn row_processing_begin(&self, table: &str, query: &Query) {
        fan_out!(self.row_processing_begin(table, query));
    }

    fn row_processing_progress(&self, table: &str, rows: u64) {
        fan_out!(self.row_processing_progress(table, rows));
    }

    fn row_processing_success(&self, table: &str, rows: u64) {
        fan_out!(self.row_processing_success(table, rows));
    }

    fn component_success(&self, result: &ComponentResult) {
        fan_out!(self.component_success(result));
    }

    fn error(&self, error: &JobError) {
        fan_out!(self.error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl AnalysisListener for Calls {
        fn job_begin(&self, tables: &[String]) {
            self.0.lock().push(format!("begin {}", tables.join(",")));
        }
        fn row_processing_progress(&self, table: &str, rows: u64) {
            self.0.lock().push(format!("progress {} {}", table, rows));
        }
    }

    #[test]
    fn test_composite_fans_out_in_order() {
        let first = Arc::new(Calls::default());
        let second = Arc::new(Calls::default());
        let composite = CompositeAnalysisListener::new()
            .with(first.clone())
            .with(Arc::new(TracingAnalysisListener))
            .with(second.clone());

        composite.job_begin(&["A".to_string(), "B".to_string()]);
        composite.row_processing_progress("A", 100);
        composite.job_success();

        assert_eq!(composite.len(), 3);
        assert_eq!(*first.0.lock(), vec!["begin A,B", "progress A 100"]);
        assert_eq!(*first.0.lock(), *second.0.lock());
    }
}
