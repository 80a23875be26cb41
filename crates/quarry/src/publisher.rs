//! Per-table row publishing.
//!
//! A [`RowProcessingPublisher`] owns the consumers of one source table. It
//! builds the table's query, pushes what it can into the datastore and
//! streams the resulting rows through a [`ConsumeRowHandler`].

use crate::component::{AnalyzerResult, ComponentError};
use crate::consumer::{sort_consumers, ConsumeRowError, ConsumeRowHandler, RowProcessingConsumer};
use crate::datastore::{DatastoreError, LeasedDatastore};
use crate::job::{ColumnRef, ConfigurationError, Job, NodeId, SourceColumn};
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::listener::AnalysisListener;
use crate::optimizer::QueryOptimizer;
use crate::query::Query;
use crate::registry::Registry;
use crate::row::InputRow;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Errors recorded against a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("{name} failed on row {row_id} of table {table} ({row}): {source}")]
    Component {
        node: NodeId,
        name: String,
        table: String,
        row_id: u64,
        /// Rendered row values at the time of failure.
        row: String,
        #[source]
        source: ComponentError,
    },

    #[error("datastore failure on table {table}: {source}")]
    Datastore {
        table: String,
        #[source]
        source: DatastoreError,
    },

    #[error("processing of table {table} was cancelled")]
    Cancelled { table: String },

    #[error("task {task} panicked: {message}")]
    Panicked { task: String, message: String },
}

impl JobError {
    fn component(table: &str, err: ConsumeRowError) -> Self {
        JobError::Component {
            node: err.node,
            name: err.name,
            table: table.to_string(),
            row_id: err.row.id(),
            row: err.row.to_string(),
            source: err.source,
        }
    }

    /// Table the error was raised for, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            JobError::Component { table, .. }
            | JobError::Datastore { table, .. }
            | JobError::Cancelled { table } => Some(table),
            JobError::Lifecycle(_) | JobError::Panicked { .. } => None,
        }
    }
}

/// Result of one analyzer after its table completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentResult {
    pub node: NodeId,
    pub name: String,
    pub table: String,
    pub result: AnalyzerResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Built,
    Initialized,
    Running,
    Completed,
    Failed,
}

/// Run-wide settings shared by every publisher.
pub struct PublishContext {
    pub datastore: Arc<LeasedDatastore>,
    pub optimizer_enabled: bool,
    pub cancel: Arc<AtomicBool>,
    pub listener: Arc<dyn AnalysisListener>,
    /// Rows between progress notifications; 0 disables them.
    pub progress_interval: u64,
}

impl fmt::Debug for PublishContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishContext")
            .field("datastore", &self.datastore)
            .field("optimizer_enabled", &self.optimizer_enabled)
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .field("progress_interval", &self.progress_interval)
            .finish()
    }
}

/// Drives the consumers of one source table.
pub struct RowProcessingPublisher {
    table: String,
    columns: Vec<SourceColumn>,
    consumers: Vec<Arc<RowProcessingConsumer>>,
    state: Mutex<PublisherState>,
}

impl RowProcessingPublisher {
    /// Instantiate and order the consumers of `table`.
    pub fn new(job: &Job, table: &str, registry: &Registry) -> Result<Self, ConfigurationError> {
        let consumers = job
            .nodes_for_table(table)
            .into_iter()
            .map(|node| {
                let id = &node.descriptor().id;
                let component = registry
                    .create(id)
                    .ok_or_else(|| ConfigurationError::NoFactory(id.clone()))?;
                Ok(Arc::new(RowProcessingConsumer::new(node.clone(), component)))
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        Ok(Self {
            table: table.to_string(),
            columns: job.source_columns_for_table(table),
            consumers: sort_consumers(table, consumers)?,
            state: Mutex::new(PublisherState::Built),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Consumers in processing order.
    pub fn consumers(&self) -> &[Arc<RowProcessingConsumer>] {
        &self.consumers
    }

    pub fn state(&self) -> PublisherState {
        *self.state.lock()
    }

    /// Every physical column the table's consumers read.
    pub fn base_query(&self) -> Query {
        Query::from(self.table.as_str()).select_all(self.columns.iter().cloned())
    }

    /// Initialize every consumer; stops at the first failure.
    pub fn initialize(&self, lifecycle: &LifecycleManager) -> Result<(), LifecycleError> {
        for consumer in &self.consumers {
            if let Err(e) = consumer.initialize(lifecycle) {
                *self.state.lock() = PublisherState::Failed;
                return Err(e);
            }
        }
        *self.state.lock() = PublisherState::Initialized;
        Ok(())
    }

    /// Stream the table's rows through its consumers and collect analyzer
    /// results. The first component error aborts the table.
    pub fn run(&self, ctx: &PublishContext) -> Result<Vec<ComponentResult>, JobError> {
        *self.state.lock() = PublisherState::Running;
        let outcome = self.process(ctx);
        *self.state.lock() = match outcome {
            Ok(_) => PublisherState::Completed,
            Err(_) => PublisherState::Failed,
        };
        outcome
    }

    fn process(&self, ctx: &PublishContext) -> Result<Vec<ComponentResult>, JobError> {
        let datastore_err = |source| JobError::Datastore {
            table: self.table.clone(),
            source,
        };

        let base_query = self.base_query();
        let (query, handler) = if ctx.optimizer_enabled {
            let optimizer = QueryOptimizer::new(
                &ctx.datastore.performance_characteristics(),
                &self.consumers,
                base_query,
            );
            let handler = ConsumeRowHandler::new(
                optimizer.optimized_consumers(),
                optimizer.optimized_available_outcomes(),
            );
            (optimizer.optimized_query(), handler)
        } else {
            (base_query, ConsumeRowHandler::new(self.consumers.clone(), Vec::new()))
        };

        tracing::info!(table = %self.table, query = %query, "processing rows");
        ctx.listener.row_processing_begin(&self.table, &query);

        let connection = ctx.datastore.open_connection().map_err(datastore_err)?;
        let mut rows = connection.execute_query(&query).map_err(datastore_err)?;

        let mut count: u64 = 0;
        loop {
            // Checked before fetching so a cancelled run pulls no further row.
            if ctx.cancel.load(Ordering::Acquire) {
                tracing::info!(table = %self.table, rows = count, "row processing cancelled");
                return Err(JobError::Cancelled {
                    table: self.table.clone(),
                });
            }
            let Some(values) = rows.next() else {
                break;
            };
            let values = values.map_err(datastore_err)?;
            let mut row = InputRow::new(query.offset() + count + 1);
            for (column, value) in query.select_items().iter().zip(values) {
                row.insert(ColumnRef::Source(column.clone()), value);
            }

            if let Err(e) = handler.consume_row(row) {
                tracing::error!(table = %self.table, node = %e.name, row = e.row.id(), error = %e.source, "component failed");
                return Err(JobError::component(&self.table, e));
            }
            count += 1;
            if ctx.progress_interval > 0 && count % ctx.progress_interval == 0 {
                ctx.listener.row_processing_progress(&self.table, count);
            }
        }
        drop(connection);

        ctx.listener.row_processing_success(&self.table, count);
        tracing::info!(table = %self.table, rows = count, "row processing complete");

        let results: Vec<ComponentResult> = self
            .consumers
            .iter()
            .filter_map(|consumer| {
                consumer.result().map(|result| ComponentResult {
                    node: consumer.id(),
                    name: consumer.name().to_string(),
                    table: self.table.clone(),
                    result,
                })
            })
            .collect();
        for result in &results {
            ctx.listener.component_success(result);
        }
        Ok(results)
    }

    /// Close every initialized consumer and release its leases.
    pub fn close(&self, lifecycle: &LifecycleManager, success: bool) {
        for consumer in &self.consumers {
            consumer.close(lifecycle, success);
        }
    }
}

impl fmt::Debug for RowProcessingPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowProcessingPublisher")
            .field("table", &self.table)
            .field("consumers", &self.consumers)
            .field("state", &self.state())
            .finish()
    }
}

/// One publisher per source table of a job.
#[derive(Debug, Default)]
pub struct RowProcessingPublishers {
    publishers: IndexMap<String, Arc<RowProcessingPublisher>>,
}

impl RowProcessingPublishers {
    pub fn new(job: &Job, registry: &Registry) -> Result<Self, ConfigurationError> {
        let mut publishers = IndexMap::new();
        for table in job.tables() {
            let publisher = RowProcessingPublisher::new(job, table, registry)?;
            publishers.insert(table.clone(), Arc::new(publisher));
        }
        Ok(Self { publishers })
    }

    pub fn get(&self, table: &str) -> Option<&Arc<RowProcessingPublisher>> {
        self.publishers.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.publishers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RowProcessingPublisher>> {
        self.publishers.values()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Initialize every publisher; on failure, close all of them unsuccessfully.
    pub fn initialize(&self, lifecycle: &LifecycleManager) -> Result<(), LifecycleError> {
        for publisher in self.iter() {
            if let Err(e) = publisher.initialize(lifecycle) {
                tracing::error!(table = %publisher.table(), error = %e, "initialization failed");
                self.close(lifecycle, false);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn close(&self, lifecycle: &LifecycleManager, success: bool) {
        for publisher in self.iter() {
            publisher.close(lifecycle, success);
        }
    }
}
