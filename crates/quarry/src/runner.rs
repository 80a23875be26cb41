//! Running jobs.
//!
//! [`AnalysisRunner::run`] validates and wires a job synchronously, then
//! hands one task per source table to its [`TaskRunner`]. The returned
//! [`AnalysisResultFuture`] fills up as tables complete.

use crate::annotation::InMemoryRowAnnotationFactory;
use crate::component::AnalyzerResult;
use crate::config::EngineConfig;
use crate::datastore::{Datastore, LeasedDatastore};
use crate::job::{ConfigurationError, Job, NodeId};
use crate::lifecycle::{LifecycleManager, RunContext};
use crate::listener::{AnalysisListener, TracingAnalysisListener};
use crate::publisher::{ComponentResult, JobError, PublishContext, RowProcessingPublisher, RowProcessingPublishers};
use crate::reference::ReferenceDataCatalog;
use crate::registry::Registry;
use crate::task::{JoinTaskListener, SingleThreadedTaskRunner, Task, TaskListener, TaskRunner};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A run refused before any component was touched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

// ============================================================================
// Result future
// ============================================================================

#[derive(Default)]
struct Collected {
    done: bool,
    results: Vec<ComponentResult>,
    errors: Vec<JobError>,
}

/// Shared between the future and the tasks of one run.
struct RunState {
    collected: Mutex<Collected>,
    done: Condvar,
    cancel: Arc<AtomicBool>,
    listener: Arc<dyn AnalysisListener>,
}

impl RunState {
    fn new(listener: Arc<dyn AnalysisListener>) -> Self {
        Self {
            collected: Mutex::new(Collected::default()),
            done: Condvar::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            listener,
        }
    }

    fn add_results(&self, results: Vec<ComponentResult>) {
        self.collected.lock().results.extend(results);
    }

    fn add_error(&self, error: JobError) {
        self.listener.error(&error);
        self.collected.lock().errors.push(error);
    }

    fn complete(&self) {
        let errors = {
            let mut collected = self.collected.lock();
            if collected.done {
                return;
            }
            collected.done = true;
            collected.errors.clone()
        };
        if errors.is_empty() {
            self.listener.job_success();
        } else {
            self.listener.job_failed(&errors);
        }
        self.done.notify_all();
    }
}

impl TaskListener for RunState {
    fn on_complete(&self, task: &str) {
        tracing::debug!(task = %task, "task completed");
    }

    fn on_error(&self, task: &str, error: JobError) {
        tracing::debug!(task = %task, error = %error, "task failed");
        self.add_error(error);
    }
}

/// Handle to a running job.
///
/// Accessors other than [`is_done`](Self::is_done) and
/// [`cancel`](Self::cancel) block until the run has finished. Results of
/// tables that completed stay available when other tables fail.
#[derive(Clone)]
pub struct AnalysisResultFuture {
    state: Arc<RunState>,
}

impl AnalysisResultFuture {
    fn new(state: Arc<RunState>) -> Self {
        Self { state }
    }

    /// Block until every table has finished.
    pub fn await_completion(&self) {
        let mut collected = self.state.collected.lock();
        while !collected.done {
            self.state.done.wait(&mut collected);
        }
    }

    /// Block for at most `timeout`; returns whether the run finished.
    pub fn await_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut collected = self.state.collected.lock();
        while !collected.done {
            if self.state.done.wait_until(&mut collected, deadline).timed_out() {
                return collected.done;
            }
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.state.collected.lock().done
    }

    /// Whether the run finished without recording any error.
    pub fn is_successful(&self) -> bool {
        self.await_completion();
        self.state.collected.lock().errors.is_empty()
    }

    pub fn errors(&self) -> Vec<JobError> {
        self.await_completion();
        self.state.collected.lock().errors.clone()
    }

    /// Results of every analyzer whose table completed.
    pub fn results(&self) -> Vec<ComponentResult> {
        self.await_completion();
        self.state.collected.lock().results.clone()
    }

    pub fn result_for(&self, node: NodeId) -> Option<AnalyzerResult> {
        self.await_completion();
        self.state
            .collected
            .lock()
            .results
            .iter()
            .find(|r| r.node == node)
            .map(|r| r.result.clone())
    }

    /// Ask every table to stop after its current row.
    pub fn cancel(&self) {
        tracing::info!("cancelling run");
        self.state.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AnalysisResultFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let collected = self.state.collected.lock();
        f.debug_struct("AnalysisResultFuture")
            .field("done", &collected.done)
            .field("results", &collected.results.len())
            .field("errors", &collected.errors)
            .finish()
    }
}

// ============================================================================
// Tasks
// ============================================================================

struct PublisherTask {
    publisher: Arc<RowProcessingPublisher>,
    ctx: Arc<PublishContext>,
    lifecycle: LifecycleManager,
    state: Arc<RunState>,
}

impl Task for PublisherTask {
    fn name(&self) -> &str {
        self.publisher.table()
    }

    fn execute(&mut self) -> Result<(), JobError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.publisher.run(&self.ctx)));
        match outcome {
            Ok(Ok(results)) => {
                self.state.add_results(results);
                self.publisher.close(&self.lifecycle, true);
                Ok(())
            }
            Ok(Err(e)) => {
                self.publisher.close(&self.lifecycle, false);
                Err(e)
            }
            // Close before the panic reaches the task listener, which may complete the run.
            Err(payload) => {
                self.publisher.close(&self.lifecycle, false);
                panic::resume_unwind(payload)
            }
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Runs jobs against datastores.
pub struct AnalysisRunner {
    registry: Arc<Registry>,
    config: EngineConfig,
    task_runner: Arc<dyn TaskRunner>,
    reference_data: Arc<ReferenceDataCatalog>,
    listener: Arc<dyn AnalysisListener>,
}

impl AnalysisRunner {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            config: EngineConfig::default(),
            task_runner: Arc::new(SingleThreadedTaskRunner::new()),
            reference_data: Arc::new(ReferenceDataCatalog::new()),
            listener: Arc::new(TracingAnalysisListener),
        }
    }

    /// Runner honouring `config`; more than one thread needs the `parallel`
    /// feature, otherwise tables run sequentially.
    pub fn from_config(registry: Arc<Registry>, config: EngineConfig) -> Self {
        let task_runner = task_runner_for(config.runner.threads);
        Self {
            config,
            task_runner,
            ..Self::new(registry)
        }
    }

    pub fn with_task_runner(mut self, task_runner: Arc<dyn TaskRunner>) -> Self {
        self.task_runner = task_runner;
        self
    }

    pub fn with_reference_data(mut self, catalog: Arc<ReferenceDataCatalog>) -> Self {
        self.reference_data = catalog;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn AnalysisListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start a run.
    ///
    /// Configuration errors are returned immediately. Everything after that,
    /// including initialization failures, is recorded in the future.
    pub fn run(&self, job: &Job, datastore: Arc<dyn Datastore>) -> Result<AnalysisResultFuture, RunError> {
        let publishers = RowProcessingPublishers::new(job, &self.registry)?;

        let annotations = InMemoryRowAnnotationFactory::new(
            self.config.annotations.max_sample_sets,
            self.config.annotations.max_sample_records,
        );
        let run_context = RunContext::new(Arc::new(annotations), Arc::clone(&self.reference_data));
        let lifecycle = LifecycleManager::new(Arc::new(run_context));

        let state = Arc::new(RunState::new(Arc::clone(&self.listener)));
        let future = AnalysisResultFuture::new(Arc::clone(&state));

        let tables: Vec<String> = publishers.tables().map(str::to_string).collect();
        tracing::info!(datastore = %datastore.name(), tables = ?tables, "starting run");
        self.listener.job_begin(&tables);

        if let Err(e) = publishers.initialize(&lifecycle) {
            state.add_error(JobError::Lifecycle(e));
            state.complete();
            return Ok(future);
        }

        let ctx = Arc::new(PublishContext {
            datastore: Arc::new(LeasedDatastore::new(datastore)),
            optimizer_enabled: self.config.optimizer.enabled,
            cancel: Arc::clone(&state.cancel),
            listener: Arc::clone(&self.listener),
            progress_interval: self.config.progress_interval,
        });

        let on_done = Arc::clone(&state);
        let join: Arc<dyn TaskListener> = Arc::new(JoinTaskListener::new(
            publishers.len(),
            Arc::clone(&state) as Arc<dyn TaskListener>,
            move || on_done.complete(),
        ));

        let tasks = publishers
            .iter()
            .map(|publisher| {
                let task: Box<dyn Task> = Box::new(PublisherTask {
                    publisher: Arc::clone(publisher),
                    ctx: Arc::clone(&ctx),
                    lifecycle: lifecycle.clone(),
                    state: Arc::clone(&state),
                });
                (task, Arc::clone(&join))
            })
            .collect();
        self.task_runner.run_all(tasks);

        Ok(future)
    }
}

impl fmt::Debug for AnalysisRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisRunner")
            .field("components", &self.registry.len())
            .field("config", &self.config)
            .field("reference_data", &self.reference_data)
            .finish()
    }
}

#[cfg(feature = "parallel")]
fn task_runner_for(threads: usize) -> Arc<dyn TaskRunner> {
    if threads > 1 {
        Arc::new(crate::task::MultiThreadedTaskRunner::new(threads))
    } else {
        Arc::new(SingleThreadedTaskRunner::new())
    }
}

#[cfg(not(feature = "parallel"))]
fn task_runner_for(threads: usize) -> Arc<dyn TaskRunner> {
    if threads > 1 {
        tracing::warn!(threads, "built without the parallel feature, running single-threaded");
    }
    Arc::new(SingleThreadedTaskRunner::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Analyzer, Component, ComponentDescriptor, ComponentError};
    use crate::datastore::{MemoryDatastore, MemoryTable};
    use crate::job::{ColumnRef, JobBuilder, NodeSpec};
    use crate::row::InputRow;
    use crate::value::Value;

    #[derive(Default)]
    struct Count {
        rows: u64,
        fail_init: bool,
    }

    impl Component for Count {
        fn configure(&mut self, name: &str, value: &Value) -> Result<(), ComponentError> {
            match name {
                "fail_init" => {
                    self.fail_init = value.as_bool().unwrap_or(false);
                    Ok(())
                }
                other => Err(ComponentError::UnknownProperty(other.to_string())),
            }
        }

        fn initialize(&mut self, _: &RunContext) -> Result<(), ComponentError> {
            if self.fail_init {
                return Err(ComponentError::failed("cannot start"));
            }
            Ok(())
        }
    }

    impl Analyzer for Count {
        fn run(&mut self, _: &InputRow, _: &[Value], count: u64) -> Result<(), ComponentError> {
            self.rows += count;
            Ok(())
        }

        fn result(&mut self) -> AnalyzerResult {
            AnalyzerResult::new().metric("rows", self.rows)
        }
    }

    fn make_registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register_analyzer(
            ComponentDescriptor::analyzer("analyzer.count").property(
                crate::component::PropertyDescriptor::new("fail_init", crate::component::PropertyKind::Bool)
                    .default_value(false),
            ),
            Count::default,
        );
        Arc::new(registry)
    }

    fn make_datastore() -> MemoryDatastore {
        MemoryDatastore::new("mem")
            .table("A", MemoryTable::new(["X"]).row([1i64]).row([2i64]))
            .table("B", MemoryTable::new(["Y"]).row([1i64]))
    }

    #[test]
    fn test_run_two_tables() {
        let registry = make_registry();
        let mut builder = JobBuilder::new();
        let a = builder.add(NodeSpec::analyzer("analyzer.count").input(ColumnRef::source("A", "X")));
        let b = builder.add(NodeSpec::analyzer("analyzer.count").input(ColumnRef::source("B", "Y")));
        let job = builder.build(&registry).unwrap();

        let datastore = make_datastore();
        let future = AnalysisRunner::new(registry).run(&job, Arc::new(datastore.clone())).unwrap();

        assert!(future.await_timeout(Duration::from_secs(5)));
        assert!(future.is_successful());
        assert_eq!(future.results().len(), 2);
        assert_eq!(future.result_for(a).unwrap().metrics["rows"], Value::from(2u64));
        assert_eq!(future.result_for(b).unwrap().metrics["rows"], Value::from(1u64));
        assert_eq!(datastore.executed_queries().len(), 2);
    }

    #[test]
    fn test_init_failure_recorded_without_queries() {
        let registry = make_registry();
        let mut builder = JobBuilder::new();
        builder.add(
            NodeSpec::analyzer("analyzer.count")
                .input(ColumnRef::source("A", "X"))
                .property("fail_init", true),
        );
        let job = builder.build(&registry).unwrap();

        let datastore = make_datastore();
        let future = AnalysisRunner::new(registry).run(&job, Arc::new(datastore.clone())).unwrap();

        assert!(future.is_done());
        assert!(!future.is_successful());
        assert!(matches!(future.errors()[0], JobError::Lifecycle(_)));
        assert!(datastore.executed_queries().is_empty());
    }

    struct Exploding {
        closed: Arc<AtomicBool>,
    }

    impl Component for Exploding {
        fn close(&mut self, _success: bool) -> Result<(), ComponentError> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    impl Analyzer for Exploding {
        fn run(&mut self, _: &InputRow, _: &[Value], _: u64) -> Result<(), ComponentError> {
            panic!("exploded");
        }

        fn result(&mut self) -> AnalyzerResult {
            AnalyzerResult::new()
        }
    }

    /// Records whether the component was closed when the run failed.
    struct ClosedAtCompletion {
        closed: Arc<AtomicBool>,
        seen: Arc<AtomicBool>,
    }

    impl AnalysisListener for ClosedAtCompletion {
        fn job_failed(&self, _errors: &[JobError]) {
            self.seen.store(self.closed.load(Ordering::Acquire), Ordering::Release);
        }
    }

    #[test]
    fn test_panicking_task_closed_before_completion() {
        let closed = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicBool::new(false));
        let mut registry = Registry::new();
        let flag = Arc::clone(&closed);
        registry.register_analyzer(ComponentDescriptor::analyzer("analyzer.exploding"), move || Exploding {
            closed: Arc::clone(&flag),
        });
        let registry = Arc::new(registry);
        let mut builder = JobBuilder::new();
        builder.add(NodeSpec::analyzer("analyzer.exploding").input(ColumnRef::source("A", "X")));
        let job = builder.build(&registry).unwrap();

        let future = AnalysisRunner::new(registry)
            .with_listener(Arc::new(ClosedAtCompletion {
                closed: Arc::clone(&closed),
                seen: Arc::clone(&seen),
            }))
            .run(&job, Arc::new(make_datastore()))
            .unwrap();

        assert!(matches!(future.errors()[0], JobError::Panicked { .. }));
        assert!(seen.load(Ordering::Acquire));
    }

    #[test]
    fn test_empty_job_completes() {
        let registry = make_registry();
        let job = JobBuilder::new().build(&registry).unwrap();

        let future = AnalysisRunner::new(registry).run(&job, Arc::new(make_datastore())).unwrap();
        assert!(future.is_done());
        assert!(future.is_successful());
        assert!(future.results().is_empty());
    }

    #[test]
    fn test_from_config() {
        let mut config = EngineConfig::default();
        config.optimizer.enabled = false;
        let runner = AnalysisRunner::from_config(make_registry(), config);

        assert!(!runner.config().optimizer.enabled);
        assert_eq!(runner.registry().len(), 1);
    }
}
