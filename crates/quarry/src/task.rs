//! Units of work and the runners executing them.

use crate::publisher::JobError;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A unit of work submitted to a [`TaskRunner`].
pub trait Task: Send {
    fn name(&self) -> &str;

    fn execute(&mut self) -> Result<(), JobError>;
}

/// Notified as a task progresses. Exactly one of `on_complete` and
/// `on_error` is called per task.
pub trait TaskListener: Send + Sync {
    fn on_begin(&self, _task: &str) {}

    fn on_complete(&self, task: &str);

    fn on_error(&self, task: &str, error: JobError);
}

/// Executes tasks, possibly asynchronously.
pub trait TaskRunner: Send + Sync {
    /// Submit one task. May return before the task has run.
    fn run(&self, task: Box<dyn Task>, listener: Arc<dyn TaskListener>);

    /// Submit several tasks.
    ///
    /// Default implementation submits them one by one.
    fn run_all(&self, tasks: Vec<(Box<dyn Task>, Arc<dyn TaskListener>)>) {
        for (task, listener) in tasks {
            self.run(task, listener);
        }
    }
}

/// Run a task on the current thread, reporting to its listener.
///
/// A panicking task is reported as an error, so listeners always hear back.
pub fn run_task(mut task: Box<dyn Task>, listener: &dyn TaskListener) {
    let name = task.name().to_string();
    listener.on_begin(&name);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.execute()));
    match outcome {
        Ok(Ok(())) => listener.on_complete(&name),
        Ok(Err(error)) => listener.on_error(&name, error),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task = %name, panic = %message, "task panicked");
            listener.on_error(&name, JobError::Panicked { task: name.clone(), message });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Runners
// ============================================================================

/// Runs every task inline, on the submitting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleThreadedTaskRunner;

impl SingleThreadedTaskRunner {
    pub fn new() -> Self {
        Self
    }
}

impl TaskRunner for SingleThreadedTaskRunner {
    fn run(&self, task: Box<dyn Task>, listener: Arc<dyn TaskListener>) {
        run_task(task, listener.as_ref());
    }
}

/// Runs tasks on a rayon thread pool. `run` returns immediately.
#[cfg(feature = "parallel")]
pub struct MultiThreadedTaskRunner {
    pool: Option<rayon::ThreadPool>,
}

#[cfg(feature = "parallel")]
impl MultiThreadedTaskRunner {
    /// Pool with `threads` workers; falls back to rayon's global pool when
    /// the pool cannot be built.
    pub fn new(threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("quarry-worker-{}", i))
            .build();
        let pool = match pool {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!(error = %e, threads, "cannot build thread pool, using global pool");
                None
            }
        };
        Self { pool }
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, rayon::ThreadPool::current_num_threads)
    }
}

#[cfg(feature = "parallel")]
impl TaskRunner for MultiThreadedTaskRunner {
    fn run(&self, task: Box<dyn Task>, listener: Arc<dyn TaskListener>) {
        let job = move || run_task(task, listener.as_ref());
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

#[cfg(feature = "parallel")]
impl fmt::Debug for MultiThreadedTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiThreadedTaskRunner")
            .field("threads", &self.threads())
            .finish()
    }
}

// ============================================================================
// Join
// ============================================================================

/// Forwards to an inner listener and fires a callback once a fixed number
/// of tasks has finished, successfully or not.
pub struct JoinTaskListener {
    inner: Arc<dyn TaskListener>,
    remaining: AtomicUsize,
    on_done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl JoinTaskListener {
    pub fn new(
        count: usize,
        inner: Arc<dyn TaskListener>,
        on_done: impl FnOnce() + Send + 'static,
    ) -> Self {
        let listener = Self {
            inner,
            remaining: AtomicUsize::new(count),
            on_done: Mutex::new(Some(Box::new(on_done))),
        };
        if count == 0 {
            listener.fire();
        }
        listener
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let on_done = self.on_done.lock().take();
        if let Some(on_done) = on_done {
            on_done();
        }
    }
}

impl TaskListener for JoinTaskListener {
    fn on_begin(&self, task: &str) {
        self.inner.on_begin(task);
    }

    fn on_complete(&self, task: &str) {
        self.inner.on_complete(task);
        self.finish_one();
    }

    fn on_error(&self, task: &str, error: JobError) {
        self.inner.on_error(task, error);
        self.finish_one();
    }
}

impl fmt::Debug for JoinTaskListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinTaskListener")
            .field("remaining", &self.remaining())
            .finish()
    }
}
