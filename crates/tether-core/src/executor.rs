//! Single-consumer executor with a dedicated worker thread.
//!
//! A [`TaskExecutor`] owns one [`TaskQueue`] and one worker thread. Any number
//! of producer threads may post tasks; the worker runs them strictly one at a
//! time, in the order the posts were serialized through the queue lock. State
//! that is only touched from posted tasks therefore never sees concurrent
//! access, which is what lets engine callbacks arriving on arbitrary threads
//! drive single-threaded request logic.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::TaskExecutor;
//!
//! let executor = TaskExecutor::new()?;
//!
//! executor.post_task(|| println!("runs on the worker thread"))?;
//!
//! // Run a closure on the worker and wait for its result.
//! let answer = executor.post_and_wait(|| 6 * 7)?;
//! assert_eq!(answer, 42);
//!
//! // Drain whatever is still queued, then join the worker.
//! executor.stop_and_join();
//! # Ok::<(), tether_core::ExecutorError>(())
//! ```
//!
//! # Worker states
//!
//! The worker moves between [`ExecutorState::Waiting`] (queue empty),
//! [`ExecutorState::Running`] (executing a task), [`ExecutorState::Draining`]
//! (stop requested, queue still non-empty) and [`ExecutorState::Stopped`]
//! (thread exited). After [`TaskExecutor::stop`] every post is rejected with
//! [`ExecutorError::ShutDown`]; tasks accepted before the stop still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};

use crate::error::{ExecutorError, Result};
use crate::logging::targets;
use crate::task::{QueuedTask, Task, TaskId, TaskQueue, panic_message};

/// Default name for the worker thread.
const DEFAULT_THREAD_NAME: &str = "tether-worker";

/// The engine-facing side of an executor: "run this unit of work".
///
/// An asynchronous engine is handed an `Executor` and calls
/// [`execute`](Executor::execute) from whatever thread it happens to be on.
/// Implementations must never run the task synchronously on the caller.
pub trait Executor: Send + Sync {
    /// Schedule `task` for execution.
    ///
    /// There is no error channel: an implementation that can no longer accept
    /// work drops the task.
    fn execute(&self, task: Task);
}

/// Configuration for creating a [`TaskExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name for the worker thread.
    pub name: String,
    /// Stack size for the worker thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating executors with custom configuration.
#[derive(Debug, Default)]
pub struct ExecutorBuilder {
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Build and start the executor.
    pub fn build(self) -> Result<TaskExecutor> {
        TaskExecutor::with_config(self.config)
    }
}

/// Observable state of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Queue empty, no stop requested; the worker is suspended.
    Waiting,
    /// The worker is executing a task.
    Running,
    /// Stop requested; the worker is executing the remaining tasks.
    Draining,
    /// The worker thread has exited.
    Stopped,
}

/// Queue plus lifecycle flags, guarded by one mutex.
struct QueueState {
    tasks: TaskQueue,
    stop_requested: bool,
    state: ExecutorState,
}

/// State shared between the executor handle and its worker thread.
struct Shared {
    name: String,
    queue: Mutex<QueueState>,
    /// Signalled when a task is posted or a stop is requested.
    available: Condvar,
    /// Signalled once when the worker exits.
    stopped: Condvar,
    executed: AtomicU64,
    panicked: AtomicU64,
}

impl Shared {
    fn run(&self, task: QueuedTask) {
        let id = task.id();
        tracing::trace!(target: targets::EXECUTOR, executor = %self.name, %id, "running task");

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: targets::EXECUTOR,
                executor = %self.name,
                %id,
                message = %panic_message(payload.as_ref()),
                "task panicked; continuing with the next task"
            );
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A dedicated worker thread executing posted tasks in FIFO order.
///
/// # Thread Safety
///
/// `TaskExecutor` is `Send + Sync`; share it behind an `Arc` to post from many
/// threads.
///
/// # Shutdown
///
/// Dropping the executor requests a stop, lets the worker drain the queue and
/// joins it, so no task runs after the drop returns. Dropping it from inside
/// one of its own tasks only requests the stop; the worker exits once the
/// queue is drained.
pub struct TaskExecutor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TaskExecutor {
    /// Create a new executor with default configuration.
    ///
    /// The worker thread starts immediately.
    pub fn new() -> Result<Self> {
        Self::with_config(ExecutorConfig::default())
    }

    /// Create a new executor with custom configuration.
    pub fn with_config(config: ExecutorConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            queue: Mutex::new(QueueState {
                tasks: TaskQueue::new(),
                stop_requested: false,
                state: ExecutorState::Waiting,
            }),
            available: Condvar::new(),
            stopped: Condvar::new(),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread_shared = shared.clone();
        let handle = builder
            .spawn(move || worker_loop(&thread_shared))
            .map_err(|err| ExecutorError::spawn(config.name.clone(), err))?;
        let worker_id = handle.thread().id();

        tracing::debug!(target: targets::EXECUTOR, executor = %config.name, "worker started");

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Create a builder for configuring an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    /// The worker thread's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Post a task for execution on the worker thread.
    ///
    /// Never runs `task` on the calling thread and only blocks for the queue's
    /// critical section.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::ShutDown`] once [`stop`](Self::stop) has been
    /// called; the task is dropped without running.
    pub fn post_task<F>(&self, task: F) -> Result<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_boxed(Box::new(task))
    }

    fn post_boxed(&self, task: Task) -> Result<TaskId> {
        let mut queue = self.shared.queue.lock();
        if queue.stop_requested {
            return Err(ExecutorError::ShutDown);
        }
        let id = queue.tasks.push(task);
        drop(queue);

        self.shared.available.notify_one();
        Ok(id)
    }

    /// Run `task` on the worker thread and block until it returns.
    ///
    /// Called from the worker thread itself, the closure runs inline, since
    /// waiting for a later queue slot would deadlock.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::ShutDown`] if the executor is stopped, or
    /// [`ExecutorError::TaskPanicked`] if the closure panicked.
    pub fn post_and_wait<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_worker_thread() {
            return catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| ExecutorError::TaskPanicked(panic_message(payload.as_ref())));
        }

        let (result_sender, result_receiver) = bounded(1);
        self.post_task(move || {
            let _ = result_sender.send(task());
        })?;

        // The sender is dropped without sending only if the task panicked.
        result_receiver.recv().map_err(|_| {
            ExecutorError::TaskPanicked("task panicked before producing a result".to_string())
        })
    }

    /// Check whether the calling thread is this executor's worker.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Check if the executor still accepts tasks.
    pub fn is_running(&self) -> bool {
        !self.shared.queue.lock().stop_requested
    }

    /// Current state of the worker loop.
    pub fn state(&self) -> ExecutorState {
        self.shared.queue.lock().state
    }

    /// Number of tasks queued but not yet started.
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Number of tasks the worker has run, including ones that panicked.
    pub fn executed_tasks(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Number of tasks that panicked.
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    /// Request the worker to stop after draining the queue.
    ///
    /// Non-blocking. Subsequent posts are rejected. With tasks still queued
    /// the state becomes [`ExecutorState::Draining`] immediately.
    pub fn stop(&self) {
        let mut queue = self.shared.queue.lock();
        if !queue.stop_requested {
            queue.stop_requested = true;
            if !queue.tasks.is_empty() {
                queue.state = ExecutorState::Draining;
            }
            tracing::debug!(
                target: targets::EXECUTOR,
                executor = %self.shared.name,
                pending = queue.tasks.len(),
                "stop requested"
            );
        }
        drop(queue);
        self.shared.available.notify_all();
    }

    /// Wait for the worker thread to finish.
    ///
    /// Call [`stop`](Self::stop) first, or this blocks until another thread
    /// does. Returns `true` if the worker was joined by this call, `false` if
    /// it was already joined or this is the worker thread itself.
    pub fn join(&self) -> bool {
        if self.is_worker_thread() {
            return false;
        }
        let handle = self.handle.lock().take();
        match handle {
            Some(h) => h.join().is_ok(),
            None => false,
        }
    }

    /// Stop the executor and wait for it to drain.
    pub fn stop_and_join(&self) -> bool {
        self.stop();
        self.join()
    }

    /// Wait until the worker has exited, with a timeout.
    ///
    /// Returns `true` if the worker is stopped.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while queue.state != ExecutorState::Stopped {
            if self.shared.stopped.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        queue.state == ExecutorState::Stopped
    }
}

impl Executor for TaskExecutor {
    fn execute(&self, task: Task) {
        if let Err(err) = self.post_boxed(task) {
            tracing::debug!(
                target: targets::EXECUTOR,
                executor = %self.shared.name,
                error = %err,
                "dropping task posted after shutdown"
            );
        }
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task)
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("TaskExecutor")
            .field("name", &self.shared.name)
            .field("state", &queue.state)
            .field("pending", &queue.tasks.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(TaskExecutor: Send, Sync);

/// The worker loop: wait, dequeue one task, run it, repeat.
fn worker_loop(shared: &Shared) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop() {
                    queue.state = if queue.stop_requested {
                        ExecutorState::Draining
                    } else {
                        ExecutorState::Running
                    };
                    break Some(task);
                }
                if queue.stop_requested {
                    queue.state = ExecutorState::Stopped;
                    break None;
                }
                queue.state = ExecutorState::Waiting;
                shared.available.wait(&mut queue);
            }
        };

        match next {
            Some(task) => shared.run(task),
            None => break,
        }
    }

    tracing::debug!(
        target: targets::EXECUTOR,
        executor = %shared.name,
        executed = shared.executed.load(Ordering::Relaxed),
        panicked = shared.panicked.load(Ordering::Relaxed),
        "worker stopped"
    );
    let _queue = shared.queue.lock();
    shared.stopped.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn test_executor_creation() {
        let executor = TaskExecutor::new().unwrap();
        assert!(executor.is_running());
        assert_eq!(executor.pending_tasks(), 0);
        assert_eq!(executor.name(), DEFAULT_THREAD_NAME);
        assert!(executor.stop_and_join());
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[test]
    fn test_executor_with_builder() {
        let executor = TaskExecutor::builder()
            .name("test-executor")
            .stack_size(256 * 1024)
            .build()
            .unwrap();

        let name = executor
            .post_and_wait(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-executor"));
        executor.stop_and_join();
    }

    #[test]
    fn test_never_runs_on_caller_thread() {
        let executor = TaskExecutor::new().unwrap();
        let caller = thread::current().id();

        let ran_on = executor.post_and_wait(|| thread::current().id()).unwrap();
        assert_ne!(ran_on, caller);
        assert!(!executor.is_worker_thread());
        assert!(executor.post_and_wait(|| ()).is_ok());
    }

    #[test]
    fn test_sequential_processing() {
        let executor = TaskExecutor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            executor.post_task(move || order.lock().push(i)).unwrap();
        }
        executor.stop_and_join();

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_task_is_isolated() {
        let executor = TaskExecutor::new().unwrap();
        let after = Arc::new(AtomicBool::new(false));

        executor.post_task(|| panic!("task blew up")).unwrap();
        let after_clone = after.clone();
        executor
            .post_task(move || after_clone.store(true, Ordering::SeqCst))
            .unwrap();

        executor.stop_and_join();
        assert!(after.load(Ordering::SeqCst));
        assert_eq!(executor.panicked_tasks(), 1);
        assert_eq!(executor.executed_tasks(), 2);
    }

    #[test]
    fn test_post_and_wait_reports_panic() {
        let executor = TaskExecutor::new().unwrap();
        let result = executor.post_and_wait(|| -> u32 { panic!("no result") });
        assert!(matches!(result, Err(ExecutorError::TaskPanicked(_))));

        // The worker keeps serving.
        assert_eq!(executor.post_and_wait(|| 5).unwrap(), 5);
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let executor = TaskExecutor::new().unwrap();
        executor.stop();

        let result = executor.post_task(|| {});
        assert!(matches!(result, Err(ExecutorError::ShutDown)));
        assert!(matches!(
            executor.post_and_wait(|| 1),
            Err(ExecutorError::ShutDown)
        ));
        assert!(executor.join());
    }

    #[test]
    fn test_execute_after_stop_is_dropped() {
        let executor = TaskExecutor::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        executor.stop_and_join();

        let ran_clone = ran.clone();
        Executor::execute(&executor, Box::new(move || ran_clone.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let executor = TaskExecutor::new().unwrap();
            for _ in 0..5 {
                let counter = counter.clone();
                executor
                    .post_task(move || {
                        thread::sleep(Duration::from_millis(5));
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_drop_on_worker_thread_does_not_deadlock() {
        let executor = Arc::new(TaskExecutor::new().unwrap());
        let (done_tx, done_rx) = bounded(1);

        let inner = executor.clone();
        executor
            .post_task(move || {
                // Hold the last reference once the outer Arc is gone.
                thread::sleep(Duration::from_millis(20));
                assert!(!inner.join());
                drop(inner);
                let _ = done_tx.send(());
            })
            .unwrap();
        drop(executor);

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_post_and_wait_inline_on_worker() {
        let executor = Arc::new(TaskExecutor::new().unwrap());
        let inner = executor.clone();

        let nested = executor
            .post_and_wait(move || inner.post_and_wait(|| 11).unwrap())
            .unwrap();
        assert_eq!(nested, 11);
    }

    #[test]
    fn test_state_transitions() {
        let executor = TaskExecutor::new().unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        executor
            .post_task(move || {
                let _ = started_tx.send(());
                let _ = gate_rx.recv();
            })
            .unwrap();

        started_rx.recv().unwrap();
        assert_eq!(executor.state(), ExecutorState::Running);

        executor.post_task(|| {}).unwrap();
        executor.stop();
        assert_eq!(executor.pending_tasks(), 1);
        // Still inside the first task, with work left to drain.
        assert_eq!(executor.state(), ExecutorState::Draining);
        gate_tx.send(()).unwrap();

        assert!(executor.wait_stopped(Duration::from_secs(5)));
        assert_eq!(executor.state(), ExecutorState::Stopped);
        assert_eq!(executor.executed_tasks(), 2);
        assert_eq!(executor.pending_tasks(), 0);
    }
}
