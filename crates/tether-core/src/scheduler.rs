//! Delayed task scheduling onto an executor.
//!
//! A [`DelayScheduler`] owns a timer thread and a min-heap of deadlines. When
//! a deadline passes, the scheduled closure is *posted* to the target
//! [`Executor`]; the timer thread never runs it. That keeps timed work, such
//! as request timeouts, in the same serialized stream as every other task and
//! means a firing timer can never pre-empt a task that is already running.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tether_core::{DelayScheduler, TaskExecutor};
//!
//! let executor = Arc::new(TaskExecutor::new()?);
//! let scheduler = DelayScheduler::new("tether-timer", executor.clone())?;
//!
//! let id = scheduler.schedule_once(Duration::from_secs(5), || {
//!     println!("posted to the executor after 5 seconds");
//! })?;
//!
//! // Changed our mind.
//! scheduler.cancel(id)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slotmap::{SlotMap, new_key_type};

use crate::error::SchedulerError;
use crate::executor::Executor;
use crate::logging::targets;
use crate::task::Task;

new_key_type! {
    /// A unique identifier for a scheduled task.
    pub struct ScheduledTaskId;
}

/// An entry in the deadline heap (min-heap by run time, FIFO on ties).
#[derive(Debug, Clone, Copy)]
struct DeadlineEntry {
    id: ScheduledTaskId,
    run_at: Instant,
    seq: u64,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    /// Tasks that have neither fired nor been cancelled.
    tasks: SlotMap<ScheduledTaskId, Task>,
    /// Deadlines; entries whose ID is gone from `tasks` are stale.
    queue: BinaryHeap<DeadlineEntry>,
    next_seq: u64,
    shutdown: bool,
}

impl TimerState {
    /// Drop stale entries from the front of the heap.
    fn skip_stale(&mut self) {
        while let Some(entry) = self.queue.peek() {
            if self.tasks.contains_key(entry.id) {
                break;
            }
            self.queue.pop();
        }
    }

    /// Remove every task whose deadline is at or before `now`, in deadline order.
    fn take_due(&mut self, now: Instant) -> Vec<(ScheduledTaskId, Task)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.peek().copied() {
            if entry.run_at > now {
                break;
            }
            self.queue.pop();
            if let Some(task) = self.tasks.remove(entry.id) {
                due.push((entry.id, task));
            }
        }
        due
    }
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Posts closures to an executor once their deadline has passed.
///
/// Dropping the scheduler stops the timer thread; tasks that have not fired
/// yet are dropped without running.
pub struct DelayScheduler {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    timer_id: ThreadId,
}

impl DelayScheduler {
    /// Start a timer thread that posts due tasks to `target`.
    pub fn new(
        name: impl Into<String>,
        target: Arc<dyn Executor>,
    ) -> Result<Self, SchedulerError> {
        let name = name.into();
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                tasks: SlotMap::with_key(),
                queue: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&thread_shared, target.as_ref()))
            .map_err(|source| SchedulerError::Spawn {
                name: name.clone(),
                source,
            })?;
        let timer_id = handle.thread().id();

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            timer_id,
        })
    }

    /// Schedule a one-shot task to be posted after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> Result<ScheduledTaskId, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Schedule a task to be posted at a specific instant.
    ///
    /// If the instant is in the past, the task is posted on the timer
    /// thread's next wakeup.
    pub fn schedule_at<F>(&self, instant: Instant, task: F) -> Result<ScheduledTaskId, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(SchedulerError::ShutDown);
        }

        let id = state.tasks.insert(Box::new(task));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(DeadlineEntry {
            id,
            run_at: instant,
            seq,
        });
        drop(state);

        self.shared.wakeup.notify_one();
        Ok(id)
    }

    /// Cancel a scheduled task that has not fired yet.
    pub fn cancel(&self, id: ScheduledTaskId) -> Result<(), SchedulerError> {
        let removed = self.shared.state.lock().tasks.remove(id);
        match removed {
            Some(task) => {
                // Dropping the closure may release captured state; do it unlocked.
                drop(task);
                Ok(())
            }
            None => Err(SchedulerError::InvalidTaskId),
        }
    }

    /// Check if a scheduled task is still waiting to fire.
    pub fn is_active(&self, id: ScheduledTaskId) -> bool {
        self.shared.state.lock().tasks.contains_key(id)
    }

    /// Get the number of tasks waiting to fire.
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Get the duration until the next task fires, if any.
    pub fn time_until_next(&self) -> Option<Duration> {
        let mut state = self.shared.state.lock();
        state.skip_stale();
        state
            .queue
            .peek()
            .map(|entry| entry.run_at.saturating_duration_since(Instant::now()))
    }

    /// Stop the timer thread and drop all pending tasks.
    pub fn shutdown(&self) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.queue.clear();
            std::mem::take(&mut state.tasks)
        };
        self.shared.wakeup.notify_all();
        drop(pending);

        if thread::current().id() != self.timer_id {
            if let Some(handle) = self.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("active", &self.active_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(DelayScheduler: Send, Sync);

fn timer_loop(shared: &TimerShared, target: &dyn Executor) {
    loop {
        let due = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                state.skip_stale();
                let now = Instant::now();
                match state.queue.peek().map(|entry| entry.run_at) {
                    Some(run_at) if run_at <= now => break state.take_due(now),
                    Some(run_at) => {
                        shared.wakeup.wait_until(&mut state, run_at);
                    }
                    None => shared.wakeup.wait(&mut state),
                }
            }
        };

        for (id, task) in due {
            tracing::trace!(target: targets::SCHEDULER, ?id, "posting due task");
            target.execute(task);
        }
    }
}
