//! Core systems for Tether.
//!
//! This crate provides the serialization machinery the request bridge is
//! built on:
//!
//! - **Task Queue**: an ordered FIFO of deferred closures
//! - **Task Executor**: one dedicated worker thread that runs posted tasks
//!   strictly one at a time, in arrival order, with per-task panic isolation
//! - **Delay Scheduler**: a timer thread that posts closures to an executor
//!   once their deadline passes
//! - **Logging**: `tracing` targets and helper macros shared by all crates
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::thread;
//! use tether_core::TaskExecutor;
//!
//! let executor = Arc::new(TaskExecutor::new()?);
//!
//! // Producers on any thread...
//! let handles: Vec<_> = (0..4)
//!     .map(|producer| {
//!         let executor = executor.clone();
//!         thread::spawn(move || {
//!             for i in 0..10 {
//!                 let _ = executor.post_task(move || {
//!                     // ...consumed one at a time on the worker thread.
//!                     println!("producer {producer} item {i}");
//!                 });
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! executor.stop_and_join();
//! # Ok::<(), tether_core::ExecutorError>(())
//! ```

mod error;
pub mod executor;
pub mod logging;
pub mod scheduler;
pub mod task;

pub use error::{ExecutorError, Result, SchedulerError};
pub use executor::{Executor, ExecutorBuilder, ExecutorConfig, ExecutorState, TaskExecutor};
pub use scheduler::{DelayScheduler, ScheduledTaskId};
pub use task::{Task, TaskId, TaskQueue};
