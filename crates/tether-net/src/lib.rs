//! Callback bridging for asynchronous HTTP engines.
//!
//! An asynchronous engine reports progress by invoking callbacks on its own
//! threads. This crate funnels every such callback through a
//! [`tether_core::TaskExecutor`], so request logic runs on a single worker
//! thread in arrival order:
//!
//! - [`RequestBridge`]: the application-facing object. Starts, cancels and
//!   destroys requests and dispatches finished events to listeners.
//! - [`CallbackSink`]: handed to the [`Engine`]; each method posts one task.
//! - [`RequestLifecycle`]: per-request state machine that follows redirects,
//!   streams the body through a reused [`ReadBuffer`] and records exactly
//!   one terminal outcome.
//! - [`CorrelationRegistry`] and [`MetricsCorrelator`]: trace the engine's
//!   late request-finished event back to its request and report connection
//!   timings.
//! - [`sim::ScriptedEngine`]: an in-process engine replaying scripted
//!   exchanges, for tests and demos.

mod bridge;
mod config;
mod engine;
mod error;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
mod request;
pub mod sim;

pub use bridge::{
    CallbackSink, Completion, ListenerId, RequestBridge, RequestDelegate, RequestSnapshot,
    UrlRequest,
};
pub use config::{
    BridgeConfig, BridgeConfigBuilder, DEFAULT_CORRELATION_GRACE_MS, DEFAULT_MAX_REDIRECTS,
    DEFAULT_READ_BUFFER_SIZE,
};
pub use engine::Engine;
pub use error::{BridgeError, ConfigError, EngineError, LifecycleError, Result};
pub use lifecycle::{
    CancelReason, EngineCommand, LifecycleState, RequestLifecycle, RequestOutcome, RequestState,
};
pub use metrics::{
    FinishedReason, MetricsCorrelator, RequestFinishedInfo, RequestFinishedListener,
    RequestMetrics, TimingReport,
};
pub use registry::CorrelationRegistry;
pub use request::{
    ClientContext, ReadBuffer, RequestHandle, ResponseInfo, ResponseInfoHandle, UrlRequestParams,
    client_context,
};
