//! The request bridge.
//!
//! A [`RequestBridge`] connects an [`Engine`] that calls back from arbitrary
//! threads to request logic that must run single-threaded. Every inbound
//! callback goes through a [`CallbackSink`], which only posts a task to the
//! bridge's [`TaskExecutor`]. All request state, the correlation registry and
//! the finished listeners are therefore touched from one worker thread, in
//! the order the callbacks arrived.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_net::sim::{Exchange, ScriptedEngine};
//! use tether_net::{BridgeConfig, RequestBridge, UrlRequestParams, client_context};
//!
//! let engine = Arc::new(ScriptedEngine::new(2)?);
//! engine.script("https://example.com/", Exchange::ok(b"hello".to_vec()));
//!
//! let bridge = RequestBridge::new(BridgeConfig::default(), engine)?;
//! bridge.add_finished_listener(Arc::new(|_: &tether_net::ClientContext, connect_ms: u64| {
//!     println!("connected in {connect_ms} ms");
//! }));
//!
//! let request = bridge.start(UrlRequestParams::get("https://example.com/")?, client_context(()))?;
//! if let Some(completion) = request.wait() {
//!     println!("{:?}: {} bytes", completion.outcome, completion.body.len());
//! }
//! bridge.destroy(request.handle())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use http::StatusCode;
use parking_lot::{Mutex, MutexGuard};
use tether_core::logging::targets;
use tether_core::{DelayScheduler, ScheduledTaskId, TaskExecutor};

use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::error::{BridgeError, EngineError, LifecycleError, Result};
use crate::lifecycle::{CancelReason, EngineCommand, LifecycleState, RequestLifecycle, RequestOutcome};
use crate::metrics::{MetricsCorrelator, RequestFinishedInfo, RequestFinishedListener};
use crate::registry::CorrelationRegistry;
use crate::request::{
    ClientContext, ReadBuffer, RequestHandle, ResponseInfo, UrlRequestParams,
};

/// Per-request progress notifications.
///
/// Methods run on the bridge's worker thread. They may call back into the
/// bridge.
pub trait RequestDelegate: Send {
    /// A redirect was received. `redirect_count` includes this one.
    fn on_redirect(&mut self, _redirect_count: u32, _new_location: &str) {}

    /// The final response head arrived.
    fn on_response_started(&mut self, _info: &ResponseInfo) {}

    /// The request reached its terminal state.
    fn on_completed(&mut self, _completion: &Completion) {}
}

/// Everything known about a request once it has completed.
#[derive(Debug, Clone)]
pub struct Completion {
    pub request: RequestHandle,
    pub outcome: RequestOutcome,
    pub redirect_count: u32,
    /// The body received before the terminal callback, even on failure.
    pub body: Bytes,
    pub client_context: ClientContext,
}

/// Application handle for a started request.
#[derive(Debug)]
pub struct UrlRequest {
    handle: RequestHandle,
    completion: Receiver<Completion>,
}

impl UrlRequest {
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Block until the request completes.
    ///
    /// Returns `None` if the request was destroyed or the bridge shut down
    /// before it completed.
    pub fn wait(&self) -> Option<Completion> {
        self.completion.recv().ok()
    }

    /// Block until the request completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        match self.completion.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Return the completion if it is already available.
    pub fn try_completion(&self) -> Option<Completion> {
        self.completion.try_recv().ok()
    }
}

/// Identifies a registered finished listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Point-in-time view of a request, taken on the worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub state: LifecycleState,
    pub redirect_count: u32,
    /// Last redirect target, or the URL of the final response.
    pub final_url: Option<String>,
    /// Status of the final response, once its head has arrived.
    pub status: Option<StatusCode>,
    pub body_len: usize,
    pub outcome: Option<RequestOutcome>,
}

/// The engine-facing side of a bridge.
///
/// Each method corresponds to one engine callback and does nothing except
/// post a task to the bridge's executor, so it is safe to call from any
/// thread and never blocks on request logic. Once the bridge is gone, calls
/// are ignored.
#[derive(Clone)]
pub struct CallbackSink {
    bridge: Weak<BridgeInner>,
}

impl CallbackSink {
    /// Check whether the bridge behind this sink still exists.
    pub fn is_connected(&self) -> bool {
        self.bridge.strong_count() > 0
    }

    pub fn on_redirect_received(
        &self,
        request: RequestHandle,
        info: ResponseInfo,
        new_location: String,
    ) {
        self.post("redirect received", move |bridge| {
            bridge.handle_redirect(request, info, new_location)
        });
    }

    pub fn on_response_started(&self, request: RequestHandle, info: ResponseInfo) {
        self.post("response started", move |bridge| {
            bridge.handle_response_started(request, info)
        });
    }

    pub fn on_read_completed(
        &self,
        request: RequestHandle,
        info: ResponseInfo,
        buffer: ReadBuffer,
        bytes_read: usize,
    ) {
        self.post("read completed", move |bridge| {
            bridge.handle_read_completed(request, info, buffer, bytes_read)
        });
    }

    pub fn on_succeeded(&self, request: RequestHandle, info: ResponseInfo) {
        self.post("succeeded", move |bridge| {
            bridge.finish(request, Some(&info), "succeeded", |lifecycle| {
                lifecycle.on_succeeded(&info).cloned()
            })
        });
    }

    pub fn on_failed(&self, request: RequestHandle, info: Option<ResponseInfo>, error: EngineError) {
        self.post("failed", move |bridge| {
            bridge.finish(request, info.as_ref(), "failed", |lifecycle| {
                lifecycle.on_failed(&error).cloned()
            })
        });
    }

    pub fn on_canceled(&self, request: RequestHandle, info: Option<ResponseInfo>) {
        self.post("canceled", move |bridge| {
            bridge.finish(request, info.as_ref(), "canceled", |lifecycle| {
                lifecycle.on_canceled().cloned()
            })
        });
    }

    /// The engine's request-finished event.
    pub fn on_request_finished(
        &self,
        finished: RequestFinishedInfo,
        info: Option<ResponseInfo>,
        error: Option<EngineError>,
    ) {
        self.post("request finished", move |bridge| {
            bridge.handle_finished(finished, info, error)
        });
    }

    fn post<F>(&self, event: &'static str, handler: F)
    where
        F: FnOnce(&Arc<BridgeInner>) + Send + 'static,
    {
        let Some(inner) = self.bridge.upgrade() else {
            tracing::trace!(target: targets::BRIDGE, event, "bridge dropped; ignoring callback");
            return;
        };
        let bridge = self.bridge.clone();
        let posted = inner.executor.post_task(move || {
            if let Some(inner) = bridge.upgrade() {
                handler(&inner);
            }
        });
        if let Err(err) = posted {
            tracing::debug!(target: targets::BRIDGE, event, %err, "dropping callback");
        }
    }
}

impl fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct RequestEntry {
    lifecycle: RequestLifecycle,
    completion: Option<Sender<Completion>>,
    delegate: Option<Box<dyn RequestDelegate>>,
    timeout: Option<ScheduledTaskId>,
}

/// State only touched from tasks on the bridge's executor.
struct BridgeState {
    requests: HashMap<RequestHandle, RequestEntry>,
    registry: CorrelationRegistry,
}

struct BridgeInner {
    // Declared first so the timer thread is joined before the executor.
    scheduler: DelayScheduler,
    executor: Arc<TaskExecutor>,
    engine: Arc<dyn Engine>,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn RequestFinishedListener>)>>,
    next_listener: AtomicU64,
}

impl BridgeInner {
    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        debug_assert!(
            self.executor.is_worker_thread(),
            "bridge state accessed off the worker thread"
        );
        self.state.lock()
    }

    fn sink(self: &Arc<Self>) -> CallbackSink {
        CallbackSink {
            bridge: Arc::downgrade(self),
        }
    }

    fn handle_start(
        self: &Arc<Self>,
        params: UrlRequestParams,
        mut entry: RequestEntry,
    ) {
        let request = entry.lifecycle.handle();
        if let Err(err) = entry.lifecycle.start() {
            tracing::warn!(target: targets::BRIDGE, %request, %err, "cannot start request");
            return;
        }
        entry.timeout = self.arm_timeout(request);
        self.lock_state().requests.insert(request, entry);

        tracing::debug!(target: targets::BRIDGE, %request, url = %params.url, "starting request");
        if let Err(error) = self.engine.start(request, &params, self.sink()) {
            tracing::warn!(target: targets::BRIDGE, %request, %error, "engine refused request");
            self.finish(request, None, "start failed", |lifecycle| {
                lifecycle.on_failed(&error).cloned()
            });
        }
    }

    fn arm_timeout(self: &Arc<Self>, request: RequestHandle) -> Option<ScheduledTaskId> {
        let timeout = self.config.request_timeout()?;
        let bridge = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule_once(timeout, move || {
            if let Some(inner) = bridge.upgrade() {
                tracing::debug!(target: targets::BRIDGE, %request, "request timed out");
                inner.handle_cancel(request, CancelReason::Timeout);
            }
        });
        match scheduled {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(target: targets::BRIDGE, %request, %err, "cannot arm request timeout");
                None
            }
        }
    }

    fn handle_redirect(&self, request: RequestHandle, info: ResponseInfo, new_location: String) {
        let (command, redirect_count) = {
            let mut state = self.lock_state();
            let BridgeState { requests, registry } = &mut *state;
            let Some(entry) = requests.get_mut(&request) else {
                tracing::trace!(target: targets::BRIDGE, %request, "redirect for unknown request");
                return;
            };
            registry.record(info.handle, request);
            match entry.lifecycle.on_redirect(&new_location) {
                Ok(command) => (command, entry.lifecycle.request_state().redirect_count()),
                Err(err) => {
                    log_ignored(request, &err);
                    return;
                }
            }
        };

        tracing::debug!(target: targets::BRIDGE, %request, redirect_count, location = %new_location, "redirect received");
        self.notify(request, |delegate| {
            delegate.on_redirect(redirect_count, &new_location)
        });
        self.issue(request, command);
    }

    fn handle_response_started(&self, request: RequestHandle, info: ResponseInfo) {
        let command = {
            let mut state = self.lock_state();
            let BridgeState { requests, registry } = &mut *state;
            let Some(entry) = requests.get_mut(&request) else {
                tracing::trace!(target: targets::BRIDGE, %request, "response for unknown request");
                return;
            };
            registry.record(info.handle, request);
            match entry.lifecycle.on_response_started(&info) {
                Ok(command) => command,
                Err(err) => {
                    log_ignored(request, &err);
                    return;
                }
            }
        };

        tracing::debug!(target: targets::BRIDGE, %request, status = %info.status, "response started");
        self.notify(request, |delegate| delegate.on_response_started(&info));
        self.issue(request, command);
    }

    fn handle_read_completed(
        &self,
        request: RequestHandle,
        info: ResponseInfo,
        buffer: ReadBuffer,
        bytes_read: usize,
    ) {
        let command = {
            let mut state = self.lock_state();
            let BridgeState { requests, registry } = &mut *state;
            let Some(entry) = requests.get_mut(&request) else {
                tracing::trace!(target: targets::BRIDGE, %request, "read for unknown request");
                return;
            };
            registry.record(info.handle, request);
            match entry.lifecycle.on_read_completed(buffer, bytes_read) {
                Ok(command) => command,
                Err(err) => {
                    log_ignored(request, &err);
                    return;
                }
            }
        };

        tracing::trace!(target: targets::BRIDGE, %request, bytes_read, "read completed");
        self.issue(request, command);
    }

    fn handle_cancel(&self, request: RequestHandle, reason: CancelReason) {
        let command = match self.lock_state().requests.get_mut(&request) {
            Some(entry) => entry.lifecycle.request_cancel(reason),
            None => {
                tracing::trace!(target: targets::BRIDGE, %request, "cancel for unknown request");
                return;
            }
        };
        if matches!(command, EngineCommand::Cancel) {
            tracing::debug!(target: targets::BRIDGE, %request, %reason, "cancelling request");
        }
        self.issue(request, command);
    }

    /// Apply a terminal callback, then hand the completion to the application.
    fn finish<F>(
        self: &Arc<Self>,
        request: RequestHandle,
        info: Option<&ResponseInfo>,
        event: &'static str,
        complete: F,
    ) where
        F: FnOnce(&mut RequestLifecycle) -> std::result::Result<RequestOutcome, LifecycleError>,
    {
        let now = Instant::now();
        let (completion, sender, delegate, timeout) = {
            let mut state = self.lock_state();
            let BridgeState { requests, registry } = &mut *state;
            let Some(entry) = requests.get_mut(&request) else {
                tracing::trace!(target: targets::BRIDGE, %request, event, "terminal callback for unknown request");
                return;
            };
            if let Some(info) = info {
                registry.record(info.handle, request);
            }
            let outcome = match complete(&mut entry.lifecycle) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log_ignored(request, &err);
                    return;
                }
            };
            registry.retire_request(request, now);

            let data = entry.lifecycle.request_state();
            let completion = Completion {
                request,
                outcome,
                redirect_count: data.redirect_count(),
                body: data.body_bytes(),
                client_context: data.client_context().clone(),
            };
            (
                completion,
                entry.completion.take(),
                entry.delegate.take(),
                entry.timeout.take(),
            )
        };

        if let Some(id) = timeout {
            let _ = self.scheduler.cancel(id);
        }
        self.schedule_purge();

        tracing::debug!(target: targets::BRIDGE, %request, outcome = ?completion.outcome, "request completed");
        if let Some(mut delegate) = delegate {
            delegate.on_completed(&completion);
        }
        if let Some(sender) = sender {
            let _ = sender.send(completion);
        }
    }

    fn handle_finished(
        &self,
        finished: RequestFinishedInfo,
        info: Option<ResponseInfo>,
        error: Option<EngineError>,
    ) {
        let (finish, context) = {
            let mut state = self.lock_state();
            state.registry.purge_expired(Instant::now());
            let response = info.as_ref().map(|info| info.handle);
            let Some(finish) = MetricsCorrelator::correlate(&state.registry, &finished, response)
            else {
                tracing::trace!(target: targets::METRICS, ?response, "finished event for unknown response");
                return;
            };
            let Some(entry) = state.requests.get(&finish.request) else {
                tracing::trace!(target: targets::METRICS, request = %finish.request, "finished event after destroy");
                return;
            };
            (finish, entry.lifecycle.request_state().client_context().clone())
        };

        if let Some(error) = &error {
            tracing::debug!(target: targets::METRICS, request = %finish.request, %error, "request finished with error");
        }
        tracing::debug!(
            target: targets::METRICS,
            request = %finish.request,
            reason = ?finish.reason,
            connect_elapsed_ms = finish.connect_elapsed_ms,
            "request finished"
        );

        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_request_finished(&context, finish.connect_elapsed_ms);
            listener.on_timing_report(&context, &finish.report);
        }
    }

    fn handle_destroy(&self, request: RequestHandle) {
        let entry = {
            let mut state = self.lock_state();
            let entry = state.requests.remove(&request);
            if entry.is_some() {
                state.registry.retire_request(request, Instant::now());
            }
            entry
        };
        let Some(entry) = entry else {
            tracing::trace!(target: targets::BRIDGE, %request, "destroy for unknown request");
            return;
        };

        if let Some(id) = entry.timeout {
            let _ = self.scheduler.cancel(id);
        }
        if !entry.lifecycle.is_completed() {
            self.engine.cancel(request);
        }
        self.engine.destroy(request);
        tracing::debug!(target: targets::BRIDGE, %request, "request destroyed");
    }

    /// Drop expired correlation entries once the grace period has passed.
    fn schedule_purge(self: &Arc<Self>) {
        let bridge = Arc::downgrade(self);
        let scheduled = self
            .scheduler
            .schedule_once(self.config.correlation_grace(), move || {
                if let Some(inner) = bridge.upgrade() {
                    let purged = inner.lock_state().registry.purge_expired(Instant::now());
                    tracing::trace!(target: targets::METRICS, purged, "purged correlation entries");
                }
            });
        if let Err(err) = scheduled {
            tracing::debug!(target: targets::BRIDGE, %err, "cannot schedule correlation purge");
        }
    }

    /// Run a delegate callback without holding the state lock.
    fn notify<F>(&self, request: RequestHandle, f: F)
    where
        F: FnOnce(&mut dyn RequestDelegate),
    {
        let taken = self
            .lock_state()
            .requests
            .get_mut(&request)
            .and_then(|entry| entry.delegate.take());
        let Some(mut delegate) = taken else {
            return;
        };
        f(delegate.as_mut());
        if let Some(entry) = self.lock_state().requests.get_mut(&request) {
            entry.delegate = Some(delegate);
        }
    }

    fn issue(&self, request: RequestHandle, command: EngineCommand) {
        match command {
            EngineCommand::None => {}
            EngineCommand::FollowRedirect => self.engine.follow_redirect(request),
            EngineCommand::Read(buffer) => self.engine.read(request, buffer),
            EngineCommand::Cancel => self.engine.cancel(request),
        }
    }
}

fn log_ignored(request: RequestHandle, err: &LifecycleError) {
    tracing::warn!(target: targets::LIFECYCLE, %request, %err, "ignoring engine callback");
}

/// Connects an [`Engine`] to single-threaded request handling.
///
/// Cloning is cheap; clones share the same executor and state. The worker
/// and timer threads stop when the last clone is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct RequestBridge {
    inner: Arc<BridgeInner>,
}

impl RequestBridge {
    /// Create a bridge and register it for the engine's finished events.
    pub fn new(config: BridgeConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        config.validate()?;

        let executor = Arc::new(
            TaskExecutor::builder()
                .name(config.executor_name.clone())
                .build()?,
        );
        let scheduler =
            DelayScheduler::new(format!("{}-timer", config.executor_name), executor.clone())?;
        let registry = CorrelationRegistry::new(config.correlation_grace());

        let inner = Arc::new(BridgeInner {
            scheduler,
            executor,
            engine,
            config,
            state: Mutex::new(BridgeState {
                requests: HashMap::new(),
                registry,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        });
        inner.engine.add_request_finished_listener(inner.sink());

        tracing::debug!(target: targets::BRIDGE, executor = %inner.config.executor_name, "bridge created");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// The executor all request logic runs on.
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.inner.executor
    }

    /// Start a request.
    ///
    /// The request is registered and handed to the engine on the worker
    /// thread; this call only posts that work.
    pub fn start(&self, params: UrlRequestParams, client_context: ClientContext) -> Result<UrlRequest> {
        self.start_request(params, client_context, None)
    }

    /// Start a request and report its progress to `delegate`.
    pub fn start_with_delegate(
        &self,
        params: UrlRequestParams,
        client_context: ClientContext,
        delegate: Box<dyn RequestDelegate>,
    ) -> Result<UrlRequest> {
        self.start_request(params, client_context, Some(delegate))
    }

    #[tracing::instrument(
        level = "trace",
        target = "tether_net::bridge",
        skip_all,
        fields(url = %params.url)
    )]
    fn start_request(
        &self,
        params: UrlRequestParams,
        client_context: ClientContext,
        delegate: Option<Box<dyn RequestDelegate>>,
    ) -> Result<UrlRequest> {
        let handle = RequestHandle::next();
        let (sender, receiver) = bounded(1);
        let entry = RequestEntry {
            lifecycle: RequestLifecycle::from_config(handle, client_context, &self.inner.config),
            completion: Some(sender),
            delegate,
            timeout: None,
        };

        let bridge = Arc::downgrade(&self.inner);
        self.inner.executor.post_task(move || {
            if let Some(inner) = bridge.upgrade() {
                inner.handle_start(params, entry);
            }
        })?;

        Ok(UrlRequest {
            handle,
            completion: receiver,
        })
    }

    /// Ask the engine to cancel a request.
    ///
    /// The request completes with [`CancelReason::Application`] unless it
    /// reaches another terminal state first.
    pub fn cancel(&self, request: RequestHandle) -> Result<()> {
        self.post(move |inner| inner.handle_cancel(request, CancelReason::Application))
    }

    /// Release a request. An unfinished request is cancelled first.
    ///
    /// Pending [`UrlRequest::wait`] calls return `None`; finished events
    /// arriving later are dropped.
    pub fn destroy(&self, request: RequestHandle) -> Result<()> {
        self.post(move |inner| inner.handle_destroy(request))
    }

    /// The request's terminal outcome, or `None` while it is in flight.
    pub fn outcome(&self, request: RequestHandle) -> Result<Option<RequestOutcome>> {
        Ok(self.snapshot(request)?.outcome)
    }

    /// The request's current state.
    pub fn snapshot(&self, request: RequestHandle) -> Result<RequestSnapshot> {
        let inner = self.inner.clone();
        self.inner
            .executor
            .post_and_wait(move || {
                let state = inner.lock_state();
                state.requests.get(&request).map(|entry| {
                    let lifecycle = &entry.lifecycle;
                    RequestSnapshot {
                        state: lifecycle.state(),
                        redirect_count: lifecycle.request_state().redirect_count(),
                        final_url: lifecycle.final_url().map(str::to_owned),
                        status: lifecycle.status(),
                        body_len: lifecycle.request_state().body().len(),
                        outcome: lifecycle.outcome().cloned(),
                    }
                })
            })?
            .ok_or(BridgeError::UnknownRequest(request))
    }

    /// Number of requests started and not yet destroyed.
    pub fn active_requests(&self) -> Result<usize> {
        let inner = self.inner.clone();
        Ok(self
            .inner
            .executor
            .post_and_wait(move || inner.lock_state().requests.len())?)
    }

    /// Number of response handles currently held for correlation.
    pub fn correlation_entries(&self) -> Result<usize> {
        let inner = self.inner.clone();
        Ok(self
            .inner
            .executor
            .post_and_wait(move || inner.lock_state().registry.len())?)
    }

    /// Register a listener for request-finished events.
    pub fn add_finished_listener(&self, listener: Arc<dyn RequestFinishedListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, listener));
        tracing::debug!(target: targets::BRIDGE, ?id, "finished listener registered");
        id
    }

    /// Unregister a finished listener. Returns `false` if it was not registered.
    pub fn remove_finished_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.len()
    }

    /// Stop accepting work, let queued callbacks drain, and join the worker.
    ///
    /// Pending timeouts are dropped. Engine callbacks arriving afterwards are
    /// ignored.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.inner.executor.stop();
        self.inner.executor.join();
        tracing::debug!(target: targets::BRIDGE, "bridge shut down");
    }

    fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Arc<BridgeInner>) + Send + 'static,
    {
        let bridge = Arc::downgrade(&self.inner);
        self.inner.executor.post_task(move || {
            if let Some(inner) = bridge.upgrade() {
                f(&inner);
            }
        })?;
        Ok(())
    }
}

impl fmt::Debug for RequestBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBridge")
            .field("executor", &self.inner.executor)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(RequestBridge: Send, Sync);
static_assertions::assert_impl_all!(CallbackSink: Send, Sync, Clone);
