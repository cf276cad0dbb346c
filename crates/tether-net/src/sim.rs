//! An in-process [`Engine`] that replays scripted exchanges.
//!
//! [`ScriptedEngine`] behaves like an asynchronous HTTP engine without
//! touching the network: callbacks are delivered from a rayon thread pool,
//! and each step only happens after the bridge issued the matching command
//! (`follow_redirect` for the next hop, `read` for the next body chunk).
//! Once a request reaches its terminal callback, a request-finished event
//! with synthetic timings is sent to every registered finished sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, LOCATION};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tether_core::logging::targets;

use crate::bridge::CallbackSink;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::metrics::{FinishedReason, RequestFinishedInfo, RequestMetrics, now_millis};
use crate::request::{ReadBuffer, RequestHandle, ResponseInfo, ResponseInfoHandle, UrlRequestParams};

/// Error code reported for URLs with no scripted exchange.
pub const ERR_NAME_NOT_RESOLVED: i32 = -105;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishedDelivery {
    Immediate,
    /// Kept until [`ScriptedEngine::release_finished`].
    Held,
}

#[derive(Debug, Clone)]
enum FailurePoint {
    BeforeResponse,
    AfterBytes(usize),
}

#[derive(Debug, Clone)]
struct Failure {
    at: FailurePoint,
    error: EngineError,
}

/// The scripted server side of one request.
#[derive(Debug, Clone)]
pub struct Exchange {
    redirects: Vec<String>,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    max_chunk: Option<usize>,
    failure: Option<Failure>,
    connect_ms: Option<i64>,
    latency: Duration,
    finished: FinishedDelivery,
}

impl Exchange {
    /// An exchange answering with `status` and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            redirects: Vec::new(),
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            max_chunk: None,
            failure: None,
            connect_ms: None,
            latency: Duration::ZERO,
            finished: FinishedDelivery::Immediate,
        }
    }

    /// A `200 OK` exchange with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK).body(body)
    }

    /// Answer with a redirect to `location` before the final response.
    /// Redirects are replayed in the order they are added.
    pub fn redirect(mut self, location: impl Into<String>) -> Self {
        self.redirects.push(location.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Deliver at most `bytes` per read, even if the buffer has more room.
    pub fn max_chunk(mut self, bytes: usize) -> Self {
        self.max_chunk = Some(bytes.max(1));
        self
    }

    /// Fail before any response metadata exists.
    pub fn fail_before_response(mut self, error: EngineError) -> Self {
        self.failure = Some(Failure {
            at: FailurePoint::BeforeResponse,
            error,
        });
        self
    }

    /// Fail on the first read after `bytes` of the body were delivered.
    pub fn fail_after(mut self, bytes: usize, error: EngineError) -> Self {
        self.failure = Some(Failure {
            at: FailurePoint::AfterBytes(bytes),
            error,
        });
        self
    }

    /// Report a connection that took `ms` to establish.
    pub fn connect_time(mut self, ms: i64) -> Self {
        self.connect_ms = Some(ms);
        self
    }

    /// Wait this long before delivering each callback.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Keep the request-finished event until
    /// [`ScriptedEngine::release_finished`] is called for the request.
    pub fn hold_finished_event(mut self) -> Self {
        self.finished = FinishedDelivery::Held;
        self
    }

    fn failure_limit(&self) -> Option<usize> {
        match self.failure {
            Some(Failure {
                at: FailurePoint::AfterBytes(limit),
                ..
            }) => Some(limit),
            _ => None,
        }
    }
}

/// A command the engine received, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    Start,
    FollowRedirect,
    Read { capacity: usize },
    Cancel,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Next step sends a redirect or the response head.
    Head,
    AwaitingFollow,
    AwaitingRead,
    Finished,
}

struct SimRequest {
    exchange: Exchange,
    sink: CallbackSink,
    url: String,
    url_chain: Vec<String>,
    redirects_sent: usize,
    body_offset: usize,
    info: Option<ResponseInfo>,
    phase: Phase,
    started_at: i64,
    response_at: Option<i64>,
}

enum Step {
    Head,
    Read(ReadBuffer),
    Cancel,
}

struct FinishedEvent {
    info: RequestFinishedInfo,
    response: Option<ResponseInfo>,
    error: Option<EngineError>,
}

struct SimShared {
    pool: rayon::ThreadPool,
    scripts: Mutex<HashMap<String, Exchange>>,
    requests: Mutex<HashMap<RequestHandle, SimRequest>>,
    finished_sinks: Mutex<Vec<CallbackSink>>,
    held_finished: Mutex<HashMap<RequestHandle, FinishedEvent>>,
    commands: Mutex<Vec<(RequestHandle, SimCommand)>>,
    next_response: AtomicU64,
}

/// An [`Engine`] that replays [`Exchange`]s registered by URL.
///
/// Requests for URLs without a script fail with [`ERR_NAME_NOT_RESOLVED`]
/// before any response arrives.
pub struct ScriptedEngine {
    shared: Arc<SimShared>,
}

impl ScriptedEngine {
    /// Create an engine delivering callbacks from `threads` pool threads.
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("sim-engine-{index}"))
            .build()?;
        Ok(Self {
            shared: Arc::new(SimShared {
                pool,
                scripts: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                finished_sinks: Mutex::new(Vec::new()),
                held_finished: Mutex::new(HashMap::new()),
                commands: Mutex::new(Vec::new()),
                next_response: AtomicU64::new(1),
            }),
        })
    }

    /// Serve `exchange` for requests to `url`.
    pub fn script(&self, url: impl Into<String>, exchange: Exchange) {
        let url = url.into();
        let key = url::Url::parse(&url).map_or(url, String::from);
        self.shared.scripts.lock().insert(key, exchange);
    }

    /// Commands received for `request`, in order.
    pub fn commands(&self, request: RequestHandle) -> Vec<SimCommand> {
        self.shared
            .commands
            .lock()
            .iter()
            .filter(|(handle, _)| *handle == request)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Number of requests started and not yet destroyed.
    pub fn live_requests(&self) -> usize {
        self.shared.requests.lock().len()
    }

    /// Send the held request-finished event for `request`, returning
    /// whether one was pending.
    pub fn release_finished(&self, request: RequestHandle) -> bool {
        let Some(held) = self.shared.held_finished.lock().remove(&request) else {
            return false;
        };
        self.shared.deliver_finished(held);
        true
    }

    fn record(&self, request: RequestHandle, command: SimCommand) {
        tracing::trace!(target: targets::SIM, %request, ?command, "engine command");
        self.shared.commands.lock().push((request, command));
    }

    fn spawn(&self, request: RequestHandle, step: Step) {
        let shared = self.shared.clone();
        self.shared.pool.spawn(move || shared.run_step(request, step));
    }

    /// Move a request from `expected` back to [`Phase::Head`] or keep it,
    /// returning whether the command was valid.
    fn accept(&self, request: RequestHandle, expected: Phase, next: Phase) -> bool {
        let mut requests = self.shared.requests.lock();
        match requests.get_mut(&request) {
            Some(sim) if sim.phase == expected => {
                sim.phase = next;
                true
            }
            Some(sim) => {
                tracing::warn!(target: targets::SIM, %request, phase = ?sim.phase, "command ignored in current phase");
                false
            }
            None => false,
        }
    }
}

impl Engine for ScriptedEngine {
    fn start(
        &self,
        request: RequestHandle,
        params: &UrlRequestParams,
        callbacks: CallbackSink,
    ) -> Result<(), EngineError> {
        self.record(request, SimCommand::Start);
        let url = params.url.to_string();
        let exchange = self.shared.scripts.lock().get(&url).cloned().unwrap_or_else(|| {
            Exchange::new(StatusCode::OK).fail_before_response(EngineError::new(
                ERR_NAME_NOT_RESOLVED,
                "net::ERR_NAME_NOT_RESOLVED",
            ))
        });

        {
            let mut requests = self.shared.requests.lock();
            if requests.contains_key(&request) {
                return Err(EngineError::new(-1, format!("{request} already started")));
            }
            requests.insert(
                request,
                SimRequest {
                    exchange,
                    sink: callbacks,
                    url_chain: vec![url.clone()],
                    url,
                    redirects_sent: 0,
                    body_offset: 0,
                    info: None,
                    phase: Phase::Head,
                    started_at: now_millis(),
                    response_at: None,
                },
            );
        }

        self.spawn(request, Step::Head);
        Ok(())
    }

    fn follow_redirect(&self, request: RequestHandle) {
        self.record(request, SimCommand::FollowRedirect);
        if self.accept(request, Phase::AwaitingFollow, Phase::Head) {
            self.spawn(request, Step::Head);
        }
    }

    fn read(&self, request: RequestHandle, buffer: ReadBuffer) {
        self.record(
            request,
            SimCommand::Read {
                capacity: buffer.capacity(),
            },
        );
        if self.accept(request, Phase::AwaitingRead, Phase::AwaitingRead) {
            self.spawn(request, Step::Read(buffer));
        }
    }

    fn cancel(&self, request: RequestHandle) {
        self.record(request, SimCommand::Cancel);
        self.spawn(request, Step::Cancel);
    }

    fn destroy(&self, request: RequestHandle) {
        self.record(request, SimCommand::Destroy);
        self.shared.requests.lock().remove(&request);
    }

    fn add_request_finished_listener(&self, callbacks: CallbackSink) {
        let mut sinks = self.shared.finished_sinks.lock();
        sinks.retain(CallbackSink::is_connected);
        sinks.push(callbacks);
    }
}

impl SimShared {
    fn run_step(&self, request: RequestHandle, step: Step) {
        let latency = match self.requests.lock().get(&request) {
            Some(sim) => sim.exchange.latency,
            None => return,
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        // Callbacks are delivered with the lock held so that a concurrent
        // cancel cannot overtake a step that already decided what to send.
        let mut requests = self.requests.lock();
        let Some(sim) = requests.get_mut(&request) else {
            return;
        };
        if sim.phase == Phase::Finished {
            return;
        }
        match step {
            Step::Head => self.head(request, sim),
            Step::Read(buffer) => self.read(request, sim, buffer),
            Step::Cancel => {
                sim.phase = Phase::Finished;
                sim.sink.on_canceled(request, sim.info.clone());
                self.finished(request, sim, FinishedReason::Canceled, None);
            }
        }
    }

    fn head(&self, request: RequestHandle, sim: &mut SimRequest) {
        if let Some(Failure {
            at: FailurePoint::BeforeResponse,
            error,
        }) = sim.exchange.failure.clone()
        {
            sim.phase = Phase::Finished;
            sim.sink.on_failed(request, None, error.clone());
            self.finished(request, sim, FinishedReason::Failed, Some(error));
            return;
        }

        if let Some(location) = sim.exchange.redirects.get(sim.redirects_sent).cloned() {
            let mut info = self.response_info(sim, StatusCode::FOUND);
            if let Ok(value) = HeaderValue::from_str(&location) {
                info.headers.insert(LOCATION, value);
            }
            sim.redirects_sent += 1;
            sim.phase = Phase::AwaitingFollow;
            sim.info = Some(info.clone());
            sim.url = location.clone();
            sim.url_chain.push(location.clone());
            sim.sink.on_redirect_received(request, info, location);
            return;
        }

        let mut info = self.response_info(sim, sim.exchange.status);
        info.headers = sim.exchange.headers.clone();
        sim.response_at = Some(now_millis());
        sim.phase = Phase::AwaitingRead;
        sim.info = Some(info.clone());
        sim.sink.on_response_started(request, info);
    }

    fn read(&self, request: RequestHandle, sim: &mut SimRequest, mut buffer: ReadBuffer) {
        let Some(info) = sim.info.clone() else {
            return;
        };

        let limit = sim.exchange.failure_limit();
        if let Some(limit) = limit {
            if sim.body_offset >= limit {
                let error = sim
                    .exchange
                    .failure
                    .as_ref()
                    .map(|failure| failure.error.clone())
                    .unwrap_or_else(|| EngineError::new(-2, "net::ERR_FAILED"));
                sim.phase = Phase::Finished;
                sim.sink.on_failed(request, Some(info), error.clone());
                self.finished(request, sim, FinishedReason::Failed, Some(error));
                return;
            }
        }

        let body = &sim.exchange.body;
        let end = limit.map_or(body.len(), |limit| limit.min(body.len()));
        let mut chunk = &body[sim.body_offset.min(end)..end];
        if let Some(max_chunk) = sim.exchange.max_chunk {
            chunk = &chunk[..chunk.len().min(max_chunk)];
        }
        let n = buffer.fill_from(chunk);
        sim.body_offset += n;

        sim.sink.on_read_completed(request, info.clone(), buffer, n);
        if n == 0 {
            sim.phase = Phase::Finished;
            sim.sink.on_succeeded(request, info);
            self.finished(request, sim, FinishedReason::Succeeded, None);
        }
    }

    fn response_info(&self, sim: &SimRequest, status: StatusCode) -> ResponseInfo {
        let handle =
            ResponseInfoHandle::from_raw(self.next_response.fetch_add(1, Ordering::Relaxed));
        let mut info = ResponseInfo::new(handle, sim.url.clone(), status);
        info.url_chain = sim.url_chain.clone();
        info
    }

    fn finished(
        &self,
        request: RequestHandle,
        sim: &SimRequest,
        reason: FinishedReason,
        error: Option<EngineError>,
    ) {
        let connect_start = sim.exchange.connect_ms.map(|_| sim.started_at);
        let metrics = RequestMetrics {
            request_start: Some(sim.started_at),
            dns_start: connect_start,
            dns_end: connect_start,
            connect_start,
            connect_end: sim.exchange.connect_ms.map(|ms| sim.started_at + ms),
            response_start: sim.response_at,
            request_end: Some(now_millis()),
            socket_reused: sim.exchange.connect_ms.is_none(),
            received_byte_count: sim.body_offset as u64,
            ..Default::default()
        };

        let event = FinishedEvent {
            info: RequestFinishedInfo {
                metrics: Some(metrics),
                reason,
            },
            response: sim.info.clone(),
            error,
        };
        if sim.exchange.finished == FinishedDelivery::Held {
            self.held_finished.lock().insert(request, event);
        } else {
            self.deliver_finished(event);
        }
    }

    fn deliver_finished(&self, event: FinishedEvent) {
        for sink in self.finished_sinks.lock().iter() {
            sink.on_request_finished(event.info.clone(), event.response.clone(), event.error.clone());
        }
    }
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("scripts", &self.shared.scripts.lock().len())
            .field("live_requests", &self.live_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_builder() {
        let exchange = Exchange::ok(&b"abc"[..])
            .redirect("http://a/2")
            .redirect("http://a/3")
            .max_chunk(0)
            .connect_time(12)
            .fail_after(2, EngineError::new(-101, "reset"));

        assert_eq!(exchange.redirects, vec!["http://a/2", "http://a/3"]);
        assert_eq!(exchange.max_chunk, Some(1));
        assert_eq!(exchange.failure_limit(), Some(2));
        assert_eq!(exchange.connect_ms, Some(12));
        assert_eq!(exchange.finished, FinishedDelivery::Immediate);
        assert_eq!(
            exchange.hold_finished_event().finished,
            FinishedDelivery::Held
        );
    }

    #[test]
    fn test_commands_in_wrong_phase_are_ignored() {
        let engine = ScriptedEngine::new(1).unwrap();
        let request = RequestHandle::next();
        engine.follow_redirect(request);
        engine.read(request, ReadBuffer::with_capacity(8));

        assert_eq!(
            engine.commands(request),
            vec![SimCommand::FollowRedirect, SimCommand::Read { capacity: 8 }]
        );
        assert_eq!(engine.live_requests(), 0);
        assert!(!engine.release_finished(request));
    }
}
