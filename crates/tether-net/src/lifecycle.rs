//! Per-request state machine.
//!
//! [`RequestLifecycle`] decides how to react to each engine callback and
//! returns the [`EngineCommand`] the bridge should issue next. It performs no
//! I/O and takes no locks, so the bridge drives it from its executor and tests
//! drive it directly.
//!
//! ```text
//! Created ──start──▶ Started ──redirect──▶ Started (follow, or cancel past the limit)
//!                       │
//!                response started ──▶ ResponseStarted ──read──▶ Reading ──read──▶ Reading
//!                                                                  │
//!        succeeded / failed / canceled from any non-terminal state ▼
//!                                      Succeeded | Failed | Canceled
//! ```

use std::fmt;

use bytes::{Bytes, BytesMut};
use http::StatusCode;

use crate::config::BridgeConfig;
use crate::error::{EngineError, LifecycleError};
use crate::request::{ClientContext, ReadBuffer, RequestHandle, ResponseInfo};

/// Position of a request in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Registered, not yet handed to the engine.
    Created,
    /// Handed to the engine; redirects may arrive.
    Started,
    /// Response head received; the first read has been issued.
    ResponseStarted,
    /// At least one read has completed.
    Reading,
    Succeeded,
    Failed,
    Canceled,
}

impl LifecycleState {
    /// Check whether no further callbacks are expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::ResponseStarted => "response-started",
            Self::Reading => "reading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// What the bridge should ask the engine to do next.
#[derive(Debug)]
pub enum EngineCommand {
    /// Nothing; wait for the next callback.
    None,
    /// Follow the pending redirect.
    FollowRedirect,
    /// Read the next chunk of the body into this buffer.
    Read(ReadBuffer),
    /// Cancel the request.
    Cancel,
}

/// Why a request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The application asked for it.
    Application,
    /// The configured request timeout elapsed.
    Timeout,
    /// The redirect limit was exceeded.
    TooManyRedirects,
    /// The engine cancelled without being asked to.
    Engine,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Application => "canceled by application",
            Self::Timeout => "request timed out",
            Self::TooManyRedirects => "too many redirects",
            Self::Engine => "canceled by engine",
        };
        f.write_str(reason)
    }
}

/// Terminal result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Succeeded {
        final_url: String,
        status: StatusCode,
        redirect_count: u32,
        body_len: usize,
    },
    Failed {
        message: String,
        code: i32,
    },
    Canceled {
        reason: CancelReason,
    },
}

impl RequestOutcome {
    /// Check whether the request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Data accumulated for one request.
pub struct RequestState {
    redirect_count: u32,
    body: BytesMut,
    client_context: ClientContext,
}

impl RequestState {
    fn new(client_context: ClientContext) -> Self {
        Self {
            redirect_count: 0,
            body: BytesMut::new(),
            client_context,
        }
    }

    /// Redirects received so far.
    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    /// Body bytes received so far, in arrival order.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Copy of the body received so far.
    pub fn body_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    /// The application context supplied at start.
    pub fn client_context(&self) -> &ClientContext {
        &self.client_context
    }
}

impl fmt::Debug for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestState")
            .field("redirect_count", &self.redirect_count)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Drives one request from start to its terminal callback.
#[derive(Debug)]
pub struct RequestLifecycle {
    handle: RequestHandle,
    state: LifecycleState,
    data: RequestState,
    max_redirects: u32,
    read_buffer_size: usize,
    final_url: Option<String>,
    status: Option<StatusCode>,
    /// Set once a cancel has been issued; later callbacks issue no commands.
    pending_cancel: Option<CancelReason>,
    outcome: Option<RequestOutcome>,
}

impl RequestLifecycle {
    /// Create a lifecycle with explicit limits.
    pub fn new(
        handle: RequestHandle,
        client_context: ClientContext,
        max_redirects: u32,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            handle,
            state: LifecycleState::Created,
            data: RequestState::new(client_context),
            max_redirects,
            read_buffer_size,
            final_url: None,
            status: None,
            pending_cancel: None,
            outcome: None,
        }
    }

    /// Create a lifecycle using the limits in `config`.
    pub fn from_config(
        handle: RequestHandle,
        client_context: ClientContext,
        config: &BridgeConfig,
    ) -> Self {
        Self::new(
            handle,
            client_context,
            config.max_redirects,
            config.read_buffer_size,
        )
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn request_state(&self) -> &RequestState {
        &self.data
    }

    /// The terminal outcome, once reached.
    pub fn outcome(&self) -> Option<&RequestOutcome> {
        self.outcome.as_ref()
    }

    /// Check whether a terminal callback has been handled.
    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Mark the request as handed to the engine.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        self.expect_state("start", &[LifecycleState::Created])?;
        self.state = LifecycleState::Started;
        Ok(())
    }

    /// Handle a redirect: follow it, or cancel once the limit is exceeded.
    pub fn on_redirect(&mut self, new_location: &str) -> Result<EngineCommand, LifecycleError> {
        self.expect_state("redirect", &[LifecycleState::Started])?;
        self.data.redirect_count += 1;
        self.final_url = Some(new_location.to_string());

        if self.pending_cancel.is_some() {
            return Ok(EngineCommand::None);
        }
        if self.data.redirect_count > self.max_redirects {
            tracing::debug!(
                target: tether_core::logging::targets::LIFECYCLE,
                request = %self.handle,
                redirects = self.data.redirect_count,
                limit = self.max_redirects,
                "redirect limit exceeded"
            );
            self.pending_cancel = Some(CancelReason::TooManyRedirects);
            return Ok(EngineCommand::Cancel);
        }
        Ok(EngineCommand::FollowRedirect)
    }

    /// Handle the response head by issuing the first read.
    pub fn on_response_started(
        &mut self,
        info: &ResponseInfo,
    ) -> Result<EngineCommand, LifecycleError> {
        self.expect_state("response started", &[LifecycleState::Started])?;
        self.state = LifecycleState::ResponseStarted;
        self.status = Some(info.status);
        self.final_url = Some(info.url.clone());

        if self.pending_cancel.is_some() {
            return Ok(EngineCommand::None);
        }
        Ok(EngineCommand::Read(ReadBuffer::with_capacity(
            self.read_buffer_size,
        )))
    }

    /// Append the bytes a read delivered and issue the next read.
    ///
    /// A zero-byte read means the body is complete; no further read is
    /// issued and the engine follows up with the terminal callback.
    pub fn on_read_completed(
        &mut self,
        mut buffer: ReadBuffer,
        bytes_read: usize,
    ) -> Result<EngineCommand, LifecycleError> {
        self.expect_state(
            "read completed",
            &[LifecycleState::ResponseStarted, LifecycleState::Reading],
        )?;
        self.state = LifecycleState::Reading;

        if bytes_read == 0 {
            return Ok(EngineCommand::None);
        }

        let filled = buffer.filled();
        if bytes_read > filled.len() {
            tracing::warn!(
                target: tether_core::logging::targets::LIFECYCLE,
                request = %self.handle,
                bytes_read,
                filled = filled.len(),
                "engine reported more bytes than it wrote"
            );
        }
        let n = bytes_read.min(filled.len());
        self.data.body.extend_from_slice(&filled[..n]);
        buffer.clear();

        if self.pending_cancel.is_some() {
            return Ok(EngineCommand::None);
        }
        Ok(EngineCommand::Read(buffer))
    }

    /// Ask for the request to be cancelled.
    ///
    /// Returns [`EngineCommand::Cancel`] the first time; later calls, and
    /// calls after completion, return [`EngineCommand::None`].
    pub fn request_cancel(&mut self, reason: CancelReason) -> EngineCommand {
        if self.is_completed() || self.pending_cancel.is_some() {
            return EngineCommand::None;
        }
        self.pending_cancel = Some(reason);
        EngineCommand::Cancel
    }

    /// Handle the success callback.
    pub fn on_succeeded(&mut self, info: &ResponseInfo) -> Result<&RequestOutcome, LifecycleError> {
        let outcome = RequestOutcome::Succeeded {
            final_url: info.url.clone(),
            status: info.status,
            redirect_count: self.data.redirect_count,
            body_len: self.data.body.len(),
        };
        self.complete("succeeded", LifecycleState::Succeeded, outcome)
    }

    /// Handle the failure callback.
    pub fn on_failed(&mut self, error: &EngineError) -> Result<&RequestOutcome, LifecycleError> {
        let outcome = RequestOutcome::Failed {
            message: error.message.clone(),
            code: error.code,
        };
        self.complete("failed", LifecycleState::Failed, outcome)
    }

    /// Handle the cancellation callback.
    pub fn on_canceled(&mut self) -> Result<&RequestOutcome, LifecycleError> {
        let reason = self.pending_cancel.unwrap_or(CancelReason::Engine);
        self.complete(
            "canceled",
            LifecycleState::Canceled,
            RequestOutcome::Canceled { reason },
        )
    }

    /// Status of the final response, once the head has arrived.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Most recent URL: the last redirect target or the final response URL.
    pub fn final_url(&self) -> Option<&str> {
        self.final_url.as_deref()
    }

    fn expect_state(
        &self,
        event: &'static str,
        allowed: &[LifecycleState],
    ) -> Result<(), LifecycleError> {
        if self.state.is_terminal() {
            return Err(LifecycleError::AlreadyCompleted { event });
        }
        if !allowed.contains(&self.state) {
            return Err(LifecycleError::UnexpectedEvent {
                state: self.state,
                event,
            });
        }
        Ok(())
    }

    fn complete(
        &mut self,
        event: &'static str,
        state: LifecycleState,
        outcome: RequestOutcome,
    ) -> Result<&RequestOutcome, LifecycleError> {
        if self.state.is_terminal() {
            return Err(LifecycleError::AlreadyCompleted { event });
        }
        tracing::debug!(
            target: tether_core::logging::targets::LIFECYCLE,
            request = %self.handle,
            from = %self.state,
            to = %state,
            "request completed"
        );
        self.state = state;
        Ok(&*self.outcome.insert(outcome))
    }
}
