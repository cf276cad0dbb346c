//! The seam between the bridge and an asynchronous HTTP engine.

use crate::bridge::CallbackSink;
use crate::error::EngineError;
use crate::request::{ReadBuffer, RequestHandle, UrlRequestParams};

/// An asynchronous HTTP engine.
///
/// Commands return immediately; results arrive later through the
/// [`CallbackSink`] passed to [`start`](Engine::start), on whatever thread
/// the engine uses. For each request the engine delivers callbacks in order:
/// zero or more redirects (each answered by
/// [`follow_redirect`](Engine::follow_redirect) or [`cancel`](Engine::cancel)),
/// then the response head, then one read-completed per
/// [`read`](Engine::read), then exactly one terminal callback. Once the
/// request has finished, the engine reports its metrics to every sink
/// registered with
/// [`add_request_finished_listener`](Engine::add_request_finished_listener).
pub trait Engine: Send + Sync {
    /// Begin the request. An error means no callback will ever follow.
    fn start(
        &self,
        request: RequestHandle,
        params: &UrlRequestParams,
        callbacks: CallbackSink,
    ) -> Result<(), EngineError>;

    /// Follow the redirect most recently reported for `request`.
    fn follow_redirect(&self, request: RequestHandle);

    /// Fill `buffer` with the next chunk of the body.
    fn read(&self, request: RequestHandle, buffer: ReadBuffer);

    /// Cancel `request`. The engine answers with a canceled callback unless
    /// the request already completed.
    fn cancel(&self, request: RequestHandle);

    /// Release engine resources for `request`. No callbacks follow.
    fn destroy(&self, request: RequestHandle);

    /// Register a sink for request-finished events.
    fn add_request_finished_listener(&self, callbacks: CallbackSink);
}
