//! Response-to-request correlation.
//!
//! The engine's request-finished event names only the response metadata, not
//! the request that produced it. Every callback that carries response
//! metadata records the pair here so the finished event can be traced back to
//! its request.
//!
//! Entries are not removed when the request completes: the finished event
//! usually arrives afterwards. A completed request's entries are instead
//! marked with an expiry one grace period later and purged once it passes.
//!
//! The registry itself is not synchronized. It lives in bridge state that is
//! only touched from tasks on the bridge's executor.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::request::{RequestHandle, ResponseInfoHandle};

#[derive(Debug, Clone, Copy)]
struct Entry {
    request: RequestHandle,
    /// Set once the owning request has completed.
    expires_at: Option<Instant>,
}

/// Maps response metadata handles back to the request they belong to.
#[derive(Debug)]
pub struct CorrelationRegistry {
    entries: HashMap<ResponseInfoHandle, Entry>,
    grace: Duration,
}

impl CorrelationRegistry {
    /// Create an empty registry that keeps retired entries for `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            grace,
        }
    }

    /// The retention period for completed requests' entries.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Record that `response` belongs to `request`.
    ///
    /// Recording the same pair again is a no-op. If the engine reuses a
    /// response handle for a different request, the newer mapping wins.
    pub fn record(&mut self, response: ResponseInfoHandle, request: RequestHandle) {
        match self.entries.get_mut(&response) {
            Some(entry) if entry.request == request => {}
            Some(entry) => {
                tracing::debug!(
                    target: tether_core::logging::targets::METRICS,
                    %response,
                    previous = %entry.request,
                    %request,
                    "response handle reassigned"
                );
                *entry = Entry {
                    request,
                    expires_at: None,
                };
            }
            None => {
                self.entries.insert(
                    response,
                    Entry {
                        request,
                        expires_at: None,
                    },
                );
            }
        }
    }

    /// Look up the request a response belongs to.
    pub fn resolve(&self, response: ResponseInfoHandle) -> Option<RequestHandle> {
        self.entries.get(&response).map(|entry| entry.request)
    }

    /// Start the grace period for every entry of a completed request.
    ///
    /// Returns the number of entries affected. Entries already retired keep
    /// their original expiry.
    pub fn retire_request(&mut self, request: RequestHandle, now: Instant) -> usize {
        let expires_at = now + self.grace;
        let mut retired = 0;
        for entry in self.entries.values_mut() {
            if entry.request == request && entry.expires_at.is_none() {
                entry.expires_at = Some(expires_at);
                retired += 1;
            }
        }
        retired
    }

    /// Drop every entry of `request` immediately.
    pub fn forget_request(&mut self, request: RequestHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.request != request);
        before - self.entries.len()
    }

    /// Drop entries whose grace period has ended. Returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|expires_at| expires_at > now));
        before - self.entries.len()
    }

    /// Number of recorded responses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
