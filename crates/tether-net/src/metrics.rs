//! Request timing metrics and finished-event correlation.
//!
//! After a request completes, the engine emits a separate finished event
//! carrying [`RequestMetrics`]. The [`MetricsCorrelator`] maps that event back
//! to its request through the [`CorrelationRegistry`] and derives the values
//! reported to [`RequestFinishedListener`]s.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::registry::CorrelationRegistry;
use crate::request::{ClientContext, RequestHandle, ResponseInfoHandle};

/// Engine timestamps, in milliseconds since the Unix epoch.
///
/// `None` or a non-positive value means the engine did not record the event.
pub type Timestamp = Option<i64>;

/// Current wall-clock time in the engine's timestamp unit.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

/// Elapsed milliseconds between two engine timestamps.
///
/// Returns 0 unless both are present and positive, and clamps a negative
/// difference to 0.
pub fn elapsed_ms(start: Timestamp, end: Timestamp) -> u64 {
    match (start, end) {
        (Some(start), Some(end)) if start > 0 && end > 0 => {
            u64::try_from(end.saturating_sub(start)).unwrap_or(0)
        }
        _ => 0,
    }
}

/// Timing and transfer metrics for one request, as recorded by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetrics {
    pub request_start: Timestamp,
    pub dns_start: Timestamp,
    pub dns_end: Timestamp,
    pub connect_start: Timestamp,
    pub connect_end: Timestamp,
    pub ssl_start: Timestamp,
    pub ssl_end: Timestamp,
    pub sending_start: Timestamp,
    pub sending_end: Timestamp,
    pub response_start: Timestamp,
    pub request_end: Timestamp,
    /// Whether an existing connection was reused, skipping DNS and connect.
    pub socket_reused: bool,
    pub sent_byte_count: u64,
    pub received_byte_count: u64,
}

impl RequestMetrics {
    /// Connection establishment time in milliseconds.
    pub fn connect_elapsed_ms(&self) -> u64 {
        elapsed_ms(self.connect_start, self.connect_end)
    }

    /// Derive the per-phase durations.
    pub fn timing_report(&self) -> TimingReport {
        TimingReport {
            dns_ms: elapsed_ms(self.dns_start, self.dns_end),
            connect_ms: self.connect_elapsed_ms(),
            ssl_ms: elapsed_ms(self.ssl_start, self.ssl_end),
            time_to_first_byte_ms: elapsed_ms(self.request_start, self.response_start),
            total_ms: elapsed_ms(self.request_start, self.request_end),
            socket_reused: self.socket_reused,
            sent_bytes: self.sent_byte_count,
            received_bytes: self.received_byte_count,
        }
    }
}

/// Per-phase durations derived from [`RequestMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingReport {
    pub dns_ms: u64,
    pub connect_ms: u64,
    pub ssl_ms: u64,
    pub time_to_first_byte_ms: u64,
    pub total_ms: u64,
    pub socket_reused: bool,
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

/// How the request ended, as reported in the finished event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedReason {
    Succeeded,
    Failed,
    Canceled,
}

/// Payload of the engine's request-finished event.
#[derive(Debug, Clone)]
pub struct RequestFinishedInfo {
    /// Metrics, if the engine collected any.
    pub metrics: Option<RequestMetrics>,
    pub reason: FinishedReason,
}

impl RequestFinishedInfo {
    /// Connection establishment time, or 0 without metrics.
    pub fn connect_elapsed_ms(&self) -> u64 {
        self.metrics
            .as_ref()
            .map_or(0, RequestMetrics::connect_elapsed_ms)
    }
}

/// Receives request-finished notifications.
///
/// Listeners run on the bridge's executor thread, in registration order.
pub trait RequestFinishedListener: Send + Sync {
    /// Called once per correlated finished event.
    fn on_request_finished(&self, context: &ClientContext, connect_elapsed_ms: u64);

    /// Called right after [`on_request_finished`](Self::on_request_finished)
    /// with the full timing breakdown.
    fn on_timing_report(&self, _context: &ClientContext, _report: &TimingReport) {}
}

impl<F> RequestFinishedListener for F
where
    F: Fn(&ClientContext, u64) + Send + Sync,
{
    fn on_request_finished(&self, context: &ClientContext, connect_elapsed_ms: u64) {
        self(context, connect_elapsed_ms)
    }
}

/// A finished event that has been traced back to its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedFinish {
    pub request: RequestHandle,
    pub reason: FinishedReason,
    pub connect_elapsed_ms: u64,
    pub report: TimingReport,
}

/// Correlates finished events with requests.
pub struct MetricsCorrelator;

impl MetricsCorrelator {
    /// Resolve a finished event against the registry.
    ///
    /// Returns `None` when the event carries no response metadata or the
    /// metadata is unknown, for instance when the request failed before any
    /// response arrived.
    pub fn correlate(
        registry: &CorrelationRegistry,
        info: &RequestFinishedInfo,
        response: Option<ResponseInfoHandle>,
    ) -> Option<CorrelatedFinish> {
        let request = registry.resolve(response?)?;
        let report = info
            .metrics
            .as_ref()
            .map(RequestMetrics::timing_report)
            .unwrap_or_default();
        Some(CorrelatedFinish {
            request,
            reason: info.reason,
            connect_elapsed_ms: info.connect_elapsed_ms(),
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_elapsed_ms() {
        assert_eq!(elapsed_ms(Some(100), Some(150)), 50);
        assert_eq!(elapsed_ms(Some(1_000), Some(1_025)), 25);
        assert_eq!(elapsed_ms(Some(1_000), Some(1_000)), 0);
        // Clock skew.
        assert_eq!(elapsed_ms(Some(1_025), Some(1_000)), 0);
        assert_eq!(elapsed_ms(None, Some(1_000)), 0);
        assert_eq!(elapsed_ms(Some(1_000), None), 0);
        assert_eq!(elapsed_ms(Some(0), Some(1_000)), 0);
        assert_eq!(elapsed_ms(Some(-5), Some(1_000)), 0);
    }

    #[test]
    fn test_timing_report() {
        let metrics = RequestMetrics {
            request_start: Some(10_000),
            dns_start: Some(10_001),
            dns_end: Some(10_005),
            connect_start: Some(10_005),
            connect_end: Some(10_030),
            response_start: Some(10_080),
            request_end: Some(10_100),
            received_byte_count: 512,
            ..Default::default()
        };
        let report = metrics.timing_report();
        assert_eq!(report.dns_ms, 4);
        assert_eq!(report.connect_ms, 25);
        assert_eq!(report.ssl_ms, 0);
        assert_eq!(report.time_to_first_byte_ms, 80);
        assert_eq!(report.total_ms, 100);
        assert_eq!(report.received_bytes, 512);
    }

    #[test]
    fn test_finished_info_without_metrics() {
        let info = RequestFinishedInfo {
            metrics: None,
            reason: FinishedReason::Failed,
        };
        assert_eq!(info.connect_elapsed_ms(), 0);
    }

    #[test]
    fn test_correlate() {
        let mut registry = CorrelationRegistry::new(Duration::from_secs(1));
        let request = RequestHandle::next();
        let response = ResponseInfoHandle::from_raw(42);
        registry.record(response, request);

        let info = RequestFinishedInfo {
            metrics: Some(RequestMetrics {
                connect_start: Some(100),
                connect_end: Some(112),
                ..Default::default()
            }),
            reason: FinishedReason::Succeeded,
        };

        let finish = MetricsCorrelator::correlate(&registry, &info, Some(response)).unwrap();
        assert_eq!(finish.request, request);
        assert_eq!(finish.connect_elapsed_ms, 12);
        assert_eq!(finish.report.connect_ms, 12);

        assert!(MetricsCorrelator::correlate(&registry, &info, None).is_none());
        assert!(
            MetricsCorrelator::correlate(&registry, &info, Some(ResponseInfoHandle::from_raw(1)))
                .is_none()
        );
    }

    #[test]
    fn test_closure_listener() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU64, Ordering};

        let seen = Arc::new(AtomicU64::new(0));
        let probe = seen.clone();
        let listener = move |_: &ClientContext, elapsed: u64| {
            probe.store(elapsed, Ordering::SeqCst);
        };
        let context = crate::request::client_context(());
        listener.on_request_finished(&context, 17);
        listener.on_timing_report(&context, &TimingReport::default());
        assert_eq!(seen.load(Ordering::SeqCst), 17);
    }
}
