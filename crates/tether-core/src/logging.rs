//! Logging facilities for Tether.
//!
//! Tether uses the `tracing` crate for instrumentation. To see logs, install
//! a subscriber in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt::init();
//!     // ...
//! }
//! ```
//!
//! Every event is emitted under one of the [`targets`], so a filter such as
//! `RUST_LOG=tether_net::lifecycle=trace` isolates a single subsystem.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Catch-all target used by the `tether_*!` macros.
    pub const CORE: &str = "tether_core";
    /// Executor worker loop.
    pub const EXECUTOR: &str = "tether_core::executor";
    /// Delay scheduler timer thread.
    pub const SCHEDULER: &str = "tether_core::scheduler";
    /// Request bridge wiring (engine callbacks, application commands).
    pub const BRIDGE: &str = "tether_net::bridge";
    /// Per-request state machine.
    pub const LIFECYCLE: &str = "tether_net::lifecycle";
    /// Finished-event correlation and timing.
    pub const METRICS: &str = "tether_net::metrics";
    /// Scripted in-process engine.
    pub const SIM: &str = "tether_net::sim";
}

/// Macros for common tracing patterns.
///
/// These are thin wrappers around the `tracing` macros with a fixed target.
#[macro_export]
macro_rules! tether_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "tether_core", $($arg)*)
    };
}

#[macro_export]
macro_rules! tether_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "tether_core", $($arg)*)
    };
}

#[macro_export]
macro_rules! tether_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "tether_core", $($arg)*)
    };
}

#[macro_export]
macro_rules! tether_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "tether_core", $($arg)*)
    };
}

#[macro_export]
macro_rules! tether_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "tether_core", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::targets;

    #[test]
    fn test_targets_are_namespaced() {
        for target in [
            targets::EXECUTOR,
            targets::SCHEDULER,
            targets::BRIDGE,
            targets::LIFECYCLE,
            targets::METRICS,
            targets::SIM,
        ] {
            assert!(target.starts_with("tether_"), "{target}");
            assert!(target.contains("::"), "{target}");
        }
    }

    #[test]
    fn test_macros_expand() {
        crate::tether_trace!(value = 1, "trace");
        crate::tether_debug!("debug");
        crate::tether_info!("info");
        crate::tether_warn!("warn");
        crate::tether_error!("error");
    }
}
