//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! executor_name = "tether-bridge"
//! read_buffer_size = 2048
//! max_redirects = 16
//! correlation_grace_ms = 30000
//! request_timeout_ms = 10000   # optional; no timeout when absent
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default size of the buffer lent to the engine for each read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;

/// Default number of redirects followed before the request is cancelled.
pub const DEFAULT_MAX_REDIRECTS: u32 = 16;

/// Default time a correlation entry outlives its request's terminal callback.
pub const DEFAULT_CORRELATION_GRACE_MS: u64 = 30_000;

/// Settings for a [`RequestBridge`](crate::RequestBridge).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Name of the bridge's worker thread. The timer thread appends `-timer`.
    pub executor_name: String,
    /// Capacity of the read buffer. Must be non-zero.
    pub read_buffer_size: usize,
    /// Redirects followed before the request is cancelled.
    pub max_redirects: u32,
    /// How long a response-to-request mapping is kept after the request
    /// completes, so a late finished event can still be correlated.
    pub correlation_grace_ms: u64,
    /// Cancel requests that have not completed after this long.
    pub request_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executor_name: "tether-bridge".to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            correlation_grace_ms: DEFAULT_CORRELATION_GRACE_MS,
            request_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(target: tether_core::logging::targets::BRIDGE, path = %path.display(), "loaded bridge config");
        Ok(config)
    }

    /// Check field values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "read_buffer_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.executor_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "executor_name",
                message: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                message: "must be greater than zero; omit it to disable the timeout".to_string(),
            });
        }
        Ok(())
    }

    /// The correlation grace period as a [`Duration`].
    pub fn correlation_grace(&self) -> Duration {
        Duration::from_millis(self.correlation_grace_ms)
    }

    /// The request timeout as a [`Duration`], if one is set.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Set the worker thread name.
    pub fn executor_name(mut self, name: impl Into<String>) -> Self {
        self.config.executor_name = name.into();
        self
    }

    /// Set the read buffer capacity.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the redirect limit.
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Set the correlation grace period.
    pub fn correlation_grace(mut self, grace: Duration) -> Self {
        self.config.correlation_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.max_redirects, 16);
        assert_eq!(config.correlation_grace(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        assert_eq!(BridgeConfig::from_toml_str("").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = BridgeConfig::from_toml_str(
            r#"
            read_buffer_size = 1024
            request_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.max_redirects, DEFAULT_MAX_REDIRECTS);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(matches!(
            BridgeConfig::from_toml_str("buffer = 12"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let err = BridgeConfig::from_toml_str("read_buffer_size = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "read_buffer_size",
                ..
            }
        ));
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::builder()
            .executor_name("net-worker")
            .max_redirects(3)
            .request_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(config.executor_name, "net-worker");
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.request_timeout_ms, Some(2000));

        assert!(BridgeConfig::builder().executor_name(" ").build().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = BridgeConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
