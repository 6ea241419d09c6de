//! Tracing initialization for Corpora components.
//!
//! Provides standardized tracing subscriber setup with JSON or pretty
//! formatting, driven by environment variables with sensible defaults.

use std::env;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for tracing initialization
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name for log attribution
    pub service_name: String,
    /// Log format: "json" or "pretty"
    pub format: String,
    /// Log level filter (e.g. "info", "corpora=debug,info")
    pub level: String,
    /// Whether to include file/line in logs
    pub include_location: bool,
    /// Whether to include target (module path)
    pub include_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "corpora".to_string(),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            include_location: env::var("LOG_LOCATION").map(|v| v == "true").unwrap_or(false),
            include_target: true,
        }
    }
}

impl TracingConfig {
    /// Create config for a specific component
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set format to JSON
    pub fn json(mut self) -> Self {
        self.format = "json".to_string();
        self
    }

    /// Set format to pretty (human-readable)
    pub fn pretty(mut self) -> Self {
        self.format = "pretty".to_string();
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; returns quietly if a subscriber is already
/// installed (useful for tests that race on initialization).
pub fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.include_target)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(config.include_target)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::info!(service = %config.service_name, "tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides() {
        let config = TracingConfig::for_service("retrieval")
            .with_level("debug")
            .json();
        assert_eq!(config.service_name, "retrieval");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, "json");
    }

    #[test]
    fn double_init_is_harmless() {
        let config = TracingConfig::for_service("test").pretty();
        init_tracing(&config);
        init_tracing(&config);
    }
}
