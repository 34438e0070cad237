//! Tracing setup
//!
//! TigerStyle: Explicit telemetry configuration with bounded resource usage.
//!
//! Installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG` (falling
//! back to the configured level). Applications that own their subscriber can
//! skip this entirely; the library crates only emit `tracing` events.

use crate::error::{Error, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default service name attached to the startup log line
const SERVICE_NAME_DEFAULT: &str = "arbor";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for logs
    pub service_name: String,
    /// Whether to output logs to stdout
    pub stdout_enabled: bool,
    /// Log level filter, used when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Include the module target in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            stdout_enabled: true,
            log_level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a new configuration with the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Disable stdout logging
    pub fn without_stdout(mut self) -> Self {
        self.stdout_enabled = false;
        self
    }

    /// Set the log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Emit JSON lines
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - `ARBOR_SERVICE_NAME`: Service name (default: "arbor")
    /// - `RUST_LOG`: Log level filter (default: "info")
    /// - `ARBOR_LOG_JSON`: Emit JSON lines (default: false)
    pub fn from_env() -> Self {
        let service_name = std::env::var("ARBOR_SERVICE_NAME")
            .unwrap_or_else(|_| SERVICE_NAME_DEFAULT.to_string());

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let json = std::env::var("ARBOR_LOG_JSON")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

        Self {
            service_name,
            stdout_enabled: true,
            log_level,
            json,
            with_target: true,
        }
    }
}

/// Guard returned by [`init_telemetry`]
///
/// Holds nothing today; kept so callers have a stable value to bind for the
/// lifetime of the process.
#[derive(Debug)]
pub struct TelemetryGuard {
    service_name: String,
}

impl TelemetryGuard {
    /// Service name the subscriber was installed for
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Install the global tracing subscriber
///
/// # Errors
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```rust,ignore
/// use arbor_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _guard = init_telemetry(TelemetryConfig::from_env())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (text_layer, json_layer) = match (config.stdout_enabled, config.json) {
        (false, _) => (None, None),
        (true, false) => (
            Some(tracing_subscriber::fmt::layer().with_target(config.with_target)),
            None,
        ),
        (true, true) => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| Error::Internal {
            message: format!("failed to initialize tracing subscriber: {}", e),
        })?;

    tracing::info!(
        service = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );

    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}
