//! Logging bootstrap for host processes.
//!
//! Library code only emits `tracing` events; a host binary (or a test that
//! wants output) calls [`init_tracing`] once at startup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{FleetError, FleetResult};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name stamped on every event.
    pub service_name: String,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "agent-fleet".to_string(),
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create a configuration for the named service.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the fallback log level.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Emit JSON-formatted events.
    #[must_use]
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Safe to call once per
/// process; a second call returns an error from the subscriber registry.
pub fn init_tracing(config: &TelemetryConfig) -> FleetResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| FleetError::internal(format!("Failed to initialize tracing: {e}")))?;

    tracing::info!(service = %config.service_name, "tracing initialized");
    Ok(())
}
