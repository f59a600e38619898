//! # Fleet Core
//!
//! Core types, traits, and error handling for the Agent Fleet deployment
//! platform.
//!
//! This crate provides the foundational pieces used throughout the
//! platform:
//! - The canonical [`Deployment`] record and its lifecycle states
//! - The polymorphic [`DeploymentProvider`] backend contract
//! - Error types and handling
//! - The deployment persistence seam and logging bootstrap

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod deployment;
pub mod error;
pub mod provider;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use deployment::{
    AutoscalingSpec, CostTracking, Deployment, DeploymentId, DeploymentStatus, LogEntry, LogLevel,
    MetricsSnapshot, ProviderConfig, ProviderKind, ResourceSpec,
};
pub use error::{FleetError, FleetResult};
pub use provider::{
    CanonicalMetrics, DeploymentProvider, LogLine, ReadOutcome, DEFAULT_LOG_TAIL,
    DEFAULT_PROVIDER_TIMEOUT, METRICS_WINDOW,
};
pub use store::DeploymentStore;
pub use telemetry::{init_tracing, TelemetryConfig};
