//! The polymorphic deployment-provider contract.
//!
//! Every execution backend (Kubernetes, AWS Lambda, Cloud Run) is driven
//! through [`DeploymentProvider`]. Write operations propagate backend
//! failures; read operations return a `Result` that the factory normalizes
//! into safe defaults so one backend outage never breaks the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::deployment::{Deployment, DeploymentStatus, ProviderKind};
use crate::error::FleetResult;

/// Default number of log lines returned when the caller does not ask for a
/// specific tail length.
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Trailing window queried for metrics.
pub const METRICS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default bound on any single backend call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Canonical metrics tuple returned by every adapter.
///
/// Dimensions a backend does not expose are zero, never omitted, so
/// downstream aggregation needs no per-provider shape handling.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMetrics {
    /// CPU utilization percentage.
    pub cpu_usage: f64,
    /// Memory utilization percentage.
    pub memory_usage: f64,
    /// Requests served over the metrics window.
    pub request_count: u64,
    /// Average response time in milliseconds.
    pub response_time: f64,
    /// Error rate over the metrics window (0.0–1.0).
    pub error_rate: f64,
}

impl From<CanonicalMetrics> for crate::deployment::MetricsSnapshot {
    fn from(metrics: CanonicalMetrics) -> Self {
        Self {
            cpu_usage: metrics.cpu_usage,
            memory_usage: metrics.memory_usage,
            request_count: metrics.request_count,
            response_time: metrics.response_time,
            error_rate: metrics.error_rate,
            last_updated: Some(Utc::now()),
        }
    }
}

/// One log line fetched live from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// Backend-reported timestamp, when available.
    pub timestamp: Option<DateTime<Utc>>,
    /// Raw message text.
    pub message: String,
}

impl LogLine {
    /// Create a log line without a timestamp.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            message: text.into(),
        }
    }
}

/// Outcome of a read-path call that never fails the caller: either live
/// backend data or a safe default substituted after a backend failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    /// Real data from the backend.
    Live(T),
    /// Fallback default; the backend call failed and was logged.
    Degraded(T),
}

impl<T> ReadOutcome<T> {
    /// The carried value, live or not.
    pub fn into_inner(self) -> T {
        match self {
            Self::Live(value) | Self::Degraded(value) => value,
        }
    }

    /// Borrow the carried value.
    pub fn value(&self) -> &T {
        match self {
            Self::Live(value) | Self::Degraded(value) => value,
        }
    }

    /// Whether this outcome is a fallback default.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// Contract implemented by every execution backend.
///
/// Adapters translate the canonical [`Deployment`] record into
/// backend-specific API calls and map backend-native status semantics onto
/// the four canonical states. Each adapter owns exactly one backend.
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    /// Instance identifier (for logs and diagnostics).
    fn id(&self) -> &str;

    /// Which backend this adapter drives.
    fn kind(&self) -> ProviderKind;

    /// Validate that the deployment's config carries every field this
    /// backend requires. Runs locally, before any network call, and fails
    /// with a configuration error naming the missing field(s).
    fn validate_config(&self, deployment: &Deployment) -> FleetResult<()>;

    /// Create or update the backend resource for this deployment.
    /// Validates config first; backend failures propagate.
    async fn deploy(&self, deployment: &Deployment) -> FleetResult<()>;

    /// Delete the backend resource. A backend "not found" response is
    /// success: the delete is idempotent.
    async fn undeploy(&self, deployment: &Deployment) -> FleetResult<()>;

    /// Map the backend's native state onto a canonical status.
    async fn status(&self, deployment: &Deployment) -> FleetResult<DeploymentStatus>;

    /// Query the trailing metrics window and return the canonical tuple.
    async fn metrics(&self, deployment: &Deployment) -> FleetResult<CanonicalMetrics>;

    /// Fetch the most recent `tail` log lines.
    async fn logs(&self, deployment: &Deployment, tail: usize) -> FleetResult<Vec<LogLine>>;

    /// Bound applied to every backend call issued by this adapter.
    fn timeout(&self) -> Duration {
        DEFAULT_PROVIDER_TIMEOUT
    }
}
