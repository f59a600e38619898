//! The canonical deployment record.
//!
//! A [`Deployment`] is the backend-agnostic description of one agent
//! instance: its desired configuration, declared resources, and the last
//! observed state (status, metrics snapshot, accrued cost, inline logs).
//! The record is mutated only through the deployment factory and the usage
//! aggregator; the controller layer persists it after each factory call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::FleetError;

/// Maximum number of inline log entries retained on a deployment record.
/// Older entries are evicted; full history lives with the provider.
pub const INLINE_LOG_CAP: usize = 200;

/// Unique identifier for a deployment, generated at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The execution backend a deployment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Container orchestration via the Kubernetes API.
    Kubernetes,
    /// Serverless functions via AWS Lambda.
    AwsLambda,
    /// Managed container platform via Google Cloud Run.
    CloudRun,
    /// A caller-managed backend outside the built-in set.
    Custom,
}

impl ProviderKind {
    /// Canonical wire name for this provider kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::AwsLambda => "aws-lambda",
            Self::CloudRun => "cloud-run",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(Self::Kubernetes),
            "aws-lambda" => Ok(Self::AwsLambda),
            "cloud-run" => Ok(Self::CloudRun),
            "custom" => Ok(Self::Custom),
            other => Err(FleetError::validation(format!(
                "unsupported deployment type: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a deployment.
///
/// Transitions are enforced by the factory:
/// `Pending|Stopped|Failed --deploy--> Running` (or `Failed` on error),
/// `Running --stop--> Stopped`, `Running|Stopped --delete--> Deleted`.
/// `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Created but not yet deployed.
    Pending,
    /// Deployed and serving.
    Running,
    /// Backend resources torn down, record retained.
    Stopped,
    /// The last lifecycle operation failed.
    Failed,
    /// Soft-deleted; terminal.
    Deleted,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Autoscaling bounds for a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    /// Minimum replica count.
    pub min_replicas: u32,
    /// Maximum replica count.
    pub max_replicas: u32,
    /// Target utilization percentage that triggers scaling.
    pub target_utilization: u32,
}

/// Declared resource limits for a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU limit, in the backend's native unit (e.g. "500m", "1").
    pub cpu: String,
    /// Memory limit (e.g. "512Mi").
    pub memory: String,
    /// Desired replica count.
    pub replicas: u32,
    /// Optional autoscaling bounds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingSpec>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            replicas: 1,
            autoscaling: None,
        }
    }
}

/// Backend-specific deployment parameters, keyed by provider.
///
/// Each variant carries its own required-field set; adapters still check
/// for empty values and reject a variant that does not match the
/// deployment's declared provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ProviderConfig {
    /// Kubernetes Deployment parameters.
    #[serde(rename_all = "camelCase")]
    Kubernetes {
        /// Container image reference.
        image: String,
        /// Target namespace.
        namespace: String,
        /// Environment variables injected into the container.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// AWS Lambda function parameters.
    #[serde(rename_all = "camelCase")]
    AwsLambda {
        /// Function handler (e.g. "index.handler").
        handler: String,
        /// Function runtime (e.g. "nodejs20.x").
        runtime: String,
        /// S3 bucket holding the code bundle.
        code_s3_bucket: String,
        /// S3 key of the code bundle.
        code_s3_key: String,
        /// Environment variables for the function.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Google Cloud Run service parameters.
    #[serde(rename_all = "camelCase")]
    CloudRun {
        /// Container image reference.
        image: String,
        /// Cloud Run location (e.g. "us-central1").
        location: String,
        /// Service account the revision runs as.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_account: Option<String>,
        /// Environment variables for the container.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Opaque parameters for a caller-managed backend.
    Custom(serde_json::Value),
}

impl ProviderConfig {
    /// The provider kind this config variant belongs to.
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Kubernetes { .. } => ProviderKind::Kubernetes,
            Self::AwsLambda { .. } => ProviderKind::AwsLambda,
            Self::CloudRun { .. } => ProviderKind::CloudRun,
            Self::Custom(_) => ProviderKind::Custom,
        }
    }
}

/// Last-observed metrics snapshot for a deployment.
///
/// Overwritten wholesale on each poll, never partially merged. Dimensions a
/// backend does not expose are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// CPU utilization percentage.
    pub cpu_usage: f64,
    /// Memory utilization percentage.
    pub memory_usage: f64,
    /// Requests served in the observation window.
    pub request_count: u64,
    /// Average response time in milliseconds.
    pub response_time: f64,
    /// Error rate over the observation window (0.0–1.0).
    pub error_rate: f64,
    /// When the snapshot was taken.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Running cost accrual for a deployment, maintained by the usage
/// aggregator independently of the monthly billing roll-up.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTracking {
    /// Lifetime accrued cost (USD).
    pub total: f64,
    /// Cost accrued in the current calendar month (USD).
    pub current_month: f64,
    /// "YYYY-MM" key the `current_month` counter belongs to.
    pub month_key: String,
}

impl CostTracking {
    /// Accrue `amount` for `month_key`, resetting the monthly counter when
    /// the month rolls over.
    pub fn accrue(&mut self, amount: f64, month_key: &str) {
        self.total += amount;
        if self.month_key != month_key {
            self.month_key = month_key.to_string();
            self.current_month = 0.0;
        }
        self.current_month += amount;
    }
}

/// Severity of an inline log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational message.
    Info,
    /// Warning message.
    Warn,
    /// Error message.
    Error,
}

/// One inline log entry on a deployment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Entry severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// A declared, backend-agnostic record of one agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique deployment id.
    pub id: DeploymentId,
    /// Owning agent (foreign reference, not enforced here).
    pub agent_id: String,
    /// Owning user (foreign reference, not enforced here).
    pub user_id: String,
    /// Human-readable display name.
    pub name: String,
    /// Target backend.
    pub provider: ProviderKind,
    /// Current lifecycle state.
    pub status: DeploymentStatus,
    /// Declared resource limits.
    pub resources: ResourceSpec,
    /// Backend-specific parameters.
    pub config: ProviderConfig,
    /// Last-observed metrics snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    /// Running cost accrual.
    pub cost_tracking: CostTracking,
    /// Bounded inline log buffer.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a new deployment in `Pending` state with a generated id.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        provider: ProviderKind,
        resources: ResourceSpec,
        config: ProviderConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            name: name.into(),
            provider,
            status: DeploymentStatus::Pending,
            resources,
            config,
            metrics: None,
            cost_tracking: CostTracking::default(),
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an inline log entry, evicting the oldest past the cap.
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= INLINE_LOG_CAP {
            self.logs.remove(0);
        }
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Set the status and touch `updated_at`.
    pub fn set_status(&mut self, status: DeploymentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Overwrite the metrics snapshot wholesale.
    pub fn set_metrics(&mut self, snapshot: MetricsSnapshot) {
        self.metrics = Some(snapshot);
        self.updated_at = Utc::now();
    }

    /// Whether this deployment has accrued any billable cost.
    #[must_use]
    pub fn has_billing_history(&self) -> bool {
        self.cost_tracking.total > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k8s_config() -> ProviderConfig {
        ProviderConfig::Kubernetes {
            image: "registry.example.com/agent:v1".to_string(),
            namespace: "agents".to_string(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn new_deployment_starts_pending() {
        let d = Deployment::new(
            "agent-1",
            "user-1",
            "my agent",
            ProviderKind::Kubernetes,
            ResourceSpec::default(),
            k8s_config(),
        );
        assert_eq!(d.status, DeploymentStatus::Pending);
        assert!(d.metrics.is_none());
        assert!(!d.has_billing_history());
    }

    #[test]
    fn provider_kind_round_trips_through_str() {
        for kind in [
            ProviderKind::Kubernetes,
            ProviderKind::AwsLambda,
            ProviderKind::CloudRun,
            ProviderKind::Custom,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!("heroku".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn inline_logs_are_bounded() {
        let mut d = Deployment::new(
            "agent-1",
            "user-1",
            "noisy",
            ProviderKind::Kubernetes,
            ResourceSpec::default(),
            k8s_config(),
        );
        for i in 0..(INLINE_LOG_CAP + 10) {
            d.push_log(LogLevel::Info, format!("entry {i}"));
        }
        assert_eq!(d.logs.len(), INLINE_LOG_CAP);
        assert_eq!(d.logs[0].message, "entry 10");
    }

    #[test]
    fn cost_tracking_resets_on_month_rollover() {
        let mut cost = CostTracking::default();
        cost.accrue(1.5, "2024-01");
        cost.accrue(0.5, "2024-01");
        assert!((cost.total - 2.0).abs() < f64::EPSILON);
        assert!((cost.current_month - 2.0).abs() < f64::EPSILON);

        cost.accrue(0.25, "2024-02");
        assert!((cost.total - 2.25).abs() < f64::EPSILON);
        assert!((cost.current_month - 0.25).abs() < f64::EPSILON);
        assert_eq!(cost.month_key, "2024-02");
    }

    #[test]
    fn config_serializes_with_provider_tag() {
        let json = serde_json::to_value(k8s_config()).unwrap();
        assert_eq!(json["provider"], "kubernetes");
        assert_eq!(json["image"], "registry.example.com/agent:v1");
    }

    #[test]
    fn deployment_serializes_controller_contract_fields() {
        let d = Deployment::new(
            "agent-1",
            "user-1",
            "my agent",
            ProviderKind::CloudRun,
            ResourceSpec::default(),
            ProviderConfig::CloudRun {
                image: "gcr.io/p/agent:v1".to_string(),
                location: "us-central1".to_string(),
                service_account: None,
                env: HashMap::new(),
            },
        );
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["provider"], "cloud-run");
        assert_eq!(json["status"], "pending");
        assert!(json["costTracking"]["currentMonth"].is_number());
        assert!(json.get("agentId").is_some());
    }
}
