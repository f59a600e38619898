//! # Google Cloud Run Provider
//!
//! Deployment adapter for the managed container platform on Google Cloud.
//!
//! The adapter drives three Google APIs over HTTPS with a bearer token:
//! - Cloud Run Admin API v2 (service upsert/delete, readiness conditions)
//! - Cloud Monitoring v3 (request count, latencies, container utilization)
//! - Cloud Logging v2 (log tail)

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use fleet_core::{
    CanonicalMetrics, Deployment, DeploymentProvider, DeploymentStatus, FleetError, FleetResult,
    LogLine, ProviderConfig, ProviderKind, DEFAULT_PROVIDER_TIMEOUT, METRICS_WINDOW,
};

const PROVIDER_NAME: &str = "cloud-run";

/// Cloud Run adapter configuration.
#[derive(Clone)]
pub struct CloudRunConfig {
    /// Adapter instance ID.
    pub id: String,
    /// Google Cloud project ID.
    pub project: String,
    /// OAuth2 access token with run/monitoring/logging scopes.
    pub access_token: SecretString,
    /// Endpoint override applied to all three services (for tests).
    pub endpoint_url: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for CloudRunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudRunConfig")
            .field("id", &self.id)
            .field("project", &self.project)
            .finish()
    }
}

impl CloudRunConfig {
    /// Create a new builder.
    pub fn builder() -> CloudRunConfigBuilder {
        CloudRunConfigBuilder::default()
    }

    fn service_url(&self, service: &str) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://{service}.googleapis.com"))
    }
}

/// Builder for [`CloudRunConfig`].
#[derive(Debug, Default)]
pub struct CloudRunConfigBuilder {
    id: Option<String>,
    project: Option<String>,
    access_token: Option<String>,
    endpoint_url: Option<String>,
    timeout: Option<Duration>,
}

impl CloudRunConfigBuilder {
    /// Set the adapter instance ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the Google Cloud project ID.
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Set the OAuth2 access token.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set a custom endpoint URL.
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> CloudRunConfig {
        CloudRunConfig {
            id: self.id.unwrap_or_else(|| "cloud-run".to_string()),
            project: self.project.unwrap_or_default(),
            access_token: SecretString::new(self.access_token.unwrap_or_default()),
            endpoint_url: self.endpoint_url,
            timeout: self.timeout.unwrap_or(DEFAULT_PROVIDER_TIMEOUT),
        }
    }
}

/// Google Cloud Run deployment adapter.
pub struct CloudRunProvider {
    config: CloudRunConfig,
    client: Client,
}

impl std::fmt::Debug for CloudRunProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudRunProvider")
            .field("id", &self.config.id)
            .field("project", &self.config.project)
            .finish()
    }
}

impl CloudRunProvider {
    /// Create a new Cloud Run provider.
    pub fn new(config: CloudRunConfig) -> FleetResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FleetError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Backend service ID for a deployment. Deployment ids are lowercase
    /// UUIDs, which satisfy the Cloud Run service-name grammar.
    fn service_id(deployment: &Deployment) -> String {
        format!("agent-{}", deployment.id)
    }

    #[allow(clippy::type_complexity)]
    fn config_fields<'a>(
        deployment: &'a Deployment,
    ) -> FleetResult<(&'a str, &'a str, Option<&'a str>, &'a HashMap<String, String>)> {
        match &deployment.config {
            ProviderConfig::CloudRun {
                image,
                location,
                service_account,
                env,
            } => Ok((image, location, service_account.as_deref(), env)),
            other => Err(FleetError::validation(format!(
                "deployment {} declares provider cloud-run but carries a {} config",
                deployment.id,
                other.kind()
            ))),
        }
    }

    fn services_url(&self, location: &str) -> String {
        format!(
            "{}/v2/projects/{}/locations/{location}/services",
            self.config.service_url("run"),
            self.config.project
        )
    }

    fn bearer(&self) -> &str {
        self.config.access_token.expose_secret()
    }

    fn build_service_body(&self, deployment: &Deployment) -> FleetResult<serde_json::Value> {
        let (image, _, service_account, env) = Self::config_fields(deployment)?;

        let env_list: Vec<serde_json::Value> = env
            .iter()
            .map(|(k, v)| serde_json::json!({ "name": k, "value": v }))
            .collect();

        let (min_instances, max_instances) = deployment.resources.autoscaling.as_ref().map_or(
            (0, deployment.resources.replicas.max(1)),
            |a| (a.min_replicas, a.max_replicas),
        );

        let mut template = serde_json::json!({
            "containers": [{
                "image": image,
                "env": env_list,
                "resources": {
                    "limits": {
                        "cpu": deployment.resources.cpu,
                        "memory": deployment.resources.memory
                    }
                }
            }],
            "scaling": {
                "minInstanceCount": min_instances,
                "maxInstanceCount": max_instances
            }
        });
        if let Some(account) = service_account {
            template["serviceAccount"] = serde_json::Value::String(account.to_string());
        }

        Ok(serde_json::json!({ "template": template }))
    }

    async fn failure(&self, operation: &str, response: reqwest::Response) -> FleetError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GoogleErrorBody>(&body)
            .ok()
            .and_then(|e| e.error.map(|e| e.message))
            .unwrap_or(body);
        FleetError::provider(
            PROVIDER_NAME,
            format!("{operation} failed: {message}"),
            Some(status),
            status >= 500 || status == 429,
        )
    }

    /// List time series for one metric type over the trailing window.
    async fn query_metric(&self, metric_type: &str, service_id: &str) -> FleetResult<Vec<TimeSeries>> {
        let end = Utc::now();
        let window =
            chrono::Duration::from_std(METRICS_WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
        let start = end - window;
        let filter = format!(
            "metric.type=\"{metric_type}\" AND resource.labels.service_name=\"{service_id}\""
        );
        let start_time = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end_time = end.to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self
            .client
            .get(format!(
                "{}/v3/projects/{}/timeSeries",
                self.config.service_url("monitoring"),
                self.config.project
            ))
            .query(&[
                ("filter", filter.as_str()),
                ("interval.startTime", start_time.as_str()),
                ("interval.endTime", end_time.as_str()),
            ])
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Metrics failed: {e}"), None, true)
            })?;

        if !response.status().is_success() {
            return Err(self.failure("ListTimeSeries", response).await);
        }

        let list: TimeSeriesList = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse time series: {e}"),
                None,
                false,
            )
        })?;
        Ok(list.time_series)
    }
}

#[async_trait]
impl DeploymentProvider for CloudRunProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudRun
    }

    fn validate_config(&self, deployment: &Deployment) -> FleetResult<()> {
        let (image, location, _, _) = Self::config_fields(deployment)?;
        let mut missing = Vec::new();
        if image.is_empty() {
            missing.push("image");
        }
        if location.is_empty() {
            missing.push("location");
        }
        if self.config.project.is_empty() {
            missing.push("project");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FleetError::configuration(PROVIDER_NAME, missing))
        }
    }

    async fn deploy(&self, deployment: &Deployment) -> FleetResult<()> {
        self.validate_config(deployment)?;
        let (_, location, _, _) = Self::config_fields(deployment)?;
        let service_id = Self::service_id(deployment);
        let body = self.build_service_body(deployment)?;

        debug!(deployment = %deployment.id, service = %service_id, "Creating Cloud Run service");

        let response = self
            .client
            .post(self.services_url(location))
            .query(&[("serviceId", service_id.as_str())])
            .bearer_auth(self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Create failed: {e}"), None, true)
            })?;

        if response.status() == StatusCode::CONFLICT {
            // Service exists: patch the template in place.
            debug!(deployment = %deployment.id, service = %service_id, "Service exists, patching");
            let response = self
                .client
                .patch(format!("{}/{service_id}", self.services_url(location)))
                .bearer_auth(self.bearer())
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    FleetError::provider(PROVIDER_NAME, format!("Patch failed: {e}"), None, true)
                })?;
            if !response.status().is_success() {
                return Err(self.failure("PatchService", response).await);
            }
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(self.failure("CreateService", response).await);
        }
        Ok(())
    }

    async fn undeploy(&self, deployment: &Deployment) -> FleetResult<()> {
        let (_, location, _, _) = Self::config_fields(deployment)?;
        let service_id = Self::service_id(deployment);

        debug!(deployment = %deployment.id, service = %service_id, "Deleting Cloud Run service");

        let response = self
            .client
            .delete(format!("{}/{service_id}", self.services_url(location)))
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Delete failed: {e}"), None, true)
            })?;

        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(self.failure("DeleteService", response).await)
    }

    async fn status(&self, deployment: &Deployment) -> FleetResult<DeploymentStatus> {
        let (_, location, _, _) = Self::config_fields(deployment)?;
        let service_id = Self::service_id(deployment);

        let response = self
            .client
            .get(format!("{}/{service_id}", self.services_url(location)))
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Status failed: {e}"), None, true)
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeploymentStatus::Stopped);
        }
        if !response.status().is_success() {
            return Err(self.failure("GetService", response).await);
        }

        let service: CloudRunService = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse service: {e}"),
                None,
                false,
            )
        })?;

        Ok(translate_condition(&service))
    }

    async fn metrics(&self, deployment: &Deployment) -> FleetResult<CanonicalMetrics> {
        let service_id = Self::service_id(deployment);

        let requests = self
            .query_metric("run.googleapis.com/request_count", &service_id)
            .await?;
        let latencies = self
            .query_metric("run.googleapis.com/request_latencies", &service_id)
            .await?;
        let cpu = self
            .query_metric("run.googleapis.com/container/cpu/utilizations", &service_id)
            .await?;
        let memory = self
            .query_metric(
                "run.googleapis.com/container/memory/utilizations",
                &service_id,
            )
            .await?;

        let mut total_requests = 0.0;
        let mut error_requests = 0.0;
        for series in &requests {
            let count: f64 = series.points.iter().map(TimeSeriesPoint::scalar).sum();
            total_requests += count;
            if series
                .metric
                .labels
                .get("response_code_class")
                .is_some_and(|class| class == "5xx")
            {
                error_requests += count;
            }
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let request_count = total_requests.max(0.0) as u64;

        Ok(CanonicalMetrics {
            cpu_usage: mean_of(&cpu) * 100.0,
            memory_usage: mean_of(&memory) * 100.0,
            request_count,
            response_time: mean_of(&latencies),
            error_rate: if total_requests > 0.0 {
                error_requests / total_requests
            } else {
                0.0
            },
        })
    }

    async fn logs(&self, deployment: &Deployment, tail: usize) -> FleetResult<Vec<LogLine>> {
        let service_id = Self::service_id(deployment);
        let body = serde_json::json!({
            "resourceNames": [format!("projects/{}", self.config.project)],
            "filter": format!(
                "resource.type=\"cloud_run_revision\" AND resource.labels.service_name=\"{service_id}\""
            ),
            "orderBy": "timestamp desc",
            "pageSize": tail,
        });

        let response = self
            .client
            .post(format!("{}/v2/entries:list", self.config.service_url("logging")))
            .bearer_auth(self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Log fetch failed: {e}"), None, true)
            })?;

        if !response.status().is_success() {
            return Err(self.failure("ListLogEntries", response).await);
        }

        let list: LogEntryList = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse log entries: {e}"),
                None,
                false,
            )
        })?;

        let mut lines: Vec<LogLine> = list
            .entries
            .into_iter()
            .map(|entry| {
                let timestamp = entry
                    .timestamp
                    .as_deref()
                    .and_then(|ts| ts.parse::<chrono::DateTime<Utc>>().ok());
                LogLine {
                    timestamp,
                    message: entry.message(),
                }
            })
            .collect();
        // The API returns newest first; callers expect chronological order.
        lines.reverse();
        Ok(lines)
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

/// Map the service's terminal condition onto the canonical status.
fn translate_condition(service: &CloudRunService) -> DeploymentStatus {
    if service.reconciling {
        return DeploymentStatus::Pending;
    }
    match service
        .terminal_condition
        .as_ref()
        .map(|c| c.state.as_str())
    {
        Some("CONDITION_SUCCEEDED") => DeploymentStatus::Running,
        Some("CONDITION_FAILED") => DeploymentStatus::Failed,
        _ => DeploymentStatus::Pending,
    }
}

/// Average scalar value across every point of every series.
fn mean_of(series_list: &[TimeSeries]) -> f64 {
    let values: Vec<f64> = series_list
        .iter()
        .flat_map(|s| s.points.iter().map(TimeSeriesPoint::scalar))
        .collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Deserialize)]
struct CloudRunService {
    #[serde(default)]
    reconciling: bool,
    #[serde(rename = "terminalCondition")]
    terminal_condition: Option<Condition>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesList {
    #[serde(rename = "timeSeries", default)]
    time_series: Vec<TimeSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct TimeSeries {
    #[serde(default)]
    metric: MetricDescriptor,
    #[serde(default)]
    points: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricDescriptor {
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct TimeSeriesPoint {
    #[serde(default)]
    value: TypedValue,
}

impl TimeSeriesPoint {
    /// Collapse the typed value onto one scalar: numbers pass through,
    /// distributions contribute their mean.
    fn scalar(&self) -> f64 {
        if let Some(double) = self.value.double_value {
            return double;
        }
        if let Some(ref int) = self.value.int64_value {
            return int.parse::<f64>().unwrap_or(0.0);
        }
        if let Some(ref dist) = self.value.distribution_value {
            return dist.mean.unwrap_or(0.0);
        }
        0.0
    }
}

#[derive(Debug, Default, Deserialize)]
struct TypedValue {
    #[serde(rename = "doubleValue")]
    double_value: Option<f64>,
    // The API serializes int64 as a JSON string.
    #[serde(rename = "int64Value")]
    int64_value: Option<String>,
    #[serde(rename = "distributionValue")]
    distribution_value: Option<DistributionValue>,
}

#[derive(Debug, Deserialize)]
struct DistributionValue {
    mean: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LogEntryList {
    #[serde(default)]
    entries: Vec<CloudLogEntry>,
}

#[derive(Debug, Deserialize)]
struct CloudLogEntry {
    timestamp: Option<String>,
    #[serde(rename = "textPayload")]
    text_payload: Option<String>,
    #[serde(rename = "jsonPayload")]
    json_payload: Option<serde_json::Value>,
}

impl CloudLogEntry {
    fn message(self) -> String {
        if let Some(text) = self.text_payload {
            return text;
        }
        self.json_payload
            .map(|payload| payload.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: Option<GoogleError>,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{AutoscalingSpec, ResourceSpec};

    fn cloud_run_deployment() -> Deployment {
        Deployment::new(
            "agent-1",
            "user-1",
            "run agent",
            ProviderKind::CloudRun,
            ResourceSpec {
                autoscaling: Some(AutoscalingSpec {
                    min_replicas: 1,
                    max_replicas: 5,
                    target_utilization: 70,
                }),
                ..ResourceSpec::default()
            },
            ProviderConfig::CloudRun {
                image: "gcr.io/proj/agent:v1".to_string(),
                location: "us-central1".to_string(),
                service_account: Some("agents@proj.iam.gserviceaccount.com".to_string()),
                env: HashMap::new(),
            },
        )
    }

    fn provider_with(endpoint: Option<String>) -> CloudRunProvider {
        let mut builder = CloudRunConfig::builder()
            .project("proj")
            .access_token("ya29.token");
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        CloudRunProvider::new(builder.build()).unwrap()
    }

    #[test]
    fn config_builder() {
        let config = CloudRunConfig::builder()
            .id("run-test")
            .project("proj")
            .access_token("token")
            .build();
        assert_eq!(config.id, "run-test");
        assert_eq!(config.service_url("run"), "https://run.googleapis.com");
    }

    #[test]
    fn validate_config_reports_missing_fields() {
        let provider = CloudRunProvider::new(CloudRunConfig::builder().build()).unwrap();
        let mut deployment = cloud_run_deployment();
        deployment.config = ProviderConfig::CloudRun {
            image: String::new(),
            location: String::new(),
            service_account: None,
            env: HashMap::new(),
        };

        let err = provider.validate_config(&deployment).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("image"));
        assert!(message.contains("location"));
        assert!(message.contains("project"));
    }

    #[test]
    fn service_body_carries_scaling_bounds() {
        let provider = provider_with(None);
        let deployment = cloud_run_deployment();
        let body = provider.build_service_body(&deployment).unwrap();
        assert_eq!(body["template"]["scaling"]["minInstanceCount"], 1);
        assert_eq!(body["template"]["scaling"]["maxInstanceCount"], 5);
        assert_eq!(
            body["template"]["serviceAccount"],
            "agents@proj.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn condition_translation_table() {
        let make = |reconciling: bool, state: Option<&str>| CloudRunService {
            reconciling,
            terminal_condition: state.map(|s| Condition {
                state: s.to_string(),
            }),
        };

        assert_eq!(
            translate_condition(&make(false, Some("CONDITION_SUCCEEDED"))),
            DeploymentStatus::Running
        );
        assert_eq!(
            translate_condition(&make(false, Some("CONDITION_FAILED"))),
            DeploymentStatus::Failed
        );
        assert_eq!(
            translate_condition(&make(true, Some("CONDITION_SUCCEEDED"))),
            DeploymentStatus::Pending
        );
        assert_eq!(
            translate_condition(&make(false, None)),
            DeploymentStatus::Pending
        );
    }

    #[test]
    fn point_scalar_handles_typed_values() {
        let point: TimeSeriesPoint =
            serde_json::from_value(serde_json::json!({ "value": { "int64Value": "42" } })).unwrap();
        assert!((point.scalar() - 42.0).abs() < f64::EPSILON);

        let point: TimeSeriesPoint = serde_json::from_value(
            serde_json::json!({ "value": { "distributionValue": { "mean": 120.5 } } }),
        )
        .unwrap();
        assert!((point.scalar() - 120.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn undeploy_treats_missing_service_as_success() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider_with(Some(server.uri()));
        provider.undeploy(&cloud_run_deployment()).await.unwrap();
    }

    #[tokio::test]
    async fn status_maps_ready_condition() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "reconciling": false,
                "terminalCondition": { "type": "Ready", "state": "CONDITION_SUCCEEDED" }
            })))
            .mount(&server)
            .await;

        let provider = provider_with(Some(server.uri()));
        let status = provider.status(&cloud_run_deployment()).await.unwrap();
        assert_eq!(status, DeploymentStatus::Running);
    }
}
