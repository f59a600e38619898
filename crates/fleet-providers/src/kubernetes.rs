//! # Kubernetes Provider
//!
//! Deployment adapter for container orchestration via the Kubernetes API.
//!
//! The adapter drives the apps/v1 Deployments API directly over HTTPS:
//! - `deploy` upserts a Deployment manifest built from the canonical record
//! - `status` maps replica availability onto the canonical states
//! - `metrics` sums pod metrics from metrics.k8s.io over the trailing window
//! - `logs` tails the first matching pod's log stream
//! - `undeploy` deletes the Deployment, treating 404 as success
//!
//! ## Authentication
//!
//! A bearer service-account token is sent with every request. TLS
//! verification can be disabled for clusters with self-signed certificates.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use fleet_core::{
    CanonicalMetrics, Deployment, DeploymentProvider, DeploymentStatus, FleetError, FleetResult,
    LogLine, ProviderConfig, ProviderKind, DEFAULT_PROVIDER_TIMEOUT,
};

const PROVIDER_NAME: &str = "kubernetes";

/// Kubernetes adapter configuration.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Adapter instance ID.
    pub id: String,
    /// API server base URL (e.g. "https://10.0.0.1:6443").
    pub api_server: String,
    /// Service-account bearer token.
    pub token: SecretString,
    /// Accept self-signed API server certificates.
    pub insecure_skip_tls_verify: bool,
    /// Request timeout.
    pub timeout: Duration,
}

impl KubernetesConfig {
    /// Create a new builder.
    pub fn builder() -> KubernetesConfigBuilder {
        KubernetesConfigBuilder::default()
    }
}

/// Builder for [`KubernetesConfig`].
#[derive(Debug, Default)]
pub struct KubernetesConfigBuilder {
    id: Option<String>,
    api_server: Option<String>,
    token: Option<String>,
    insecure_skip_tls_verify: bool,
    timeout: Option<Duration>,
}

impl KubernetesConfigBuilder {
    /// Set the adapter instance ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the API server base URL.
    pub fn api_server(mut self, url: impl Into<String>) -> Self {
        self.api_server = Some(url.into());
        self
    }

    /// Set the bearer token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Accept self-signed API server certificates.
    pub fn insecure_skip_tls_verify(mut self) -> Self {
        self.insecure_skip_tls_verify = true;
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> KubernetesConfig {
        KubernetesConfig {
            id: self.id.unwrap_or_else(|| "kubernetes".to_string()),
            api_server: self
                .api_server
                .unwrap_or_else(|| "https://kubernetes.default.svc".to_string()),
            token: SecretString::new(self.token.unwrap_or_default()),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            timeout: self.timeout.unwrap_or(DEFAULT_PROVIDER_TIMEOUT),
        }
    }
}

/// Kubernetes deployment adapter.
pub struct KubernetesProvider {
    config: KubernetesConfig,
    client: Client,
}

impl std::fmt::Debug for KubernetesProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesProvider")
            .field("id", &self.config.id)
            .field("api_server", &self.config.api_server)
            .finish()
    }
}

impl KubernetesProvider {
    /// Create a new Kubernetes provider.
    pub fn new(config: KubernetesConfig) -> FleetResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| FleetError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Backend resource name for a deployment. Deployment ids are UUIDs, so
    /// the result is a valid DNS-1123 label under 63 characters.
    fn resource_name(deployment: &Deployment) -> String {
        format!("agent-{}", deployment.id)
    }

    fn config_fields<'a>(
        deployment: &'a Deployment,
    ) -> FleetResult<(&'a str, &'a str, &'a HashMap<String, String>)> {
        match &deployment.config {
            ProviderConfig::Kubernetes {
                image,
                namespace,
                env,
            } => Ok((image, namespace, env)),
            other => Err(FleetError::validation(format!(
                "deployment {} declares provider kubernetes but carries a {} config",
                deployment.id,
                other.kind()
            ))),
        }
    }

    fn deployments_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{namespace}/deployments",
            self.config.api_server
        )
    }

    fn deployment_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{name}", self.deployments_url(namespace))
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{namespace}/pods",
            self.config.api_server
        )
    }

    fn pod_metrics_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods",
            self.config.api_server
        )
    }

    fn bearer(&self) -> &str {
        self.config.token.expose_secret()
    }

    /// Build the apps/v1 Deployment manifest for a canonical record.
    fn build_manifest(deployment: &Deployment) -> FleetResult<serde_json::Value> {
        let (image, _, env) = Self::config_fields(deployment)?;
        let name = Self::resource_name(deployment);

        let env_list: Vec<serde_json::Value> = env
            .iter()
            .map(|(k, v)| serde_json::json!({ "name": k, "value": v }))
            .collect();

        Ok(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "labels": { "app": name }
            },
            "spec": {
                "replicas": deployment.resources.replicas,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": {
                        "containers": [{
                            "name": "agent",
                            "image": image,
                            "env": env_list,
                            "resources": {
                                "limits": {
                                    "cpu": deployment.resources.cpu,
                                    "memory": deployment.resources.memory
                                },
                                "requests": {
                                    "cpu": deployment.resources.cpu,
                                    "memory": deployment.resources.memory
                                }
                            }
                        }]
                    }
                }
            }
        }))
    }

    async fn failure(&self, operation: &str, response: reqwest::Response) -> FleetError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<K8sStatus>(&body)
            .ok()
            .and_then(|s| s.message)
            .unwrap_or(body);
        FleetError::provider(
            PROVIDER_NAME,
            format!("{operation} failed: {message}"),
            Some(status),
            status >= 500,
        )
    }
}

#[async_trait]
impl DeploymentProvider for KubernetesProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Kubernetes
    }

    fn validate_config(&self, deployment: &Deployment) -> FleetResult<()> {
        let (image, namespace, _) = Self::config_fields(deployment)?;
        let mut missing = Vec::new();
        if image.is_empty() {
            missing.push("image");
        }
        if namespace.is_empty() {
            missing.push("namespace");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FleetError::configuration(PROVIDER_NAME, missing))
        }
    }

    async fn deploy(&self, deployment: &Deployment) -> FleetResult<()> {
        self.validate_config(deployment)?;
        let (_, namespace, _) = Self::config_fields(deployment)?;
        let name = Self::resource_name(deployment);
        let manifest = Self::build_manifest(deployment)?;

        debug!(deployment = %deployment.id, namespace, "Creating Kubernetes deployment");

        let response = self
            .client
            .post(self.deployments_url(namespace))
            .bearer_auth(self.bearer())
            .json(&manifest)
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Create failed: {e}"), None, true)
            })?;

        if response.status() == StatusCode::CONFLICT {
            // Resource already exists: replace it.
            debug!(deployment = %deployment.id, "Deployment exists, replacing");
            let response = self
                .client
                .put(self.deployment_url(namespace, &name))
                .bearer_auth(self.bearer())
                .json(&manifest)
                .send()
                .await
                .map_err(|e| {
                    FleetError::provider(PROVIDER_NAME, format!("Replace failed: {e}"), None, true)
                })?;
            if !response.status().is_success() {
                return Err(self.failure("Replace", response).await);
            }
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(self.failure("Create", response).await);
        }
        Ok(())
    }

    async fn undeploy(&self, deployment: &Deployment) -> FleetResult<()> {
        let (_, namespace, _) = Self::config_fields(deployment)?;
        let name = Self::resource_name(deployment);

        debug!(deployment = %deployment.id, namespace, "Deleting Kubernetes deployment");

        let response = self
            .client
            .delete(self.deployment_url(namespace, &name))
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Delete failed: {e}"), None, true)
            })?;

        // Already gone is success: the delete is idempotent.
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(self.failure("Delete", response).await)
    }

    async fn status(&self, deployment: &Deployment) -> FleetResult<DeploymentStatus> {
        let (_, namespace, _) = Self::config_fields(deployment)?;
        let name = Self::resource_name(deployment);

        let response = self
            .client
            .get(self.deployment_url(namespace, &name))
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
            return Err(self.failure("Status", response).await);
        }

        let resource: K8sDeployment = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse status response: {e}"),
                None,
                false,
            )
        })?;

        Ok(translate_status(&resource))
    }

    async fn metrics(&self, deployment: &Deployment) -> FleetResult<CanonicalMetrics> {
        let (_, namespace, _) = Self::config_fields(deployment)?;
        let name = Self::resource_name(deployment);

        let response = self
            .client
            .get(self.pod_metrics_url(namespace))
            .query(&[("labelSelector", format!("app={name}"))])
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Metrics failed: {e}"), None, true)
            })?;

        if !response.status().is_success() {
            return Err(self.failure("Metrics", response).await);
        }

        let list: PodMetricsList = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse metrics response: {e}"),
                None,
                false,
            )
        })?;

        let mut cpu_millis = 0.0;
        let mut memory_bytes = 0.0;
        for item in &list.items {
            for container in &item.containers {
                cpu_millis += parse_cpu_quantity(&container.usage.cpu);
                memory_bytes += parse_memory_quantity(&container.usage.memory);
            }
        }

        let cpu_limit = parse_cpu_quantity(&deployment.resources.cpu)
            * f64::from(deployment.resources.replicas);
        let memory_limit = parse_memory_quantity(&deployment.resources.memory)
            * f64::from(deployment.resources.replicas);

        // Request-level dimensions are not exposed by the metrics API;
        // they stay zero per the canonical contract.
        Ok(CanonicalMetrics {
            cpu_usage: percentage(cpu_millis, cpu_limit),
            memory_usage: percentage(memory_bytes, memory_limit),
            request_count: 0,
            response_time: 0.0,
            error_rate: 0.0,
        })
    }

    async fn logs(&self, deployment: &Deployment, tail: usize) -> FleetResult<Vec<LogLine>> {
        let (_, namespace, _) = Self::config_fields(deployment)?;
        let name = Self::resource_name(deployment);

        let response = self
            .client
            .get(self.pods_url(namespace))
            .query(&[("labelSelector", format!("app={name}"))])
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Pod list failed: {e}"), None, true)
            })?;

        if !response.status().is_success() {
            return Err(self.failure("Pod list", response).await);
        }

        let pods: PodList = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse pod list: {e}"),
                None,
                false,
            )
        })?;

        let Some(pod) = pods.items.first() else {
            return Ok(Vec::new());
        };

        let response = self
            .client
            .get(format!(
                "{}/{}/log",
                self.pods_url(namespace),
                pod.metadata.name
            ))
            .query(&[
                ("tailLines", tail.to_string()),
                ("timestamps", "true".to_string()),
            ])
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| {
                FleetError::provider(PROVIDER_NAME, format!("Log fetch failed: {e}"), None, true)
            })?;

        if !response.status().is_success() {
            return Err(self.failure("Log fetch", response).await);
        }

        let text = response.text().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to read log body: {e}"),
                None,
                false,
            )
        })?;

        Ok(text.lines().map(parse_log_line).collect())
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

/// Map replica availability onto the canonical status.
fn translate_status(resource: &K8sDeployment) -> DeploymentStatus {
    let desired = resource.spec.replicas;
    let available = resource.status.available_replicas;

    if desired == 0 {
        return DeploymentStatus::Stopped;
    }
    if available >= desired {
        return DeploymentStatus::Running;
    }
    if resource.status.conditions.iter().any(|c| {
        (c.condition_type == "ReplicaFailure" && c.status == "True")
            || (c.condition_type == "Progressing" && c.status == "False")
    }) {
        return DeploymentStatus::Failed;
    }
    DeploymentStatus::Pending
}

/// Parse a Kubernetes CPU quantity into millicores.
fn parse_cpu_quantity(quantity: &str) -> f64 {
    if let Some(millis) = quantity.strip_suffix('m') {
        millis.parse::<f64>().unwrap_or(0.0)
    } else if let Some(nanos) = quantity.strip_suffix('n') {
        nanos.parse::<f64>().unwrap_or(0.0) / 1_000_000.0
    } else {
        quantity.parse::<f64>().unwrap_or(0.0) * 1000.0
    }
}

/// Parse a Kubernetes memory quantity into bytes.
fn parse_memory_quantity(quantity: &str) -> f64 {
    let suffixes: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("K", 1000.0),
        ("M", 1_000_000.0),
        ("G", 1_000_000_000.0),
    ];
    for (suffix, factor) in suffixes {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<f64>().unwrap_or(0.0) * factor;
        }
    }
    quantity.parse::<f64>().unwrap_or(0.0)
}

fn percentage(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    used / limit * 100.0
}

/// Split a `timestamps=true` log line into timestamp and message.
fn parse_log_line(line: &str) -> LogLine {
    if let Some((ts, message)) = line.split_once(' ') {
        if let Ok(timestamp) = ts.parse::<chrono::DateTime<chrono::Utc>>() {
            return LogLine {
                timestamp: Some(timestamp),
                message: message.to_string(),
            };
        }
    }
    LogLine::message(line)
}

#[derive(Debug, Deserialize)]
struct K8sDeployment {
    #[serde(default)]
    spec: K8sDeploymentSpec,
    #[serde(default)]
    status: K8sDeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
struct K8sDeploymentSpec {
    #[serde(default)]
    replicas: u32,
}

#[derive(Debug, Default, Deserialize)]
struct K8sDeploymentStatus {
    #[serde(rename = "availableReplicas", default)]
    available_replicas: u32,
    #[serde(default)]
    conditions: Vec<K8sCondition>,
}

#[derive(Debug, Deserialize)]
struct K8sCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct K8sStatus {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetrics>,
}

#[derive(Debug, Deserialize)]
struct PodMetrics {
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    usage: ResourceUsage,
}

#[derive(Debug, Deserialize)]
struct ResourceUsage {
    #[serde(default)]
    cpu: String,
    #[serde(default)]
    memory: String,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
}
