//! # AWS Lambda Provider
//!
//! Deployment adapter for serverless functions on AWS Lambda.
//!
//! The adapter drives three AWS services directly over HTTPS, signing every
//! request with AWS Signature Version 4:
//! - Lambda (create/update/delete functions, function state)
//! - CloudWatch (`GetMetricData` for the trailing metrics window)
//! - CloudWatch Logs (`FilterLogEvents` for the log tail)
//!
//! Lambda exposes no CPU or memory utilization; those canonical dimensions
//! are returned as zero.

use async_trait::async_trait;
use chrono::Utc;
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

const PROVIDER_NAME: &str = "aws-lambda";

/// AWS Lambda adapter configuration.
#[derive(Clone)]
pub struct LambdaConfig {
    /// Adapter instance ID.
    pub id: String,
    /// AWS region (e.g. "us-east-1").
    pub region: String,
    /// AWS access key ID.
    pub access_key_id: String,
    /// AWS secret access key.
    pub secret_access_key: SecretString,
    /// AWS session token for temporary credentials.
    pub session_token: Option<String>,
    /// Custom endpoint URL override (for tests and VPC endpoints). Applies
    /// to all three services when set.
    pub endpoint_url: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for LambdaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaConfig")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .finish()
    }
}

impl LambdaConfig {
    /// Create a new builder.
    pub fn builder() -> LambdaConfigBuilder {
        LambdaConfigBuilder::default()
    }

    fn service_url(&self, service: &str) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://{service}.{}.amazonaws.com", self.region))
    }
}

/// Builder for [`LambdaConfig`].
#[derive(Debug, Default)]
pub struct LambdaConfigBuilder {
    id: Option<String>,
    region: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
    endpoint_url: Option<String>,
    timeout: Option<Duration>,
}

impl LambdaConfigBuilder {
    /// Set the adapter instance ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the AWS region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the AWS access key ID.
    pub fn access_key_id(mut self, key: impl Into<String>) -> Self {
        self.access_key_id = Some(key.into());
        self
    }

    /// Set the AWS secret access key.
    pub fn secret_access_key(mut self, secret: impl Into<String>) -> Self {
        self.secret_access_key = Some(secret.into());
        self
    }

    /// Set the AWS session token.
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
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
    pub fn build(self) -> LambdaConfig {
        LambdaConfig {
            id: self.id.unwrap_or_else(|| "aws-lambda".to_string()),
            region: self.region.unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: self.access_key_id.unwrap_or_default(),
            secret_access_key: SecretString::new(self.secret_access_key.unwrap_or_default()),
            session_token: self.session_token,
            endpoint_url: self.endpoint_url,
            timeout: self.timeout.unwrap_or(DEFAULT_PROVIDER_TIMEOUT),
        }
    }
}

/// AWS Lambda deployment adapter.
pub struct LambdaProvider {
    config: LambdaConfig,
    client: Client,
}

impl std::fmt::Debug for LambdaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaProvider")
            .field("id", &self.config.id)
            .field("region", &self.config.region)
            .finish()
    }
}

impl LambdaProvider {
    /// Create a new Lambda provider.
    pub fn new(config: LambdaConfig) -> FleetResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FleetError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Backend function name for a deployment.
    fn function_name(deployment: &Deployment) -> String {
        format!("agent-{}", deployment.id)
    }

    #[allow(clippy::type_complexity)]
    fn config_fields<'a>(
        deployment: &'a Deployment,
    ) -> FleetResult<(&'a str, &'a str, &'a str, &'a str, &'a HashMap<String, String>)> {
        match &deployment.config {
            ProviderConfig::AwsLambda {
                handler,
                runtime,
                code_s3_bucket,
                code_s3_key,
                env,
            } => Ok((handler, runtime, code_s3_bucket, code_s3_key, env)),
            other => Err(FleetError::validation(format!(
                "deployment {} declares provider aws-lambda but carries a {} config",
                deployment.id,
                other.kind()
            ))),
        }
    }

    /// Declared memory limit in megabytes, as Lambda expects.
    fn memory_mb(deployment: &Deployment) -> u64 {
        let memory = &deployment.resources.memory;
        let parsed = memory
            .strip_suffix("Mi")
            .or_else(|| memory.strip_suffix('M'))
            .unwrap_or(memory)
            .parse::<u64>()
            .unwrap_or(128);
        parsed.clamp(128, 10_240)
    }

    /// Send a signed request to an AWS service and return the raw response.
    async fn send_signed(
        &self,
        service: &str,
        method: reqwest::Method,
        path: &str,
        extra_headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> FleetResult<reqwest::Response> {
        let url = format!("{}{path}", self.config.service_url(service));

        let mut headers: HashMap<String, String> = extra_headers
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.sign_request(service, method.as_str(), &url, &body, &mut headers)?;

        let mut request = self.client.request(method, &url);
        for (key, value) in &headers {
            request = request.header(key, value);
        }

        request.body(body).send().await.map_err(|e| {
            let retryable = e.is_timeout() || e.is_connect();
            FleetError::provider(
                PROVIDER_NAME,
                format!("{service} request failed: {e}"),
                None,
                retryable,
            )
        })
    }

    async fn failure(&self, operation: &str, response: reqwest::Response) -> FleetError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<AwsErrorBody>(&body)
            .ok()
            .and_then(AwsErrorBody::message)
            .unwrap_or(body);
        FleetError::provider(
            PROVIDER_NAME,
            format!("{operation} failed: {message}"),
            Some(status),
            status >= 500 || status == 429,
        )
    }

    /// Sign a request with AWS Signature Version 4.
    fn sign_request(
        &self,
        service: &str,
        method: &str,
        uri: &str,
        body: &[u8],
        headers: &mut HashMap<String, String>,
    ) -> FleetResult<()> {
        if self.config.access_key_id.is_empty() {
            return Err(FleetError::configuration(PROVIDER_NAME, ["accessKeyId"]));
        }
        let secret_key = self.config.secret_access_key.expose_secret();

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let region = &self.config.region;

        let parsed = url::Url::parse(uri)
            .map_err(|e| FleetError::internal(format!("Invalid URL: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FleetError::internal("URL has no host"))?
            .to_string();
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let path = parsed.path().to_string();

        let payload_hash = hex::encode(sha256_hash(body));

        headers.insert("host".to_string(), host);
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        if let Some(ref token) = self.config.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let mut signed_headers: Vec<&str> = headers.keys().map(String::as_str).collect();
        signed_headers.sort_unstable();
        let signed_headers_str = signed_headers.join(";");

        let mut canonical_headers = String::new();
        for header in &signed_headers {
            if let Some(value) = headers.get(*header) {
                canonical_headers.push_str(header);
                canonical_headers.push(':');
                canonical_headers.push_str(value.trim());
                canonical_headers.push('\n');
            }
        }

        let canonical_request = format!(
            "{method}\n{path}\n\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!("{date_stamp}/{region}/{service}/aws4_request");
        let string_to_sign = format!(
            "{algorithm}\n{amz_date}\n{credential_scope}\n{}",
            hex::encode(sha256_hash(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, region.as_bytes());
        let k_service = hmac_sha256(&k_region, service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "{algorithm} Credential={}/{credential_scope}, SignedHeaders={signed_headers_str}, Signature={signature}",
            self.config.access_key_id
        );
        headers.insert("authorization".to_string(), authorization);

        Ok(())
    }
}

#[async_trait]
impl DeploymentProvider for LambdaProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::AwsLambda
    }

    fn validate_config(&self, deployment: &Deployment) -> FleetResult<()> {
        let (handler, runtime, bucket, key, _) = Self::config_fields(deployment)?;
        let mut missing = Vec::new();
        if handler.is_empty() {
            missing.push("handler");
        }
        if runtime.is_empty() {
            missing.push("runtime");
        }
        if bucket.is_empty() {
            missing.push("codeS3Bucket");
        }
        if key.is_empty() {
            missing.push("codeS3Key");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FleetError::configuration(PROVIDER_NAME, missing))
        }
    }

    async fn deploy(&self, deployment: &Deployment) -> FleetResult<()> {
        self.validate_config(deployment)?;
        let (handler, runtime, bucket, key, env) = Self::config_fields(deployment)?;
        let name = Self::function_name(deployment);

        let create_body = serde_json::json!({
            "FunctionName": name,
            "Runtime": runtime,
            "Handler": handler,
            "Role": env.get("AWS_EXECUTION_ROLE").cloned().unwrap_or_default(),
            "Code": { "S3Bucket": bucket, "S3Key": key },
            "MemorySize": Self::memory_mb(deployment),
            "Environment": { "Variables": env },
        });

        debug!(deployment = %deployment.id, function = %name, "Creating Lambda function");

        let response = self
            .send_signed(
                "lambda",
                reqwest::Method::POST,
                "/2015-03-31/functions",
                &[("content-type", "application/json")],
                serde_json::to_vec(&create_body)
                    .map_err(|e| FleetError::internal(format!("Failed to serialize request: {e}")))?,
            )
            .await?;

        if response.status() == StatusCode::CONFLICT {
            // Function exists: push the new code bundle instead.
            debug!(deployment = %deployment.id, function = %name, "Function exists, updating code");
            let update_body = serde_json::json!({ "S3Bucket": bucket, "S3Key": key });
            let response = self
                .send_signed(
                    "lambda",
                    reqwest::Method::PUT,
                    &format!("/2015-03-31/functions/{name}/code"),
                    &[("content-type", "application/json")],
                    serde_json::to_vec(&update_body).map_err(|e| {
                        FleetError::internal(format!("Failed to serialize request: {e}"))
                    })?,
                )
                .await?;
            if !response.status().is_success() {
                return Err(self.failure("UpdateFunctionCode", response).await);
            }
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(self.failure("CreateFunction", response).await);
        }
        Ok(())
    }

    async fn undeploy(&self, deployment: &Deployment) -> FleetResult<()> {
        let name = Self::function_name(deployment);
        debug!(deployment = %deployment.id, function = %name, "Deleting Lambda function");

        let response = self
            .send_signed(
                "lambda",
                reqwest::Method::DELETE,
                &format!("/2015-03-31/functions/{name}"),
                &[],
                Vec::new(),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(self.failure("DeleteFunction", response).await)
    }

    async fn status(&self, deployment: &Deployment) -> FleetResult<DeploymentStatus> {
        let name = Self::function_name(deployment);

        let response = self
            .send_signed(
                "lambda",
                reqwest::Method::GET,
                &format!("/2015-03-31/functions/{name}/configuration"),
                &[],
                Vec::new(),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeploymentStatus::Stopped);
        }
        if !response.status().is_success() {
            return Err(self.failure("GetFunctionConfiguration", response).await);
        }

        let configuration: FunctionConfiguration = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse configuration: {e}"),
                None,
                false,
            )
        })?;

        Ok(translate_state(configuration.state.as_deref()))
    }

    async fn metrics(&self, deployment: &Deployment) -> FleetResult<CanonicalMetrics> {
        let name = Self::function_name(deployment);
        let end = Utc::now();
        let window =
            chrono::Duration::from_std(METRICS_WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
        let start = end - window;

        let query = |id: &str, metric: &str, stat: &str| {
            serde_json::json!({
                "Id": id,
                "MetricStat": {
                    "Metric": {
                        "Namespace": "AWS/Lambda",
                        "MetricName": metric,
                        "Dimensions": [{ "Name": "FunctionName", "Value": name.clone() }]
                    },
                    "Period": 300,
                    "Stat": stat
                }
            })
        };
        let body = serde_json::json!({
            "StartTime": start.timestamp(),
            "EndTime": end.timestamp(),
            "MetricDataQueries": [
                query("invocations", "Invocations", "Sum"),
                query("duration", "Duration", "Average"),
                query("errors", "Errors", "Sum"),
            ]
        });

        let response = self
            .send_signed(
                "monitoring",
                reqwest::Method::POST,
                "/",
                &[
                    ("content-type", "application/x-amz-json-1.0"),
                    ("x-amz-target", "GraniteServiceVersion20100801.GetMetricData"),
                ],
                serde_json::to_vec(&body)
                    .map_err(|e| FleetError::internal(format!("Failed to serialize request: {e}")))?,
            )
            .await?;

        if !response.status().is_success() {
            return Err(self.failure("GetMetricData", response).await);
        }

        let data: MetricDataResponse = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse metric data: {e}"),
                None,
                false,
            )
        })?;

        let sum = |id: &str| -> f64 {
            data.metric_data_results
                .iter()
                .filter(|r| r.id == id)
                .flat_map(|r| &r.values)
                .sum()
        };
        let avg = |id: &str| -> f64 {
            let values: Vec<f64> = data
                .metric_data_results
                .iter()
                .filter(|r| r.id == id)
                .flat_map(|r| r.values.iter().copied())
                .collect();
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        let invocations = sum("invocations");
        let errors = sum("errors");

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let request_count = invocations.max(0.0) as u64;

        // CPU and memory utilization are not exposed for Lambda; they stay
        // zero per the canonical contract.
        Ok(CanonicalMetrics {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            request_count,
            response_time: avg("duration"),
            error_rate: if invocations > 0.0 {
                errors / invocations
            } else {
                0.0
            },
        })
    }

    async fn logs(&self, deployment: &Deployment, tail: usize) -> FleetResult<Vec<LogLine>> {
        let name = Self::function_name(deployment);
        let body = serde_json::json!({
            "logGroupName": format!("/aws/lambda/{name}"),
            "limit": tail,
            "interleaved": true,
        });

        let response = self
            .send_signed(
                "logs",
                reqwest::Method::POST,
                "/",
                &[
                    ("content-type", "application/x-amz-json-1.1"),
                    ("x-amz-target", "Logs_20140328.FilterLogEvents"),
                ],
                serde_json::to_vec(&body)
                    .map_err(|e| FleetError::internal(format!("Failed to serialize request: {e}")))?,
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // No log group yet just means the function has not logged.
            if text.contains("ResourceNotFoundException") {
                return Ok(Vec::new());
            }
            return Err(FleetError::provider(
                PROVIDER_NAME,
                format!("FilterLogEvents failed: {text}"),
                Some(status.as_u16()),
                status.as_u16() >= 500,
            ));
        }

        let events: FilterLogEventsResponse = response.json().await.map_err(|e| {
            FleetError::provider(
                PROVIDER_NAME,
                format!("Failed to parse log events: {e}"),
                None,
                false,
            )
        })?;

        Ok(events
            .events
            .into_iter()
            .map(|event| LogLine {
                timestamp: event
                    .timestamp
                    .and_then(chrono::DateTime::from_timestamp_millis),
                message: event.message.unwrap_or_default(),
            })
            .collect())
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

/// Map a Lambda function state onto the canonical status.
fn translate_state(state: Option<&str>) -> DeploymentStatus {
    match state {
        Some("Active") => DeploymentStatus::Running,
        Some("Pending") => DeploymentStatus::Pending,
        Some("Inactive") => DeploymentStatus::Stopped,
        _ => DeploymentStatus::Failed,
    }
}

fn sha256_hash(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[derive(Debug, Deserialize)]
struct FunctionConfiguration {
    #[serde(rename = "State")]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricDataResponse {
    #[serde(rename = "MetricDataResults", default)]
    metric_data_results: Vec<MetricDataResult>,
}

#[derive(Debug, Deserialize)]
struct MetricDataResult {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Values", default)]
    values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct FilterLogEventsResponse {
    #[serde(default)]
    events: Vec<FilteredLogEvent>,
}

#[derive(Debug, Deserialize)]
struct FilteredLogEvent {
    timestamp: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AwsErrorBody {
    message: Option<String>,
    #[serde(rename = "Message")]
    message_alt: Option<String>,
}

impl AwsErrorBody {
    fn message(self) -> Option<String> {
        self.message.or(self.message_alt)
    }
}
