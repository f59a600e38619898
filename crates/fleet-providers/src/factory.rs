//! # Deployment Factory
//!
//! Registry and dispatcher over the provider adapters.
//!
//! The factory is an explicitly constructed, dependency-injected object:
//! build one with [`DeploymentFactory::builder`] and pass it to callers.
//! Adding a backend means registering one adapter; nothing else changes.
//!
//! Lifecycle operations enforce the status state machine, delegate to the
//! resolved adapter, record an inline log entry on the deployment, and
//! re-throw write failures after marking the record `Failed` (the caller
//! persists the record). Read operations never throw: a backend failure is
//! logged and replaced with a safe default, wrapped in
//! [`ReadOutcome::Degraded`] so observers can tell fallback from live data.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use fleet_core::{
    CanonicalMetrics, Deployment, DeploymentProvider, DeploymentStatus, FleetError, FleetResult,
    LogLevel, LogLine, ProviderKind, ReadOutcome, DEFAULT_LOG_TAIL,
};

/// Registry + dispatcher for deployment backends.
pub struct DeploymentFactory {
    providers: HashMap<ProviderKind, Arc<dyn DeploymentProvider>>,
}

impl std::fmt::Debug for DeploymentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentFactory")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`DeploymentFactory`].
#[derive(Default)]
pub struct DeploymentFactoryBuilder {
    providers: HashMap<ProviderKind, Arc<dyn DeploymentProvider>>,
}

impl DeploymentFactoryBuilder {
    /// Register an adapter under its declared kind. A later registration
    /// for the same kind replaces the earlier one.
    #[must_use]
    pub fn register(mut self, provider: Arc<dyn DeploymentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Build the factory.
    #[must_use]
    pub fn build(self) -> DeploymentFactory {
        DeploymentFactory {
            providers: self.providers,
        }
    }
}

impl DeploymentFactory {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> DeploymentFactoryBuilder {
        DeploymentFactoryBuilder::default()
    }

    /// Resolve the adapter for a provider kind.
    pub fn resolve(&self, kind: ProviderKind) -> FleetResult<&Arc<dyn DeploymentProvider>> {
        self.providers.get(&kind).ok_or_else(|| {
            FleetError::validation(format!("unsupported deployment type: {kind}"))
        })
    }

    /// Resolve the adapter for a provider name (e.g. "kubernetes").
    pub fn resolve_name(&self, name: &str) -> FleetResult<&Arc<dyn DeploymentProvider>> {
        self.resolve(name.parse()?)
    }

    /// Deploy (or redeploy) a deployment. Allowed from `Pending`, `Stopped`
    /// and `Failed`; success moves the record to `Running`, failure to
    /// `Failed` with the error re-thrown.
    pub async fn deploy(&self, deployment: &mut Deployment) -> FleetResult<()> {
        self.check_transition(
            deployment,
            &[
                DeploymentStatus::Pending,
                DeploymentStatus::Stopped,
                DeploymentStatus::Failed,
            ],
            "deploy",
        )?;
        self.run_write(deployment, "deploy", DeploymentStatus::Running)
            .await
    }

    /// Start a stopped deployment by re-deploying its backend resource.
    pub async fn start(&self, deployment: &mut Deployment) -> FleetResult<()> {
        self.check_transition(deployment, &[DeploymentStatus::Stopped], "start")?;
        self.run_write(deployment, "start", DeploymentStatus::Running)
            .await
    }

    /// Stop a running deployment: the backend resource is torn down, the
    /// record is retained as `Stopped`.
    pub async fn stop(&self, deployment: &mut Deployment) -> FleetResult<()> {
        self.check_transition(deployment, &[DeploymentStatus::Running], "stop")?;
        self.run_write(deployment, "stop", DeploymentStatus::Stopped)
            .await
    }

    /// Delete a deployment. Terminal; allowed from every non-deleted state
    /// since the backend delete is idempotent.
    pub async fn delete(&self, deployment: &mut Deployment) -> FleetResult<()> {
        if deployment.status == DeploymentStatus::Deleted {
            return Err(FleetError::validation(format!(
                "cannot delete deployment {}: already deleted",
                deployment.id
            )));
        }
        self.run_write(deployment, "delete", DeploymentStatus::Deleted)
            .await
    }

    /// Pull the deployment's current backend status, best effort. An
    /// adapter failure maps to `Failed`; nothing is persisted here.
    pub async fn refresh_status(&self, deployment: &Deployment) -> DeploymentStatus {
        let provider = match self.resolve(deployment.provider) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Status check failed to resolve provider");
                return DeploymentStatus::Failed;
            }
        };
        match provider.status(deployment).await {
            Ok(status) => status,
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Status check failed");
                DeploymentStatus::Failed
            }
        }
    }

    /// Fetch the canonical metrics tuple for a deployment. Never throws:
    /// a backend failure degrades to the all-zero tuple.
    pub async fn deployment_metrics(&self, deployment: &Deployment) -> ReadOutcome<CanonicalMetrics> {
        let provider = match self.resolve(deployment.provider) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Metrics fetch failed to resolve provider");
                return ReadOutcome::Degraded(CanonicalMetrics::default());
            }
        };
        match provider.metrics(deployment).await {
            Ok(metrics) => ReadOutcome::Live(metrics),
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Metrics fetch failed, returning zeros");
                ReadOutcome::Degraded(CanonicalMetrics::default())
            }
        }
    }

    /// Fetch the most recent log lines for a deployment. Never throws: a
    /// backend failure degrades to an empty list.
    pub async fn deployment_logs(
        &self,
        deployment: &Deployment,
        tail: Option<usize>,
    ) -> ReadOutcome<Vec<LogLine>> {
        let tail = tail.unwrap_or(DEFAULT_LOG_TAIL);
        let provider = match self.resolve(deployment.provider) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Log fetch failed to resolve provider");
                return ReadOutcome::Degraded(Vec::new());
            }
        };
        match provider.logs(deployment, tail).await {
            Ok(lines) => ReadOutcome::Live(lines),
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Log fetch failed, returning empty");
                ReadOutcome::Degraded(Vec::new())
            }
        }
    }

    fn check_transition(
        &self,
        deployment: &Deployment,
        allowed: &[DeploymentStatus],
        operation: &str,
    ) -> FleetResult<()> {
        if allowed.contains(&deployment.status) {
            Ok(())
        } else {
            Err(FleetError::validation(format!(
                "cannot {operation} deployment {} in status {}",
                deployment.id, deployment.status
            )))
        }
    }

    /// Run a write operation through the resolved adapter and settle the
    /// record's status either way.
    async fn run_write(
        &self,
        deployment: &mut Deployment,
        operation: &str,
        on_success: DeploymentStatus,
    ) -> FleetResult<()> {
        let provider = self.resolve(deployment.provider)?;

        let result = match operation {
            "stop" | "delete" => provider.undeploy(deployment).await,
            _ => provider.deploy(deployment).await,
        };

        match result {
            Ok(()) => {
                deployment.set_status(on_success);
                deployment.push_log(
                    LogLevel::Info,
                    format!("{operation} succeeded on {}", deployment.provider),
                );
                info!(deployment = %deployment.id, provider = %deployment.provider, operation, "Deployment operation succeeded");
                Ok(())
            }
            Err(e) => {
                deployment.set_status(DeploymentStatus::Failed);
                deployment.push_log(LogLevel::Error, format!("{operation} failed: {e}"));
                error!(deployment = %deployment.id, provider = %deployment.provider, operation, error = %e, "Deployment operation failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_core::{FleetResult, ProviderConfig, ResourceSpec};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scriptable in-memory adapter for factory tests.
    #[derive(Debug, Default)]
    struct FakeProvider {
        kind: Option<ProviderKind>,
        fail_writes: AtomicBool,
        fail_reads: AtomicBool,
    }

    impl FakeProvider {
        fn of(kind: ProviderKind) -> Arc<Self> {
            Arc::new(Self {
                kind: Some(kind),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl DeploymentProvider for FakeProvider {
        fn id(&self) -> &str {
            "fake"
        }

        fn kind(&self) -> ProviderKind {
            self.kind.unwrap_or(ProviderKind::Custom)
        }

        fn validate_config(&self, _deployment: &Deployment) -> FleetResult<()> {
            Ok(())
        }

        async fn deploy(&self, _deployment: &Deployment) -> FleetResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(FleetError::provider("fake", "deploy exploded", Some(500), true));
            }
            Ok(())
        }

        async fn undeploy(&self, _deployment: &Deployment) -> FleetResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(FleetError::provider("fake", "undeploy exploded", Some(500), true));
            }
            Ok(())
        }

        async fn status(&self, _deployment: &Deployment) -> FleetResult<DeploymentStatus> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(FleetError::provider("fake", "status exploded", None, true));
            }
            Ok(DeploymentStatus::Running)
        }

        async fn metrics(&self, _deployment: &Deployment) -> FleetResult<CanonicalMetrics> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(FleetError::provider("fake", "metrics exploded", None, true));
            }
            Ok(CanonicalMetrics {
                cpu_usage: 10.0,
                request_count: 42,
                ..Default::default()
            })
        }

        async fn logs(&self, _deployment: &Deployment, _tail: usize) -> FleetResult<Vec<LogLine>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(FleetError::provider("fake", "logs exploded", None, true));
            }
            Ok(vec![LogLine::message("hello")])
        }
    }

    fn deployment(kind: ProviderKind) -> Deployment {
        Deployment::new(
            "agent-1",
            "user-1",
            "test",
            kind,
            ResourceSpec::default(),
            ProviderConfig::Custom(serde_json::json!({})),
        )
    }

    fn factory_with(provider: Arc<FakeProvider>) -> DeploymentFactory {
        DeploymentFactory::builder().register(provider).build()
    }

    #[test]
    fn resolve_dispatches_per_kind_and_rejects_unknown() {
        let factory = DeploymentFactory::builder()
            .register(FakeProvider::of(ProviderKind::Kubernetes))
            .register(FakeProvider::of(ProviderKind::AwsLambda))
            .register(FakeProvider::of(ProviderKind::CloudRun))
            .build();

        let k8s = factory.resolve_name("kubernetes").unwrap();
        let lambda = factory.resolve_name("aws-lambda").unwrap();
        let run = factory.resolve_name("cloud-run").unwrap();
        assert_eq!(k8s.kind(), ProviderKind::Kubernetes);
        assert_eq!(lambda.kind(), ProviderKind::AwsLambda);
        assert_eq!(run.kind(), ProviderKind::CloudRun);

        let err = factory.resolve_name("unknown").err().unwrap();
        assert!(matches!(err, FleetError::Validation(_)));

        let err = factory.resolve(ProviderKind::Custom).err().unwrap();
        assert!(err.to_string().contains("unsupported deployment type"));
    }

    #[tokio::test]
    async fn deploy_success_moves_pending_to_running() {
        let provider = FakeProvider::of(ProviderKind::Kubernetes);
        let factory = factory_with(provider);
        let mut d = deployment(ProviderKind::Kubernetes);

        factory.deploy(&mut d).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);
        assert!(!d.logs.is_empty());
    }

    #[tokio::test]
    async fn deploy_failure_marks_failed_and_rethrows() {
        let provider = FakeProvider::of(ProviderKind::Kubernetes);
        provider.fail_writes.store(true, Ordering::SeqCst);
        let factory = factory_with(provider);
        let mut d = deployment(ProviderKind::Kubernetes);

        let err = factory.deploy(&mut d).await.unwrap_err();
        assert!(matches!(err, FleetError::Provider { .. }));
        assert_eq!(d.status, DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn lifecycle_walks_the_state_machine() {
        let provider = FakeProvider::of(ProviderKind::CloudRun);
        let factory = factory_with(provider);
        let mut d = deployment(ProviderKind::CloudRun);

        factory.deploy(&mut d).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);

        // Running cannot be started or deployed again.
        assert!(factory.start(&mut d).await.is_err());
        assert!(factory.deploy(&mut d).await.is_err());

        factory.stop(&mut d).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Stopped);

        // Stopped cannot be stopped again.
        assert!(factory.stop(&mut d).await.is_err());

        factory.start(&mut d).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);

        factory.stop(&mut d).await.unwrap();
        factory.delete(&mut d).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Deleted);

        // Deleted is terminal.
        assert!(factory.deploy(&mut d).await.is_err());
        assert!(factory.delete(&mut d).await.is_err());
    }

    #[tokio::test]
    async fn failed_deployment_can_be_redeployed() {
        let provider = FakeProvider::of(ProviderKind::AwsLambda);
        provider.fail_writes.store(true, Ordering::SeqCst);
        let factory = factory_with(provider.clone());
        let mut d = deployment(ProviderKind::AwsLambda);

        assert!(factory.deploy(&mut d).await.is_err());
        assert_eq!(d.status, DeploymentStatus::Failed);

        provider.fail_writes.store(false, Ordering::SeqCst);
        factory.deploy(&mut d).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn metrics_degrade_to_zeros_when_adapter_fails() {
        let provider = FakeProvider::of(ProviderKind::Kubernetes);
        provider.fail_reads.store(true, Ordering::SeqCst);
        let factory = factory_with(provider);
        let d = deployment(ProviderKind::Kubernetes);

        let outcome = factory.deployment_metrics(&d).await;
        assert!(outcome.is_degraded());
        assert_eq!(*outcome.value(), CanonicalMetrics::default());
    }

    #[tokio::test]
    async fn logs_degrade_to_empty_when_adapter_fails() {
        let provider = FakeProvider::of(ProviderKind::Kubernetes);
        provider.fail_reads.store(true, Ordering::SeqCst);
        let factory = factory_with(provider);
        let d = deployment(ProviderKind::Kubernetes);

        let outcome = factory.deployment_logs(&d, None).await;
        assert!(outcome.is_degraded());
        assert!(outcome.value().is_empty());
    }

    #[tokio::test]
    async fn status_check_failure_maps_to_failed_without_persisting() {
        let provider = FakeProvider::of(ProviderKind::Kubernetes);
        provider.fail_reads.store(true, Ordering::SeqCst);
        let factory = factory_with(provider);
        let d = deployment(ProviderKind::Kubernetes);

        assert_eq!(factory.refresh_status(&d).await, DeploymentStatus::Failed);
        // The record itself is untouched.
        assert_eq!(d.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn unregistered_provider_reads_degrade_instead_of_throwing() {
        let factory = DeploymentFactory::builder().build();
        let d = deployment(ProviderKind::Kubernetes);

        assert!(factory.deployment_metrics(&d).await.is_degraded());
        assert!(factory.deployment_logs(&d, Some(10)).await.is_degraded());
        assert_eq!(factory.refresh_status(&d).await, DeploymentStatus::Failed);
    }
}
