//! Persistence contract for deployment records.
//!
//! The platform assumes a document store with per-record CRUD. All
//! deployment mutation funnels through the factory and the usage
//! aggregator; this trait is the seam they share with whatever store the
//! host process wires in.

use async_trait::async_trait;

use crate::deployment::{Deployment, DeploymentId};
use crate::error::FleetResult;

/// Document-store contract for [`Deployment`] records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Fetch a deployment by id.
    async fn get(&self, id: &DeploymentId) -> FleetResult<Option<Deployment>>;

    /// Insert or replace a deployment record.
    async fn upsert(&self, deployment: Deployment) -> FleetResult<()>;

    /// Physically remove a record. Returns whether it existed.
    async fn remove(&self, id: &DeploymentId) -> FleetResult<bool>;

    /// Best-effort display-name lookup. `None` for dangling ids; callers
    /// must tolerate a hard-deleted deployment and synthesize a fallback.
    async fn display_name(&self, id: &DeploymentId) -> Option<String>;

    /// Atomically accrue cost onto a deployment's running totals.
    /// `month_key` is the "YYYY-MM" the accrual belongs to.
    async fn add_cost(&self, id: &DeploymentId, amount: f64, month_key: &str) -> FleetResult<()>;
}
