//! Document-store contracts and in-memory reference implementations.
//!
//! The usage store's [`UsageStore::fold`] is the concurrency seam: the
//! whole read-modify-write cycle for one (deployment, user, date) key runs
//! under that key's lock, so two concurrent events can never observe the
//! same prior state and overwrite each other's increment. The in-memory
//! implementations hold a DashMap shard lock across the closure; a
//! database-backed implementation must provide the same guarantee with a
//! single-document atomic update or optimistic retry.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::BTreeSet;

use fleet_core::{Deployment, DeploymentId, DeploymentStore, FleetError, FleetResult};

use crate::billing::MonthlyBilling;
use crate::usage::DailyUsage;

/// Identity of one daily usage record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyUsageKey {
    /// Deployment the usage belongs to.
    pub deployment_id: DeploymentId,
    /// Owning user.
    pub user_id: String,
    /// UTC calendar date.
    pub date: NaiveDate,
}

/// Mutation applied to a daily usage record under its key lock.
pub type UsageFold = Box<dyn FnOnce(&mut DailyUsage) + Send>;

/// Document-store contract for [`DailyUsage`] records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Apply `mutate` to the record for `key`, creating a zeroed record
    /// first if none exists. The whole cycle is atomic per key. Returns
    /// the updated record.
    async fn fold(&self, key: DailyUsageKey, mutate: UsageFold) -> FleetResult<DailyUsage>;

    /// Every record for `user_id` with `start <= date <= end`.
    async fn user_usage_in_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FleetResult<Vec<DailyUsage>>;

    /// Distinct users with any usage in the range.
    async fn users_with_usage(&self, start: NaiveDate, end: NaiveDate)
        -> FleetResult<Vec<String>>;
}

/// Document-store contract for [`MonthlyBilling`] records.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Fetch the record for (user, year, month), if any.
    async fn get(&self, user_id: &str, year: i32, month: u32)
        -> FleetResult<Option<MonthlyBilling>>;

    /// Insert `record` unless one already exists for its key; returns the
    /// stored record either way. Concurrent duplicate roll-ups converge on
    /// one record.
    async fn create_if_absent(&self, record: MonthlyBilling) -> FleetResult<MonthlyBilling>;
}

/// In-memory [`UsageStore`] backed by a sharded map.
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    records: DashMap<DailyUsageKey, DailyUsage>,
}

impl InMemoryUsageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn fold(&self, key: DailyUsageKey, mutate: UsageFold) -> FleetResult<DailyUsage> {
        // The entry guard holds the shard lock for the duration of the
        // mutation, which is what makes the fold atomic per key.
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| DailyUsage::empty(&key));
        mutate(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn user_usage_in_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FleetResult<Vec<DailyUsage>> {
        let mut records: Vec<DailyUsage> = self
            .records
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.user_id == user_id && key.date >= start && key.date <= end
            })
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| {
            (a.date, a.deployment_id.as_str()).cmp(&(b.date, b.deployment_id.as_str()))
        });
        Ok(records)
    }

    async fn users_with_usage(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FleetResult<Vec<String>> {
        let users: BTreeSet<String> = self
            .records
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.date >= start && key.date <= end
            })
            .map(|entry| entry.key().user_id.clone())
            .collect();
        Ok(users.into_iter().collect())
    }
}

/// In-memory [`BillingStore`].
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    records: DashMap<(String, i32, u32), MonthlyBilling>,
}

impl InMemoryBillingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> FleetResult<Option<MonthlyBilling>> {
        Ok(self
            .records
            .get(&(user_id.to_string(), year, month))
            .map(|entry| entry.value().clone()))
    }

    async fn create_if_absent(&self, record: MonthlyBilling) -> FleetResult<MonthlyBilling> {
        let key = (record.user_id.clone(), record.year, record.month);
        let entry = self.records.entry(key).or_insert(record);
        Ok(entry.value().clone())
    }
}

/// In-memory [`DeploymentStore`].
#[derive(Debug, Default)]
pub struct InMemoryDeploymentStore {
    records: DashMap<DeploymentId, Deployment>,
}

impl InMemoryDeploymentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn get(&self, id: &DeploymentId) -> FleetResult<Option<Deployment>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, deployment: Deployment) -> FleetResult<()> {
        self.records.insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn remove(&self, id: &DeploymentId) -> FleetResult<bool> {
        Ok(self.records.remove(id).is_some())
    }

    async fn display_name(&self, id: &DeploymentId) -> Option<String> {
        self.records.get(id).map(|entry| entry.value().name.clone())
    }

    async fn add_cost(&self, id: &DeploymentId, amount: f64, month_key: &str) -> FleetResult<()> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found(format!("deployment {id}")))?;
        entry.value_mut().cost_tracking.accrue(amount, month_key);
        Ok(())
    }
}
