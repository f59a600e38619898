//! Monthly billing roll-up.
//!
//! The [`BillingEngine`] collapses a user's daily aggregates for one
//! calendar month into a single immutable [`MonthlyBilling`] record. The
//! roll-up is idempotent: a repeat request for an already-billed month
//! returns the stored record without recomputation.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use fleet_core::{DeploymentId, DeploymentStore, FleetError, FleetResult};

use crate::store::{BillingStore, UsageStore};

/// Number of deployments listed in a billing summary's top spenders.
const TOP_DEPLOYMENTS: usize = 5;

/// Processing state of a monthly billing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    /// Rolled up, awaiting processing.
    Pending,
    /// Handed to payment processing.
    Processed,
    /// Paid.
    Paid,
}

/// One deployment's share of a monthly bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCharge {
    /// Deployment the cost belongs to.
    pub deployment_id: DeploymentId,
    /// Display name at roll-up time, or a synthesized fallback when the
    /// deployment was hard-deleted.
    pub name: String,
    /// Summed cost for the month (USD).
    pub cost: f64,
}

/// Immutable-once-created monthly cost summary for one user.
///
/// Only `status` and `paid_at` may change after creation, and only through
/// the payment-processing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyBilling {
    /// Record id.
    pub id: String,
    /// Billed user.
    pub user_id: String,
    /// Calendar year.
    pub year: i32,
    /// Calendar month (1–12).
    pub month: u32,
    /// Per-deployment cost breakdown, most expensive first.
    pub deployments: Vec<DeploymentCharge>,
    /// Sum of all deployment costs (USD).
    pub total_cost: f64,
    /// Processing state.
    pub status: BillingStatus,
    /// When the bill was paid, if it has been.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    /// Roll-up timestamp.
    pub created_at: DateTime<Utc>,
}

/// Read-only month-to-date view for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSummary {
    /// Cost accrued so far this month (USD).
    pub current_month_total: f64,
    /// Linear day-of-month projection of this month's final cost (USD).
    pub projected_month_total: f64,
    /// The previous month's rolled-up total, 0.0 when never rolled up.
    pub previous_month_total: f64,
    /// The most expensive deployments this month, capped at five.
    pub top_deployments: Vec<DeploymentCharge>,
}

/// Collapses daily usage into monthly billing records.
pub struct BillingEngine {
    usage: Arc<dyn UsageStore>,
    billing: Arc<dyn BillingStore>,
    deployments: Arc<dyn DeploymentStore>,
}

impl std::fmt::Debug for BillingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingEngine").finish()
    }
}

impl BillingEngine {
    /// Create a new engine over the given stores.
    pub fn new(
        usage: Arc<dyn UsageStore>,
        billing: Arc<dyn BillingStore>,
        deployments: Arc<dyn DeploymentStore>,
    ) -> Self {
        Self {
            usage,
            billing,
            deployments,
        }
    }

    /// Roll up one user's month. Returns the existing record unchanged if
    /// the month was already billed.
    pub async fn generate_monthly_billing(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> FleetResult<MonthlyBilling> {
        if let Some(existing) = self.billing.get(user_id, year, month).await? {
            return Ok(existing);
        }

        let (first, last) = month_bounds(year, month)?;
        let usage = self.usage.user_usage_in_range(user_id, first, last).await?;

        let mut per_deployment: HashMap<DeploymentId, f64> = HashMap::new();
        for daily in &usage {
            *per_deployment
                .entry(daily.deployment_id.clone())
                .or_insert(0.0) += daily.cost.total;
        }

        let mut charges = Vec::with_capacity(per_deployment.len());
        for (deployment_id, cost) in per_deployment {
            let name = self
                .deployments
                .display_name(&deployment_id)
                .await
                .unwrap_or_else(|| format!("Deployment {deployment_id}"));
            charges.push(DeploymentCharge {
                deployment_id,
                name,
                cost,
            });
        }
        charges.sort_by(|a, b| b.cost.total_cmp(&a.cost));

        let total_cost = charges.iter().map(|c| c.cost).sum();
        let record = MonthlyBilling {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            year,
            month,
            deployments: charges,
            total_cost,
            status: BillingStatus::Pending,
            paid_at: None,
            created_at: Utc::now(),
        };

        info!(user = %user_id, year, month, total = total_cost, "Monthly billing rolled up");
        // A concurrent roll-up for the same key converges on one record.
        self.billing.create_if_absent(record).await
    }

    /// Roll up the last calendar month for every user with usage in it.
    /// Returns the number of users processed successfully.
    pub async fn process_monthly_billing(&self) -> usize {
        let today = Utc::now().date_naive();
        let (year, month) = previous_month(today.year(), today.month());
        self.process_month(year, month).await
    }

    /// Roll up one specific month for every user with usage in it. One
    /// user's failure never aborts the rest of the batch.
    pub async fn process_month(&self, year: i32, month: u32) -> usize {
        let Ok((first, last)) = month_bounds(year, month) else {
            error!(year, month, "Invalid billing month requested");
            return 0;
        };
        let users = match self.usage.users_with_usage(first, last).await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to list users for billing batch");
                return 0;
            }
        };

        let mut processed = 0;
        for user_id in users {
            match self.generate_monthly_billing(&user_id, year, month).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    error!(user = %user_id, year, month, error = %e, "Monthly roll-up failed");
                }
            }
        }
        processed
    }

    /// Month-to-date totals, projection, and top spenders for one user.
    /// Recomputed on every call.
    pub async fn get_user_billing_summary(&self, user_id: &str) -> FleetResult<BillingSummary> {
        self.summary_for(user_id, Utc::now().date_naive()).await
    }

    /// Date-parameterized form of [`Self::get_user_billing_summary`].
    pub async fn summary_for(&self, user_id: &str, today: NaiveDate) -> FleetResult<BillingSummary> {
        let (first, last) = month_bounds(today.year(), today.month())?;
        let usage = self
            .usage
            .user_usage_in_range(user_id, first, today)
            .await?;

        let mut per_deployment: HashMap<DeploymentId, f64> = HashMap::new();
        let mut current_month_total = 0.0;
        for daily in &usage {
            current_month_total += daily.cost.total;
            *per_deployment
                .entry(daily.deployment_id.clone())
                .or_insert(0.0) += daily.cost.total;
        }

        let mut top_deployments = Vec::with_capacity(per_deployment.len());
        for (deployment_id, cost) in per_deployment {
            let name = self
                .deployments
                .display_name(&deployment_id)
                .await
                .unwrap_or_else(|| format!("Deployment {deployment_id}"));
            top_deployments.push(DeploymentCharge {
                deployment_id,
                name,
                cost,
            });
        }
        top_deployments.sort_by(|a, b| b.cost.total_cmp(&a.cost));
        top_deployments.truncate(TOP_DEPLOYMENTS);

        let day_of_month = f64::from(today.day());
        let days_in_month = f64::from(last.day());
        let projected_month_total = if current_month_total > 0.0 {
            current_month_total / day_of_month * days_in_month
        } else {
            0.0
        };

        let (prev_year, prev_month) = previous_month(today.year(), today.month());
        let previous_month_total = self
            .billing
            .get(user_id, prev_year, prev_month)
            .await?
            .map_or(0.0, |record| record.total_cost);

        Ok(BillingSummary {
            current_month_total,
            projected_month_total,
            previous_month_total,
            top_deployments,
        })
    }
}

/// First and last day of a calendar month.
fn month_bounds(year: i32, month: u32) -> FleetResult<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| FleetError::validation(format!("invalid billing month {year}-{month}")))?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let last = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .ok_or_else(|| FleetError::validation(format!("invalid billing month {year}-{month}")))?
        .pred_opt()
        .ok_or_else(|| FleetError::internal("month underflow"))?;
    Ok((first, last))
}

/// The calendar month before (year, month).
fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        DailyUsageKey, InMemoryBillingStore, InMemoryDeploymentStore, InMemoryUsageStore,
    };
    use fleet_core::{Deployment, ProviderConfig, ProviderKind, ResourceSpec};

    struct Fixture {
        engine: BillingEngine,
        usage: Arc<InMemoryUsageStore>,
        deployments: Arc<InMemoryDeploymentStore>,
    }

    fn fixture() -> Fixture {
        let usage = Arc::new(InMemoryUsageStore::new());
        let billing = Arc::new(InMemoryBillingStore::new());
        let deployments = Arc::new(InMemoryDeploymentStore::new());
        let engine = BillingEngine::new(usage.clone(), billing.clone(), deployments.clone());
        Fixture {
            engine,
            usage,
            deployments,
        }
    }

    async fn seed_usage(
        usage: &InMemoryUsageStore,
        deployment: &str,
        user: &str,
        date: (i32, u32, u32),
        cost: f64,
    ) {
        usage
            .fold(
                DailyUsageKey {
                    deployment_id: DeploymentId::new(deployment),
                    user_id: user.to_string(),
                    date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
                },
                Box::new(move |daily| {
                    daily.request_count += 1;
                    daily.cost.total += cost;
                }),
            )
            .await
            .unwrap();
    }

    async fn seed_deployment(store: &InMemoryDeploymentStore, id: &str, name: &str) {
        let mut deployment = Deployment::new(
            "agent-1",
            "u1",
            name,
            ProviderKind::Custom,
            ResourceSpec::default(),
            ProviderConfig::Custom(serde_json::json!({})),
        );
        deployment.id = DeploymentId::new(id);
        store.upsert(deployment).await.unwrap();
    }

    #[tokio::test]
    async fn rollup_sums_costs_per_deployment() {
        let f = fixture();
        seed_deployment(&f.deployments, "d1", "chat agent").await;
        seed_deployment(&f.deployments, "d2", "search agent").await;
        seed_usage(&f.usage, "d1", "u1", (2024, 1, 10), 5.0).await;
        seed_usage(&f.usage, "d1", "u1", (2024, 1, 20), 7.5).await;
        seed_usage(&f.usage, "d2", "u1", (2024, 1, 15), 7.25).await;
        // Outside the month: ignored.
        seed_usage(&f.usage, "d1", "u1", (2024, 2, 1), 100.0).await;

        let record = f
            .engine
            .generate_monthly_billing("u1", 2024, 1)
            .await
            .unwrap();

        assert_eq!(record.deployments.len(), 2);
        assert!((record.total_cost - 19.75).abs() < 1e-9);
        assert_eq!(record.status, BillingStatus::Pending);
        // Most expensive first.
        assert_eq!(record.deployments[0].name, "chat agent");
        assert!((record.deployments[0].cost - 12.5).abs() < 1e-9);
        assert!((record.deployments[1].cost - 7.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rollup_is_idempotent() {
        let f = fixture();
        seed_deployment(&f.deployments, "d1", "chat agent").await;
        seed_usage(&f.usage, "d1", "u1", (2024, 1, 10), 5.0).await;

        let first = f
            .engine
            .generate_monthly_billing("u1", 2024, 1)
            .await
            .unwrap();

        // More usage lands after the roll-up; the stored record wins.
        seed_usage(&f.usage, "d1", "u1", (2024, 1, 11), 50.0).await;

        let second = f
            .engine
            .generate_monthly_billing("u1", 2024, 1)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!((first.total_cost - second.total_cost).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dangling_deployment_gets_fallback_name() {
        let f = fixture();
        // No deployment record exists for d9 (hard-deleted).
        seed_usage(&f.usage, "d9", "u1", (2024, 1, 10), 1.0).await;

        let record = f
            .engine
            .generate_monthly_billing("u1", 2024, 1)
            .await
            .unwrap();

        assert_eq!(record.deployments[0].name, "Deployment d9");
    }

    #[tokio::test]
    async fn batch_processes_every_user_in_the_month() {
        let f = fixture();
        seed_usage(&f.usage, "d1", "u1", (2024, 1, 5), 1.0).await;
        seed_usage(&f.usage, "d2", "u2", (2024, 1, 6), 2.0).await;
        seed_usage(&f.usage, "d3", "u3", (2024, 2, 1), 3.0).await;

        let processed = f.engine.process_month(2024, 1).await;
        assert_eq!(processed, 2);

        // Re-running the batch is harmless: the roll-ups are idempotent.
        let processed = f.engine.process_month(2024, 1).await;
        assert_eq!(processed, 2);
    }

    #[tokio::test]
    async fn summary_projects_linearly_and_caps_top_deployments() {
        let f = fixture();
        for i in 0..7 {
            let id = format!("d{i}");
            seed_deployment(&f.deployments, &id, &format!("agent {i}")).await;
            seed_usage(&f.usage, &id, "u1", (2024, 1, 5), f64::from(i) + 1.0).await;
        }

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let summary = f.engine.summary_for("u1", today).await.unwrap();

        // 1+2+...+7 = 28 over 10 of 31 days.
        assert!((summary.current_month_total - 28.0).abs() < 1e-9);
        assert!((summary.projected_month_total - 28.0 / 10.0 * 31.0).abs() < 1e-9);
        assert_eq!(summary.top_deployments.len(), 5);
        assert_eq!(summary.top_deployments[0].name, "agent 6");
        assert!((summary.previous_month_total).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn summary_reads_previous_month_from_stored_rollup() {
        let f = fixture();
        seed_usage(&f.usage, "d1", "u1", (2023, 12, 10), 42.0).await;
        f.engine
            .generate_monthly_billing("u1", 2023, 12)
            .await
            .unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let summary = f.engine.summary_for("u1", today).await.unwrap();
        assert!((summary.previous_month_total - 42.0).abs() < 1e-9);
    }

    #[test]
    fn month_bounds_handle_year_edges() {
        let (first, last) = month_bounds(2024, 12).unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());

        let (first, last) = month_bounds(2024, 2).unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

        assert!(month_bounds(2024, 13).is_err());
    }

    #[test]
    fn previous_month_wraps_january() {
        assert_eq!(previous_month(2024, 1), (2023, 12));
        assert_eq!(previous_month(2024, 7), (2024, 6));
    }
}
