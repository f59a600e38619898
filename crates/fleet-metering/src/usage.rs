//! Per-request usage metering with streaming aggregation.
//!
//! Every served agent request emits one [`UsageEvent`]. The
//! [`UsageAggregator`] folds it into the day's [`DailyUsage`] record for
//! that deployment (request count, token totals, running latency
//! mean/min/max, error count, accrued cost) and mirrors the cost onto the
//! deployment record's running totals.
//!
//! Recording never fails the caller: aggregation errors are logged and
//! swallowed so the serving path is unaffected.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use fleet_core::{DeploymentId, DeploymentStore, FleetError, FleetResult};

use crate::store::{DailyUsageKey, UsageStore};

/// Billing rates applied per usage event.
///
/// An explicit config struct, resolved once at startup and injected; rates
/// are never read from ambient process state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRates {
    /// Compute cost per millisecond of request latency (USD).
    pub compute_rate_per_ms: f64,
    /// Cost per input token (USD).
    pub input_rate_per_token: f64,
    /// Cost per output token (USD).
    pub output_rate_per_token: f64,
}

impl Default for UsageRates {
    fn default() -> Self {
        Self {
            compute_rate_per_ms: 0.000_001,
            input_rate_per_token: 0.000_01,
            output_rate_per_token: 0.000_03,
        }
    }
}

impl UsageRates {
    /// Compute cost of one event, latency-derived (USD).
    #[must_use]
    pub fn compute_cost(&self, event: &UsageEvent) -> f64 {
        event.latency_ms * self.compute_rate_per_ms
    }

    /// Token cost of one event (USD).
    #[must_use]
    pub fn token_cost(&self, event: &UsageEvent) -> f64 {
        event.input_tokens as f64 * self.input_rate_per_token
            + event.output_tokens as f64 * self.output_rate_per_token
    }

    /// Total cost of one event (USD).
    #[must_use]
    pub fn event_cost(&self, event: &UsageEvent) -> f64 {
        self.compute_cost(event) + self.token_cost(event)
    }
}

/// One usage event, emitted per completed agent response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    /// Deployment that served the request.
    pub deployment_id: DeploymentId,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Request latency in milliseconds.
    pub latency_ms: f64,
    /// Whether the request failed.
    pub is_error: bool,
}

/// Token counters for one day, all monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCount {
    /// Input tokens.
    pub input: u64,
    /// Output tokens.
    pub output: u64,
    /// Input + output.
    pub total: u64,
}

/// Latency statistics maintained incrementally.
///
/// `p95`/`p99` are declared for the wire contract but stay 0.0: computing
/// them correctly needs a latency-sample store this subsystem does not
/// keep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    /// Running mean latency (ms).
    pub avg: f64,
    /// Minimum observed latency (ms).
    pub min: f64,
    /// Maximum observed latency (ms).
    pub max: f64,
    /// 95th percentile placeholder, always 0.0.
    pub p95: f64,
    /// 99th percentile placeholder, always 0.0.
    pub p99: f64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            avg: 0.0,
            // Sentinel: replaced by the first observed sample.
            min: f64::INFINITY,
            max: 0.0,
            p95: 0.0,
            p99: 0.0,
        }
    }
}

/// Cost counters for one day, all monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    /// Latency-derived compute cost (USD).
    pub compute: f64,
    /// Token cost (USD).
    pub tokens: f64,
    /// Compute + tokens.
    pub total: f64,
}

/// Running aggregate for one (deployment, user, UTC date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    /// Deployment the usage belongs to.
    pub deployment_id: DeploymentId,
    /// Owning user.
    pub user_id: String,
    /// UTC calendar date.
    pub date: NaiveDate,
    /// Requests served.
    pub request_count: u64,
    /// Token counters.
    pub token_count: TokenCount,
    /// Latency statistics.
    pub latency: LatencyStats,
    /// Failed requests.
    pub error_count: u64,
    /// Accrued cost.
    pub cost: CostBreakdown,
}

impl DailyUsage {
    /// Fresh record with zeroed counters for the given key.
    #[must_use]
    pub fn empty(key: &DailyUsageKey) -> Self {
        Self {
            deployment_id: key.deployment_id.clone(),
            user_id: key.user_id.clone(),
            date: key.date,
            request_count: 0,
            token_count: TokenCount::default(),
            latency: LatencyStats::default(),
            error_count: 0,
            cost: CostBreakdown::default(),
        }
    }

    /// Fold one event into the aggregate and return the event's cost.
    ///
    /// The running mean uses the incremental formula
    /// `new_avg = (old_avg * old_count + sample) / new_count`, falling back
    /// to the sample itself for the first event of the day.
    pub fn fold(&mut self, event: &UsageEvent, rates: &UsageRates) -> f64 {
        let old_count = self.request_count;
        self.request_count += 1;

        self.token_count.input += event.input_tokens;
        self.token_count.output += event.output_tokens;
        self.token_count.total += event.input_tokens + event.output_tokens;

        let sample = event.latency_ms;
        self.latency.avg = if old_count == 0 {
            sample
        } else {
            (self.latency.avg * old_count as f64 + sample) / (old_count + 1) as f64
        };
        self.latency.min = self.latency.min.min(sample);
        self.latency.max = self.latency.max.max(sample);

        if event.is_error {
            self.error_count += 1;
        }

        let compute_cost = rates.compute_cost(event);
        let token_cost = rates.token_cost(event);
        self.cost.compute += compute_cost;
        self.cost.tokens += token_cost;
        self.cost.total += compute_cost + token_cost;

        compute_cost + token_cost
    }
}

/// Folds usage events into daily aggregates and deployment cost totals.
pub struct UsageAggregator {
    usage: Arc<dyn UsageStore>,
    deployments: Arc<dyn DeploymentStore>,
    rates: UsageRates,
}

impl std::fmt::Debug for UsageAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAggregator")
            .field("rates", &self.rates)
            .finish()
    }
}

impl UsageAggregator {
    /// Create a new aggregator over the given stores.
    pub fn new(
        usage: Arc<dyn UsageStore>,
        deployments: Arc<dyn DeploymentStore>,
        rates: UsageRates,
    ) -> Self {
        Self {
            usage,
            deployments,
            rates,
        }
    }

    /// The rates this aggregator applies.
    #[must_use]
    pub fn rates(&self) -> &UsageRates {
        &self.rates
    }

    /// Record one usage event for today (UTC). Failures are logged and
    /// swallowed; the caller's response path is never affected.
    pub async fn record(&self, event: UsageEvent) {
        if let Err(e) = self.try_record_at(event, Utc::now().date_naive()).await {
            error!(error = %e, "Failed to record usage event");
        }
    }

    /// Record one usage event against an explicit date, propagating
    /// failures. Used by backfills and tests; `record` is the serving-path
    /// entry point.
    pub async fn try_record_at(&self, event: UsageEvent, date: NaiveDate) -> FleetResult<DailyUsage> {
        let deployment = self
            .deployments
            .get(&event.deployment_id)
            .await?
            .ok_or_else(|| {
                FleetError::not_found(format!("deployment {}", event.deployment_id))
            })?;

        let key = DailyUsageKey {
            deployment_id: event.deployment_id.clone(),
            user_id: deployment.user_id.clone(),
            date,
        };

        let rates = self.rates;
        let folded = event.clone();
        let updated = self
            .usage
            .fold(
                key,
                Box::new(move |daily| {
                    daily.fold(&folded, &rates);
                }),
            )
            .await?;

        // Mirror the event cost onto the deployment's running totals.
        let event_cost = rates.event_cost(&event);
        let month_key = date.format("%Y-%m").to_string();
        self.deployments
            .add_cost(&event.deployment_id, event_cost, &month_key)
            .await?;

        debug!(
            deployment = %event.deployment_id,
            requests = updated.request_count,
            cost = updated.cost.total,
            "Usage event recorded"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DailyUsageKey {
        DailyUsageKey {
            deployment_id: DeploymentId::new("d1"),
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        }
    }

    fn event(input: u64, output: u64, latency: f64, is_error: bool) -> UsageEvent {
        UsageEvent {
            deployment_id: DeploymentId::new("d1"),
            input_tokens: input,
            output_tokens: output,
            latency_ms: latency,
            is_error,
        }
    }

    #[test]
    fn fold_three_events_matches_expected_aggregate() {
        let rates = UsageRates::default();
        let mut daily = DailyUsage::empty(&key());

        daily.fold(&event(100, 50, 200.0, false), &rates);
        daily.fold(&event(80, 40, 300.0, false), &rates);
        daily.fold(&event(10, 5, 150.0, true), &rates);

        assert_eq!(daily.request_count, 3);
        assert_eq!(daily.token_count.total, 285);
        assert_eq!(daily.token_count.input, 190);
        assert_eq!(daily.token_count.output, 95);
        assert_eq!(daily.error_count, 1);
        assert!((daily.latency.avg - 216.666_666).abs() < 0.01);
        assert!((daily.latency.min - 150.0).abs() < f64::EPSILON);
        assert!((daily.latency.max - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn incremental_mean_matches_batch_mean() {
        let rates = UsageRates::default();
        let samples = [12.0, 850.0, 3.5, 99.0, 400.25, 7.75, 1234.0];
        let mut daily = DailyUsage::empty(&key());

        for sample in samples {
            daily.fold(&event(1, 1, sample, false), &rates);
        }

        let expected: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((daily.latency.avg - expected).abs() < 1e-9);
    }

    #[test]
    fn first_sample_replaces_min_sentinel() {
        let rates = UsageRates::default();
        let mut daily = DailyUsage::empty(&key());
        assert!(daily.latency.min.is_infinite());

        daily.fold(&event(1, 1, 42.0, false), &rates);
        assert!((daily.latency.min - 42.0).abs() < f64::EPSILON);
        assert!((daily.latency.avg - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cost_accrual_uses_rates() {
        let rates = UsageRates {
            compute_rate_per_ms: 0.001,
            input_rate_per_token: 0.01,
            output_rate_per_token: 0.02,
        };
        let mut daily = DailyUsage::empty(&key());
        let event_cost = daily.fold(&event(100, 50, 500.0, false), &rates);

        // compute: 500 * 0.001 = 0.5; tokens: 100*0.01 + 50*0.02 = 2.0
        assert!((daily.cost.compute - 0.5).abs() < 1e-9);
        assert!((daily.cost.tokens - 2.0).abs() < 1e-9);
        assert!((daily.cost.total - 2.5).abs() < 1e-9);
        assert!((event_cost - 2.5).abs() < 1e-9);
    }

    #[test]
    fn percentile_placeholders_stay_zero() {
        let rates = UsageRates::default();
        let mut daily = DailyUsage::empty(&key());
        daily.fold(&event(1, 1, 100.0, false), &rates);
        assert!((daily.latency.p95).abs() < f64::EPSILON);
        assert!((daily.latency.p99).abs() < f64::EPSILON);
    }

    #[test]
    fn daily_usage_serializes_controller_contract_fields() {
        let rates = UsageRates::default();
        let mut daily = DailyUsage::empty(&key());
        daily.fold(&event(10, 5, 100.0, false), &rates);

        let json = serde_json::to_value(&daily).unwrap();
        assert!(json["tokenCount"]["total"].is_number());
        assert!(json["cost"]["compute"].is_number());
        assert!(json["latency"]["avg"].is_number());
        assert_eq!(json["requestCount"], 1);
    }
}
