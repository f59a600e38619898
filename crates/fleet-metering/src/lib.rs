//! # Fleet Metering
//!
//! Usage aggregation and billing roll-up for the Agent Fleet platform.
//!
//! This crate provides:
//! - [`UsageAggregator`]: folds per-request usage events into daily
//!   aggregates with streaming mean/min/max and cost accrual
//! - [`UsageBatcher`]: the fire-and-forget client-side batching path
//! - [`BillingEngine`]: idempotent monthly roll-up of daily aggregates
//! - In-memory reference implementations of the document stores

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod billing;
pub mod store;
pub mod usage;

// Re-export main types
pub use batch::{BatcherConfig, UsageBatcher, UsageSink};
pub use billing::{
    BillingEngine, BillingStatus, BillingSummary, DeploymentCharge, MonthlyBilling,
};
pub use store::{
    BillingStore, DailyUsageKey, InMemoryBillingStore, InMemoryDeploymentStore,
    InMemoryUsageStore, UsageStore,
};
pub use usage::{
    CostBreakdown, DailyUsage, LatencyStats, TokenCount, UsageAggregator, UsageEvent, UsageRates,
};
