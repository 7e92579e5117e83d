//! Cost Ledger (§4.1) — pure functions over price tables and job usage.
//!
//! Grounded on the `other_examples` cost-tracker's `ModelPricing` /
//! `TokenBudget` shapes, narrowed to this spec's exact contract: a static
//! `(provider, model) -> (price_in, price_out)` table, a deployment-wide
//! fallback pair, and four-tier budget-status classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, JobStatus, Usage};
use super::project::Project;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub in_per_million_usd: f64,
    pub out_per_million_usd: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum CostLedgerError {
    #[error("no pricing configured for provider={provider} model={model} and no deployment default")]
    PricingUnknown { provider: String, model: String },
}

/// Static per-deployment price table, keyed by `(provider, model)`.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: std::collections::HashMap<(String, String), Price>,
    default: Option<Price>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, provider: impl Into<String>, model: impl Into<String>, price: Price) -> Self {
        self.prices.insert((provider.into(), model.into()), price);
        self
    }

    pub fn with_default(mut self, price: Price) -> Self {
        self.default = Some(price);
        self
    }

    fn lookup(&self, provider: &str, model: &str) -> Option<Price> {
        self.prices
            .get(&(provider.to_string(), model.to_string()))
            .copied()
            .or(self.default)
    }
}

/// The four spend-relative-to-allocation tiers from §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatusKind {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub has_budget: bool,
    pub allocated: Option<f64>,
    pub actual: f64,
    /// `None` represents "+∞" (no budget configured).
    pub remaining: Option<f64>,
    pub pct_used: Option<f64>,
    pub status: BudgetStatusKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub total_cost: f64,
    pub total_jobs: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_per_job: f64,
}

/// Pure cost-accounting logic over a static [`PricingTable`].
#[derive(Debug, Clone, Default)]
pub struct CostLedger {
    pricing: PricingTable,
}

impl CostLedger {
    pub fn new(pricing: PricingTable) -> Self {
        Self { pricing }
    }

    /// `cost(provider, model, tokens_in, tokens_out)` from §4.1.
    pub fn cost(
        &self,
        provider: &str,
        model: &str,
        tokens_in: i64,
        tokens_out: i64,
    ) -> Result<f64, CostLedgerError> {
        let price = self
            .pricing
            .lookup(provider, model)
            .ok_or_else(|| CostLedgerError::PricingUnknown {
                provider: provider.to_string(),
                model: model.to_string(),
            })?;

        Ok((tokens_in as f64 / 1_000_000.0) * price.in_per_million_usd
            + (tokens_out as f64 / 1_000_000.0) * price.out_per_million_usd)
    }

    /// Rounds to two decimal places for presentation only; callers doing
    /// further comparisons must use the unrounded `cost()` value (§4.1).
    pub fn round_for_display(usd: f64) -> f64 {
        (usd * 100.0).round() / 100.0
    }

    /// `apply(job, usage)`: records usage and cost on the job row,
    /// returning the incremental cost added. The status transition that
    /// accompanies this (to `Running`/`Completed`) is the Dispatcher's
    /// responsibility, not the ledger's.
    pub fn apply(
        &self,
        job: &mut Job,
        provider: &str,
        model: &str,
        usage: Usage,
    ) -> Result<f64, CostLedgerError> {
        let incremental = self.cost(provider, model, usage.tokens_in, usage.tokens_out)?;
        job.usage.accumulate(usage);
        job.actual_cost += incremental;
        Ok(incremental)
    }

    /// `project_period(project_id, window)` from §4.1. Failed jobs still
    /// count toward `total_cost` — partial tokens were spent regardless
    /// of outcome.
    pub fn project_period(
        &self,
        project_id: Uuid,
        jobs: &[Job],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> PeriodSummary {
        let mut summary = PeriodSummary::default();

        for job in jobs.iter().filter(|j| j.project_id == project_id) {
            let in_window = match (window, job.completed_at) {
                (Some((start, end)), Some(completed_at)) => completed_at >= start && completed_at <= end,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if !in_window {
                continue;
            }

            summary.total_jobs += 1;
            summary.total_cost += job.actual_cost;
            match job.status {
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed | JobStatus::DeadLetter => summary.failed += 1,
                _ => {}
            }
        }

        summary.average_per_job = if summary.total_jobs > 0 {
            summary.total_cost / summary.total_jobs as f64
        } else {
            0.0
        };

        summary
    }

    /// `budget_status(project_id)` from §4.1. `actual` is the caller's
    /// already-aggregated spend (typically from [`project_period`] with no
    /// window), kept as a parameter so callers can reuse one aggregation
    /// pass instead of the ledger re-scanning jobs.
    pub fn budget_status(&self, project: &Project, actual: f64) -> BudgetStatus {
        let Some(allocated) = project.budget_allocated else {
            return BudgetStatus {
                has_budget: false,
                allocated: None,
                actual,
                remaining: None,
                pct_used: None,
                status: BudgetStatusKind::Ok,
            };
        };

        let remaining = allocated - actual;
        let pct_used = if allocated > 0.0 { actual / allocated * 100.0 } else { f64::INFINITY };

        let status = if pct_used >= 100.0 {
            BudgetStatusKind::Exceeded
        } else if pct_used >= 95.0 {
            BudgetStatusKind::Critical
        } else if pct_used >= 80.0 {
            BudgetStatusKind::Warning
        } else {
            BudgetStatusKind::Ok
        };

        BudgetStatus {
            has_budget: true,
            allocated: Some(allocated),
            actual,
            remaining: Some(remaining),
            pct_used: Some(pct_used),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{JobSubmission, JobType};

    fn ledger() -> CostLedger {
        CostLedger::new(
            PricingTable::new().with_price(
                "anthropic",
                "claude-sonnet",
                Price { in_per_million_usd: 3.00, out_per_million_usd: 15.00 },
            ),
        )
    }

    #[test]
    fn cost_matches_the_happy_path_scenario() {
        // §8 scenario 1: in=1000, out=500 @ $3/$15 per million => $0.0105.
        let ledger = ledger();
        let cost = ledger.cost("anthropic", "claude-sonnet", 1_000, 500).unwrap();
        assert!((cost - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn unknown_pricing_without_default_fails() {
        let ledger = CostLedger::new(PricingTable::new());
        let err = ledger.cost("openai", "gpt-4o", 100, 100).unwrap_err();
        assert!(matches!(err, CostLedgerError::PricingUnknown { .. }));
    }

    #[test]
    fn unknown_pricing_falls_back_to_default() {
        let ledger = CostLedger::new(
            PricingTable::new().with_default(Price { in_per_million_usd: 1.0, out_per_million_usd: 2.0 }),
        );
        let cost = ledger.cost("mystery", "model-x", 1_000_000, 0).unwrap();
        assert!((cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn apply_accumulates_usage_and_cost() {
        let ledger = ledger();
        let mut job = Job::from_submission(
            JobSubmission {
                project_id: Uuid::new_v4(),
                job_type: JobType::Implement,
                payload: serde_json::json!({}),
                assigned_agent_id: None,
                max_retries: None,
            },
            Utc::now(),
        );

        ledger.apply(&mut job, "anthropic", "claude-sonnet", Usage { tokens_in: 1_000, tokens_out: 500 }).unwrap();
        assert!((job.actual_cost - 0.0105).abs() < 1e-9);
        assert_eq!(job.usage.total(), 1_500);

        ledger.apply(&mut job, "anthropic", "claude-sonnet", Usage { tokens_in: 1_000, tokens_out: 500 }).unwrap();
        assert!((job.actual_cost - 0.021).abs() < 1e-9);
    }

    #[test]
    fn budget_status_boundaries() {
        let ledger = ledger();
        let project = Project { id: Uuid::new_v4(), budget_allocated: Some(100.0) };

        assert_eq!(ledger.budget_status(&project, 79.999).status, BudgetStatusKind::Ok);
        assert_eq!(ledger.budget_status(&project, 80.0).status, BudgetStatusKind::Warning);
        assert_eq!(ledger.budget_status(&project, 94.999).status, BudgetStatusKind::Warning);
        assert_eq!(ledger.budget_status(&project, 95.0).status, BudgetStatusKind::Critical);
        assert_eq!(ledger.budget_status(&project, 99.999).status, BudgetStatusKind::Critical);
        assert_eq!(ledger.budget_status(&project, 100.0).status, BudgetStatusKind::Exceeded);
        assert_eq!(ledger.budget_status(&project, 150.0).status, BudgetStatusKind::Exceeded);
    }

    #[test]
    fn no_budget_means_ok_with_infinite_remaining() {
        let ledger = ledger();
        let project = Project { id: Uuid::new_v4(), budget_allocated: None };
        let status = ledger.budget_status(&project, 1_000_000.0);
        assert!(!status.has_budget);
        assert_eq!(status.status, BudgetStatusKind::Ok);
        assert_eq!(status.remaining, None);
    }
}
