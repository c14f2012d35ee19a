//! End-to-end probabilistic CLTV run: aggregate, fit, combine, segment.

use rayon::prelude::*;
use serde::Serialize;

use crate::clv::{customer_lifetime_value, ValueHorizon};
use crate::config::PipelineConfig;
use crate::data::{CustomerId, TransactionRecord};
use crate::error::{CltvError, CltvResult};
use crate::historical::{historical_cltv, HistoricalReport};
use crate::model::bgnbd;
use crate::model::gamma_gamma::SpendObservation;
use crate::model::{BetaGeoModel, CountModel, GammaGammaModel, MonetaryModel, PurchaseHistory};
use crate::rfm::{score_customers, RfmRow};
use crate::segment::{quantile_segments, Segmentation, Tier};
use crate::summary::{
    aggregate, validate_summaries, CustomerSummary, DroppedCustomer, ValidatedSummaries,
};

/// Fewest repeat customers a probabilistic run accepts; covers both fits
pub const MIN_FIT_CUSTOMERS: usize = bgnbd::MIN_CUSTOMERS;

/// Forecast columns for one repeat customer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerValue {
    pub customer_id: CustomerId,
    pub recency: f64,
    pub age: f64,
    pub frequency: u32,
    pub monetary: f64,
    /// One entry per configured purchase horizon, in the same order
    pub expected_purchases: Vec<f64>,
    pub probability_alive: f64,
    pub expected_average_profit: f64,
    pub clv: f64,
    pub segment: Tier,
}

/// Aggregate CLV figures of one segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStats {
    pub tier: Tier,
    pub customers: usize,
    pub mean_clv: f64,
    pub total_clv: f64,
}

#[derive(Debug, Clone)]
pub struct CltvReport {
    pub count_model: BetaGeoModel,
    pub monetary_model: GammaGammaModel,
    pub horizons: Vec<u32>,
    pub value_horizon: ValueHorizon,
    pub rows: Vec<CustomerValue>,
    pub segmentation: Segmentation,
    /// Customers left out of the fits for having a single purchase event
    pub excluded_single_purchase: usize,
    pub dropped: Vec<DroppedCustomer>,
}

/// Forecast for an ad-hoc purchase history
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerForecast {
    pub expected_purchases: Vec<(u32, f64)>,
    pub probability_alive: f64,
    pub expected_average_profit: f64,
    pub clv: f64,
    /// Tier the value would fall into within the fitted cohort
    pub segment: Tier,
}

impl CltvReport {
    /// Row of one fitted customer; `rows` is kept in ascending id order.
    pub fn row(&self, customer_id: CustomerId) -> Option<&CustomerValue> {
        self.rows
            .binary_search_by_key(&customer_id, |r| r.customer_id)
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Per-segment customer count, mean and total CLV, top segment first.
    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        let mut stats: Vec<SegmentStats> = (0..self.segmentation.buckets)
            .rev()
            .map(|bucket| SegmentStats {
                tier: Tier {
                    bucket,
                    buckets: self.segmentation.buckets,
                },
                customers: 0,
                mean_clv: 0.0,
                total_clv: 0.0,
            })
            .collect();
        let top = self.segmentation.buckets - 1;
        for row in &self.rows {
            let entry = &mut stats[top - row.segment.bucket];
            entry.customers += 1;
            entry.total_clv += row.clv;
        }
        for entry in &mut stats {
            if entry.customers > 0 {
                entry.mean_clv = entry.total_clv / entry.customers as f64;
            }
        }
        stats
    }

    /// Score a purchase history that was not part of the fit.
    pub fn predict_customer(
        &self,
        history: &PurchaseHistory,
        monetary: f64,
    ) -> CltvResult<CustomerForecast> {
        history.check(0)?;
        if !(history.frequency >= 1.0 && monetary.is_finite() && monetary > 0.0) {
            return Err(CltvError::InvalidMonetary {
                customer_id: 0,
                frequency: history.frequency,
                monetary,
            });
        }

        let expected_purchases = self
            .horizons
            .iter()
            .map(|&h| (h, self.count_model.conditional_expected_purchases(f64::from(h), history)))
            .collect();
        let clv = customer_lifetime_value(
            &self.count_model,
            &self.monetary_model,
            history,
            monetary,
            &self.value_horizon,
        );

        // Rank against the cohort the boundaries were drawn from.
        let buckets = self.segmentation.buckets;
        let below = self.rows.iter().filter(|r| r.clv < clv).count();
        let bucket = if self.rows.is_empty() {
            0
        } else {
            (below * buckets / self.rows.len()).min(buckets - 1)
        };

        Ok(CustomerForecast {
            expected_purchases,
            probability_alive: self.count_model.probability_alive(history),
            expected_average_profit: self
                .monetary_model
                .conditional_expected_average_profit(history.frequency, monetary),
            clv,
            segment: Tier { bucket, buckets },
        })
    }
}

/// Customers ranked by expected purchases in the next `t` time units,
/// highest first, ties by ascending customer id. At most `n` are returned.
pub fn top_expected_purchasers<C>(
    model: &C,
    summaries: &[CustomerSummary],
    t: f64,
    n: usize,
) -> Vec<(CustomerId, f64)>
where
    C: CountModel + ?Sized,
{
    let mut ranked: Vec<(CustomerId, f64)> = summaries
        .iter()
        .map(|s| (s.customer_id, model.conditional_expected_purchases(t, &s.history())))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked
}

pub struct CltvPipeline {
    config: PipelineConfig,
}

impl CltvPipeline {
    pub fn new(config: PipelineConfig) -> CltvResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Aggregate records into validated per-customer summaries.
    pub fn summarize(&self, records: &[TransactionRecord]) -> CltvResult<ValidatedSummaries> {
        let summaries = aggregate(
            records,
            self.config.analysis_cutoff,
            self.config.time_unit_days,
        )?;
        validate_summaries(summaries, self.config.validation)
    }

    pub fn run(&self, records: &[TransactionRecord]) -> CltvResult<CltvReport> {
        let validated = self.summarize(records)?;
        self.run_summaries(validated)
    }

    /// Fit both models on the repeat customers and value each of them.
    pub fn run_summaries(&self, validated: ValidatedSummaries) -> CltvResult<CltvReport> {
        let ValidatedSummaries { summaries, dropped } = validated;
        if summaries.is_empty() {
            return Err(CltvError::EmptyInput);
        }
        let (mut eligible, single): (Vec<CustomerSummary>, Vec<CustomerSummary>) =
            summaries.into_iter().partition(CustomerSummary::is_repeat_customer);
        eligible.sort_by_key(|s| s.customer_id);
        log::info!(
            "{} repeat customers eligible for fitting, {} single-purchase customers excluded",
            eligible.len(),
            single.len()
        );
        if eligible.len() < MIN_FIT_CUSTOMERS {
            return Err(CltvError::InsufficientData {
                model: "CLTV",
                customers: eligible.len(),
                required: MIN_FIT_CUSTOMERS,
            });
        }

        let histories: Vec<PurchaseHistory> =
            eligible.iter().map(CustomerSummary::history).collect();
        let spend: Vec<SpendObservation> = eligible
            .iter()
            .map(|s| SpendObservation {
                customer_id: s.customer_id,
                frequency: f64::from(s.frequency),
                monetary: s.monetary,
            })
            .collect();

        let count_options = self.config.count_fit_options();
        let monetary_options = self.config.monetary_fit_options();
        let (count_model, monetary_model) = rayon::join(
            || BetaGeoModel::fit(&histories, &count_options),
            || GammaGammaModel::fit(&spend, &monetary_options),
        );
        let count_model = count_model?;
        let monetary_model = monetary_model?;

        let horizons = self.config.purchase_horizons.clone();
        let value_horizon = self.config.value_horizon();

        let values: Vec<(Vec<f64>, f64, f64, f64)> = eligible
            .par_iter()
            .map(|s| {
                let history = s.history();
                let expected: Vec<f64> = horizons
                    .iter()
                    .map(|&h| count_model.conditional_expected_purchases(f64::from(h), &history))
                    .collect();
                let alive = count_model.probability_alive(&history);
                let profit = monetary_model
                    .conditional_expected_average_profit(history.frequency, s.monetary);
                let clv = customer_lifetime_value(
                    &count_model,
                    &monetary_model,
                    &history,
                    s.monetary,
                    &value_horizon,
                );
                (expected, alive, profit, clv)
            })
            .collect();

        let segmentation = quantile_segments(
            &eligible
                .iter()
                .zip(&values)
                .map(|(s, v)| (s.customer_id, v.3))
                .collect::<Vec<_>>(),
            self.config.segments,
        )?;

        let rows = eligible
            .iter()
            .zip(values)
            .map(|(s, (expected_purchases, probability_alive, expected_average_profit, clv))| {
                let segment = segmentation
                    .tier(s.customer_id)
                    .ok_or_else(|| CltvError::InvalidSummary {
                        customer_id: s.customer_id,
                        reason: "customer missing from segmentation".to_string(),
                    })?;
                Ok(CustomerValue {
                    customer_id: s.customer_id,
                    recency: s.recency,
                    age: s.age,
                    frequency: s.frequency,
                    monetary: s.monetary,
                    expected_purchases,
                    probability_alive,
                    expected_average_profit,
                    clv,
                    segment,
                })
            })
            .collect::<CltvResult<Vec<_>>>()?;

        log::info!("Valued {} customers over {} periods", rows.len(), value_horizon.periods);

        Ok(CltvReport {
            count_model,
            monetary_model,
            horizons,
            value_horizon,
            rows,
            segmentation,
            excluded_single_purchase: single.len(),
            dropped,
        })
    }

    pub fn historical(&self, records: &[TransactionRecord]) -> CltvResult<HistoricalReport> {
        let validated = self.summarize(records)?;
        historical_cltv(&validated.summaries, self.config.profit_rate, self.config.segments)
    }

    pub fn rfm(&self, records: &[TransactionRecord]) -> CltvResult<Vec<RfmRow>> {
        let validated = self.summarize(records)?;
        score_customers(
            &validated.summaries,
            self.config.analysis_cutoff,
            self.config.rfm_segments,
        )
    }
}
