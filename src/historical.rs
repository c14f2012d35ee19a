//! Deterministic CLTV from observed spend and a cohort-wide churn rate.

use serde::Serialize;

use crate::data::CustomerId;
use crate::error::{CltvError, CltvResult};
use crate::segment::{quantile_segments, Segmentation, Tier};
use crate::summary::CustomerSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalRow {
    pub customer_id: CustomerId,
    /// Distinct purchase events
    pub transactions: u32,
    pub total_spend: f64,
    pub average_order_value: f64,
    pub purchase_frequency: f64,
    pub profit_margin: f64,
    pub customer_value: f64,
    pub cltv: f64,
    pub segment: Tier,
}

#[derive(Debug, Clone)]
pub struct HistoricalReport {
    pub rows: Vec<HistoricalRow>,
    pub customer_count: usize,
    pub repeat_rate: f64,
    pub churn_rate: f64,
    pub segmentation: Segmentation,
}

/// `cltv = (average_order_value * purchase_frequency) / churn_rate * profit_margin`
/// for every customer, single-purchase ones included.
///
/// The churn rate is one minus the share of customers with more than one
/// purchase event; a cohort where everyone came back has no defined churn.
pub fn historical_cltv(
    summaries: &[CustomerSummary],
    profit_rate: f64,
    segments: usize,
) -> CltvResult<HistoricalReport> {
    if summaries.is_empty() {
        return Err(CltvError::EmptyInput);
    }
    let customer_count = summaries.len();
    let n = customer_count as f64;
    let repeat_rate = summaries.iter().filter(|s| s.is_repeat_customer()).count() as f64 / n;
    let churn_rate = 1.0 - repeat_rate;
    if churn_rate <= 0.0 {
        return Err(CltvError::DegenerateChurn);
    }

    let values: Vec<(CustomerId, f64, f64, f64, f64, f64)> = summaries
        .iter()
        .map(|s| {
            let transactions = f64::from(s.frequency);
            let average_order_value = s.total_spend / transactions;
            let purchase_frequency = transactions / n;
            let profit_margin = s.total_spend * profit_rate;
            let customer_value = average_order_value * purchase_frequency;
            let cltv = customer_value / churn_rate * profit_margin;
            (
                s.customer_id,
                average_order_value,
                purchase_frequency,
                profit_margin,
                customer_value,
                cltv,
            )
        })
        .collect();

    let segmentation = quantile_segments(
        &values.iter().map(|v| (v.0, v.5)).collect::<Vec<_>>(),
        segments,
    )?;

    let rows = summaries
        .iter()
        .zip(values)
        .map(|(s, value)| {
            let (
                customer_id,
                average_order_value,
                purchase_frequency,
                profit_margin,
                customer_value,
                cltv,
            ) = value;
            let segment = segmentation
                .tier(customer_id)
                .ok_or_else(|| CltvError::InvalidSummary {
                    customer_id,
                    reason: "customer missing from segmentation".to_string(),
                })?;
            Ok(HistoricalRow {
                customer_id,
                transactions: s.frequency,
                total_spend: s.total_spend,
                average_order_value,
                purchase_frequency,
                profit_margin,
                customer_value,
                cltv,
                segment,
            })
        })
        .collect::<CltvResult<Vec<_>>>()?;

    log::info!(
        "Historical CLTV over {customer_count} customers: \
         repeat rate {repeat_rate:.3}, churn rate {churn_rate:.3}"
    );

    Ok(HistoricalReport {
        rows,
        customer_count,
        repeat_rate,
        churn_rate,
        segmentation,
    })
}
