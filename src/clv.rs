//! Combines a count model and a spend model into a discounted lifetime value.

use crate::model::{CountModel, MonetaryModel, PurchaseHistory};

/// Forecast window and discounting applied by [`customer_lifetime_value`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueHorizon {
    /// Number of discounting periods to project
    pub periods: u32,
    /// Length of one period in model time units (4.345 weeks per month)
    pub period_length: f64,
    /// Discount rate applied per period
    pub discount_rate: f64,
}

/// Discounted expected value of a customer's purchases over the horizon.
///
/// Each period contributes the expected profit per transaction times the
/// purchases expected inside that period, discounted by
/// `1 / (1 + discount_rate)^period`.
pub fn customer_lifetime_value<C, M>(
    count_model: &C,
    monetary_model: &M,
    history: &PurchaseHistory,
    monetary: f64,
    horizon: &ValueHorizon,
) -> f64
where
    C: CountModel + ?Sized,
    M: MonetaryModel + ?Sized,
{
    let profit = monetary_model.conditional_expected_average_profit(history.frequency, monetary);

    let mut value = 0.0;
    let mut previous = 0.0;
    for period in 1..=horizon.periods {
        let elapsed = f64::from(period) * horizon.period_length;
        let cumulative = count_model.conditional_expected_purchases(elapsed, history);
        let discount = (1.0 + horizon.discount_rate).powi(period as i32);
        value += profit * (cumulative - previous) / discount;
        previous = cumulative;
    }
    value
}
