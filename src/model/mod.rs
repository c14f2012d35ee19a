//! Probabilistic purchase-count and spend models.
//!
//! Both model families are closed-form mixture likelihoods fitted by maximum
//! likelihood. They are independent of each other and only meet in
//! [`crate::clv`], through the [`CountModel`] and [`MonetaryModel`] traits.

pub mod bgnbd;
pub mod gamma_gamma;
pub mod optimize;
pub mod special;

pub use bgnbd::{BetaGeoModel, BetaGeoParams};
pub use gamma_gamma::{GammaGammaModel, GammaGammaParams};
pub use optimize::OptimizerSettings;

use rayon::prelude::*;

use crate::error::{CltvError, CltvResult};

/// Repeat-purchase history of one customer, in model time units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurchaseHistory {
    pub frequency: f64,
    pub recency: f64,
    pub age: f64,
}

impl PurchaseHistory {
    /// Check `age >= recency >= 0` and a non-negative frequency; `index`
    /// identifies the history in the error.
    pub fn check(&self, index: usize) -> CltvResult<()> {
        let invalid = |reason: String| CltvError::InvalidHistory { index, reason };
        if !(self.frequency.is_finite() && self.frequency >= 0.0) {
            return Err(invalid(format!("frequency {} is not a count", self.frequency)));
        }
        if !(self.recency.is_finite() && self.recency >= 0.0) {
            return Err(invalid(format!("negative recency {}", self.recency)));
        }
        if !(self.age.is_finite() && self.age >= self.recency) {
            return Err(invalid(format!(
                "age {} is smaller than recency {}",
                self.age, self.recency
            )));
        }
        Ok(())
    }
}

/// A fitted counting-process model answering per-customer purchase queries.
pub trait CountModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expected number of purchases in the next `t` time units.
    fn conditional_expected_purchases(&self, t: f64, history: &PurchaseHistory) -> f64;

    /// Posterior probability that the customer is still active.
    fn probability_alive(&self, history: &PurchaseHistory) -> f64;
}

/// A fitted spend model answering per-customer average-profit queries.
pub trait MonetaryModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Posterior mean spend per transaction given `frequency` purchase
    /// events averaging `monetary`.
    fn conditional_expected_average_profit(&self, frequency: f64, monetary: f64) -> f64;
}

/// Options shared by the model fits
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// L2 penalty on the model parameters
    pub penalizer: f64,
    pub optimizer: OptimizerSettings,
}

/// Mean negative log-likelihood plus L2 penalty.
///
/// Per-customer terms are mapped in parallel into an order-preserving buffer
/// and summed sequentially, so the value does not depend on thread scheduling.
pub(crate) fn penalized_mean_nll<T, F>(rows: &[T], params: &[f64], penalizer: f64, term: F) -> f64
where
    T: Sync,
    F: Fn(&T) -> f64 + Sync,
{
    let terms: Vec<f64> = rows.par_iter().map(|row| term(row)).collect();
    let total: f64 = terms.iter().sum();
    let penalty: f64 = params.iter().map(|p| p * p).sum::<f64>() * penalizer;
    -total / rows.len() as f64 + penalty
}
