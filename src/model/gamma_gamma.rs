//! Gamma-Gamma spend model.
//!
//! Individual transaction values are `Gamma(p, nu)`, and the per-customer
//! scale `nu` is itself `Gamma(q, v)` across the population. The posterior
//! mean spend shrinks a customer's observed average towards the population
//! mean, less so the more transactions back that average.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::optimize::{nelder_mead, SearchFailure};
use super::special::ln_gamma;
use super::{penalized_mean_nll, FitOptions, MonetaryModel};
use crate::data::CustomerId;
use crate::error::{CltvError, CltvResult};

const MODEL_NAME: &str = "Gamma-Gamma";

/// Fewest customers the three-parameter fit accepts
pub const MIN_CUSTOMERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaGammaParams {
    /// Shape of the per-transaction spend distribution
    pub p: f64,
    /// Shape of the population prior on the spend scale
    pub q: f64,
    /// Scale of the population prior on the spend scale
    pub v: f64,
}

impl GammaGammaParams {
    fn as_array(&self) -> [f64; 3] {
        [self.p, self.q, self.v]
    }
}

/// One customer's input to the spend model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendObservation {
    pub customer_id: CustomerId,
    pub frequency: f64,
    pub monetary: f64,
}

/// Fitted Gamma-Gamma model
#[derive(Debug, Clone, PartialEq)]
pub struct GammaGammaModel {
    pub params: GammaGammaParams,
    pub penalizer: f64,
    pub mean_log_likelihood: f64,
    pub iterations: usize,
    pub customers: usize,
}

impl GammaGammaModel {
    pub fn from_params(params: GammaGammaParams) -> Self {
        Self {
            params,
            penalizer: 0.0,
            mean_log_likelihood: f64::NAN,
            iterations: 0,
            customers: 0,
        }
    }

    /// Maximum-likelihood fit over (frequency, monetary) pairs.
    ///
    /// Every pair must have `frequency >= 1` and `monetary > 0`.
    pub fn fit(observations: &[SpendObservation], options: &FitOptions) -> CltvResult<Self> {
        if observations.len() < MIN_CUSTOMERS {
            return Err(CltvError::InsufficientData {
                model: MODEL_NAME,
                customers: observations.len(),
                required: MIN_CUSTOMERS,
            });
        }
        if let Some(bad) = observations
            .iter()
            .find(|o| !(o.frequency >= 1.0 && o.monetary > 0.0 && o.monetary.is_finite()))
        {
            return Err(CltvError::InvalidMonetary {
                customer_id: bad.customer_id,
                frequency: bad.frequency,
                monetary: bad.monetary,
            });
        }

        let penalizer = options.penalizer;
        let objective = |log_params: &Array1<f64>| {
            let params = log_params.mapv(f64::exp);
            let gg = GammaGammaParams {
                p: params[0],
                q: params[1],
                v: params[2],
            };
            penalized_mean_nll(observations, &gg.as_array(), penalizer, |o| {
                Self::log_likelihood(&gg, o.frequency, o.monetary)
            })
        };

        let start = Array1::<f64>::zeros(3);
        let minimum =
            nelder_mead(objective, &start, &options.optimizer).map_err(|failure| match failure {
                SearchFailure::NonFiniteStart => CltvError::IllConditioned {
                    model: MODEL_NAME,
                    reason: "likelihood is not finite at the starting point".to_string(),
                },
                SearchFailure::MaxIterations(iterations) => CltvError::NotConverged {
                    model: MODEL_NAME,
                    iterations,
                },
            })?;

        let fitted = minimum.point.mapv(f64::exp);
        let params = GammaGammaParams {
            p: fitted[0],
            q: fitted[1],
            v: fitted[2],
        };
        if params.as_array().iter().any(|x| !x.is_finite() || *x <= 1e-12) {
            return Err(CltvError::IllConditioned {
                model: MODEL_NAME,
                reason: format!("degenerate parameters {params:?}"),
            });
        }
        // The posterior mean divides by p*x + q - 1 for the smallest x seen.
        let min_frequency = observations
            .iter()
            .map(|o| o.frequency)
            .fold(f64::INFINITY, f64::min);
        if params.p * min_frequency + params.q <= 1.0 {
            return Err(CltvError::IllConditioned {
                model: MODEL_NAME,
                reason: format!(
                    "posterior mean undefined for frequency {min_frequency} with p={:.4}, q={:.4}",
                    params.p, params.q
                ),
            });
        }

        log::info!(
            "{MODEL_NAME} fitted on {} customers in {} iterations: p={:.4} q={:.4} v={:.4}",
            observations.len(),
            minimum.iterations,
            params.p,
            params.q,
            params.v
        );
        if params.q <= 1.0 {
            log::warn!("{MODEL_NAME}: q={:.4} <= 1, population mean spend is undefined", params.q);
        }

        Ok(Self {
            params,
            penalizer,
            mean_log_likelihood: -(minimum.value
                - penalizer * fitted.iter().map(|x| x * x).sum::<f64>()),
            iterations: minimum.iterations,
            customers: observations.len(),
        })
    }

    /// Marginal log-likelihood of observing average spend `monetary` over
    /// `frequency` transactions, up to a constant.
    pub fn log_likelihood(params: &GammaGammaParams, frequency: f64, monetary: f64) -> f64 {
        let GammaGammaParams { p, q, v } = *params;
        let x = frequency;
        let px = p * x;
        ln_gamma(px + q) - ln_gamma(q) + q * v.ln() - ln_gamma(px)
            + (px - 1.0) * monetary.ln()
            + px * x.ln()
            - (px + q) * (x * monetary + v).ln()
    }

    /// Mean spend per transaction across the population, defined for q > 1.
    pub fn population_mean(&self) -> Option<f64> {
        let GammaGammaParams { p, q, v } = self.params;
        (q > 1.0).then(|| p * v / (q - 1.0))
    }
}

impl MonetaryModel for GammaGammaModel {
    fn name(&self) -> &'static str {
        MODEL_NAME
    }

    /// Weighted blend of the population mean and the observed average:
    /// `(q - 1) / (p x + q - 1) * p v / (q - 1) + p x / (p x + q - 1) * m`.
    fn conditional_expected_average_profit(&self, frequency: f64, monetary: f64) -> f64 {
        let GammaGammaParams { p, q, v } = self.params;
        let px = p * frequency;
        p * (v + frequency * monetary) / (px + q - 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OptimizerSettings;

    /// Published CDNOW spend estimates (Fader & Hardie 2013).
    fn cdnow() -> GammaGammaModel {
        GammaGammaModel::from_params(GammaGammaParams {
            p: 6.25,
            q: 3.74,
            v: 15.44,
        })
    }

    fn observations() -> Vec<SpendObservation> {
        (0..40u32)
            .map(|i| SpendObservation {
                customer_id: i64::from(i),
                frequency: f64::from(2 + (i * 7) % 9),
                monetary: 20.0 + f64::from((i * 37) % 200) + f64::from(i % 3) * 5.5,
            })
            .collect()
    }

    fn options(penalizer: f64) -> FitOptions {
        FitOptions {
            penalizer,
            optimizer: OptimizerSettings::default(),
        }
    }

    #[test]
    fn test_shrinkage_vanishes_with_many_transactions() {
        let model = cdnow();
        let observed = 120.0;
        let estimate = model.conditional_expected_average_profit(10_000.0, observed);
        assert!((estimate - observed).abs() / observed < 1e-3);
    }

    #[test]
    fn test_single_transaction_is_pulled_towards_population_mean() {
        let model = cdnow();
        let population = model.population_mean().unwrap();
        assert!((population - 35.22).abs() < 0.05);

        let observed = 200.0;
        let one = model.conditional_expected_average_profit(1.0, observed);
        let many = model.conditional_expected_average_profit(50.0, observed);
        assert!(one < many);
        assert!((one - population).abs() < (many - population).abs());
        assert!(one > population && one < observed);
    }

    #[test]
    fn test_zero_transactions_returns_population_mean() {
        let model = cdnow();
        let estimate = model.conditional_expected_average_profit(0.0, 0.0);
        assert!((estimate - model.population_mean().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_population_mean_undefined_for_small_q() {
        let model = GammaGammaModel::from_params(GammaGammaParams { p: 4.0, q: 0.8, v: 3.0 });
        assert_eq!(model.population_mean(), None);
    }

    #[test]
    fn test_fit_with_default_penalty() {
        let model = GammaGammaModel::fit(&observations(), &options(0.01)).unwrap();
        let p = model.params;
        assert!((p.p - 4.093).abs() < 2e-2, "{p:?}");
        assert!((p.q - 0.520).abs() < 1e-2, "{p:?}");
        assert!((p.v - 4.030).abs() < 2e-2, "{p:?}");
        assert_eq!(model.customers, 40);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let first = GammaGammaModel::fit(&observations(), &options(0.001)).unwrap();
        let second = GammaGammaModel::fit(&observations(), &options(0.001)).unwrap();
        assert_eq!(first.params, second.params);
    }

    #[test]
    fn test_invalid_monetary_is_fatal() {
        let mut data = observations();
        data[5].monetary = 0.0;
        assert!(matches!(
            GammaGammaModel::fit(&data, &options(0.01)),
            Err(CltvError::InvalidMonetary { customer_id: 5, .. })
        ));

        let mut data = observations();
        data[7].frequency = 0.0;
        assert!(matches!(
            GammaGammaModel::fit(&data, &options(0.01)),
            Err(CltvError::InvalidMonetary { customer_id: 7, .. })
        ));
    }
}
