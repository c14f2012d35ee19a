//! Beta-geometric / negative-binomial (BG/NBD) purchase-count model.
//!
//! While active, a customer purchases as a Poisson process with rate
//! `lambda ~ Gamma(r, alpha)`. After every purchase they drop out with
//! probability `p ~ Beta(a, b)`. Both latent quantities are integrated out in
//! closed form, so fitting only searches over `(r, alpha, a, b)`.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::optimize::{nelder_mead, SearchFailure};
use super::special::{ln_beta, ln_gamma, ln_hyp2f1, log_add_exp};
use super::{penalized_mean_nll, CountModel, FitOptions, PurchaseHistory};
use crate::error::{CltvError, CltvResult};

const MODEL_NAME: &str = "BG/NBD";

/// Fewest customers the four-parameter fit accepts
pub const MIN_CUSTOMERS: usize = 4;

/// Largest age on the rescaled time axis used during fitting
const TIME_SCALE_TARGET: f64 = 10.0;

/// Population hyperparameters on the unscaled time axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaGeoParams {
    /// Shape of the Gamma prior on the purchase rate
    pub r: f64,
    /// Scale of the Gamma prior on the purchase rate
    pub alpha: f64,
    /// Beta prior on the dropout probability
    pub a: f64,
    pub b: f64,
}

impl BetaGeoParams {
    fn as_array(&self) -> [f64; 4] {
        [self.r, self.alpha, self.a, self.b]
    }
}

/// Fitted BG/NBD model
#[derive(Debug, Clone, PartialEq)]
pub struct BetaGeoModel {
    pub params: BetaGeoParams,
    pub penalizer: f64,
    /// Mean per-customer log-likelihood at the optimum (rescaled time axis)
    pub mean_log_likelihood: f64,
    pub iterations: usize,
    pub customers: usize,
}

impl BetaGeoModel {
    /// Wrap known parameters, e.g. from an earlier run.
    pub fn from_params(params: BetaGeoParams) -> Self {
        Self {
            params,
            penalizer: 0.0,
            mean_log_likelihood: f64::NAN,
            iterations: 0,
            customers: 0,
        }
    }

    /// Maximum-likelihood fit over every customer's (frequency, recency, age).
    pub fn fit(histories: &[PurchaseHistory], options: &FitOptions) -> CltvResult<Self> {
        if histories.len() < MIN_CUSTOMERS {
            return Err(CltvError::InsufficientData {
                model: MODEL_NAME,
                customers: histories.len(),
                required: MIN_CUSTOMERS,
            });
        }
        for (index, h) in histories.iter().enumerate() {
            h.check(index)?;
        }

        let max_age = histories.iter().map(|h| h.age).fold(0.0_f64, f64::max);
        if max_age <= 0.0 {
            return Err(CltvError::IllConditioned {
                model: MODEL_NAME,
                reason: "every customer has zero age".to_string(),
            });
        }
        let scale = TIME_SCALE_TARGET / max_age;
        let scaled: Vec<PurchaseHistory> = histories
            .iter()
            .map(|h| PurchaseHistory {
                frequency: h.frequency,
                recency: h.recency * scale,
                age: h.age * scale,
            })
            .collect();

        let penalizer = options.penalizer;
        let objective = |log_params: &Array1<f64>| {
            let params = log_params.mapv(f64::exp);
            let p = BetaGeoParams {
                r: params[0],
                alpha: params[1],
                a: params[2],
                b: params[3],
            };
            penalized_mean_nll(&scaled, &p.as_array(), penalizer, |h| {
                Self::log_likelihood(&p, h)
            })
        };

        let start = Array1::<f64>::zeros(4);
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
        let params = BetaGeoParams {
            r: fitted[0],
            alpha: fitted[1] / scale,
            a: fitted[2],
            b: fitted[3],
        };
        if params.as_array().iter().any(|p| !p.is_finite() || *p <= 1e-12) {
            return Err(CltvError::IllConditioned {
                model: MODEL_NAME,
                reason: format!("degenerate parameters {params:?}"),
            });
        }

        log::info!(
            "{MODEL_NAME} fitted on {} customers in {} iterations: \
             r={:.4} alpha={:.4} a={:.4} b={:.4}",
            histories.len(),
            minimum.iterations,
            params.r,
            params.alpha,
            params.a,
            params.b
        );

        Ok(Self {
            params,
            penalizer,
            mean_log_likelihood: -(minimum.value
                - penalizer * fitted.iter().map(|p| p * p).sum::<f64>()),
            iterations: minimum.iterations,
            customers: histories.len(),
        })
    }

    /// Log-likelihood of one customer's history under `params`.
    ///
    /// The two censoring cases (still active at `age`, or dropped out right
    /// after the purchase at `recency`) are combined with log-add-exp since
    /// they can differ by hundreds of orders of magnitude.
    pub fn log_likelihood(params: &BetaGeoParams, history: &PurchaseHistory) -> f64 {
        let BetaGeoParams { r, alpha, a, b } = *params;
        let PurchaseHistory {
            frequency: x,
            recency,
            age,
        } = *history;

        let a1 = ln_gamma(r + x) - ln_gamma(r) + r * alpha.ln();
        let a2 = ln_gamma(a + b) + ln_gamma(b + x) - ln_gamma(b) - ln_gamma(a + b + x);
        let a3 = -(r + x) * (alpha + age).ln();
        let a4 = if x > 0.0 {
            a.ln() - (b + x - 1.0).ln() - (r + x) * (alpha + recency).ln()
        } else {
            f64::NEG_INFINITY
        };
        a1 + a2 + log_add_exp(a3, a4)
    }

    /// Expected purchases of a randomly chosen new customer in a window of
    /// length `t`.
    pub fn expected_purchases(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        let BetaGeoParams { r, alpha, a, b } = self.params;
        let ln_hyp = ln_hyp2f1(r, b, a + b - 1.0, t / (alpha + t));
        let survival = (ln_hyp + r * (alpha / (alpha + t)).ln()).exp_m1();
        (a + b - 1.0) / (a - 1.0) * -survival
    }

    /// Probability that a randomly chosen customer makes exactly `n`
    /// purchases in a window of length `t`.
    pub fn probability_of_purchases(&self, t: f64, n: u32) -> f64 {
        let BetaGeoParams { r, alpha, a, b } = self.params;
        if t <= 0.0 {
            return if n == 0 { 1.0 } else { 0.0 };
        }
        let n = f64::from(n);
        let ln_stay = (alpha / (alpha + t)).ln();
        let ln_buy = (t / (alpha + t)).ln();
        let ln_beta_ab = ln_beta(a, b);

        let first = (ln_beta(a, b + n) - ln_beta_ab + ln_gamma(r + n) - ln_gamma(r)
            - ln_gamma(n + 1.0)
            + r * ln_stay
            + n * ln_buy)
            .exp();
        if n == 0.0 {
            return first;
        }

        let mut finite_sum = 0.0;
        let mut j = 0.0;
        while j < n {
            finite_sum +=
                (ln_gamma(r + j) - ln_gamma(r) - ln_gamma(j + 1.0) + j * ln_buy).exp();
            j += 1.0;
        }
        let second = (ln_beta(a + 1.0, b + n - 1.0) - ln_beta_ab).exp()
            * (1.0 - (r * ln_stay).exp() * finite_sum);
        first + second
    }
}

impl CountModel for BetaGeoModel {
    fn name(&self) -> &'static str {
        MODEL_NAME
    }

    fn conditional_expected_purchases(&self, t: f64, history: &PurchaseHistory) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        let BetaGeoParams { r, alpha, a, b } = self.params;
        let PurchaseHistory {
            frequency: x,
            recency,
            age,
        } = *history;

        let z = t / (alpha + age + t);
        let ln_hyp = ln_hyp2f1(r + x, b + x, a + b + x - 1.0, z);
        let first = (a + b + x - 1.0) / (a - 1.0);
        let second = -(ln_hyp + (r + x) * ((alpha + age) / (alpha + age + t)).ln()).exp_m1();

        let denominator = if x > 0.0 {
            1.0 + a / (b + x - 1.0) * ((alpha + age) / (alpha + recency)).powf(r + x)
        } else {
            1.0
        };
        first * second / denominator
    }

    fn probability_alive(&self, history: &PurchaseHistory) -> f64 {
        let BetaGeoParams { r, alpha, a, b } = self.params;
        let PurchaseHistory {
            frequency: x,
            recency,
            age,
        } = *history;
        if x <= 0.0 {
            return 1.0;
        }
        let log_div = (r + x) * ((alpha + age) / (alpha + recency)).ln() + (a / (b + x - 1.0)).ln();
        1.0 / (1.0 + log_div.exp())
    }
}
