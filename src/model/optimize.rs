//! Derivative-free Nelder-Mead minimizer used by the maximum-likelihood fits.
//!
//! The simplex starts from a fixed initial point with fixed perturbations, so
//! two runs on the same objective visit exactly the same vertices.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Stopping rules for the simplex search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Maximum number of simplex iterations before giving up
    pub max_iterations: usize,
    /// Largest allowed coordinate spread across the simplex at convergence
    pub x_tolerance: f64,
    /// Largest allowed objective spread across the simplex at convergence
    pub f_tolerance: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            x_tolerance: 1e-6,
            f_tolerance: 1e-9,
        }
    }
}

/// Result of a converged search
#[derive(Debug, Clone)]
pub struct Minimum {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
}

/// Why a search stopped without a usable minimum
#[derive(Debug, Clone, PartialEq)]
pub enum SearchFailure {
    /// The objective is not finite at the starting point
    NonFiniteStart,
    /// Iteration budget exhausted before the simplex collapsed
    MaxIterations(usize),
}

const REFLECTION: f64 = 1.0;
const EXPANSION: f64 = 2.0;
const CONTRACTION: f64 = 0.5;
const SHRINK: f64 = 0.5;
const NONZERO_STEP: f64 = 0.05;
const ZERO_STEP: f64 = 0.000_25;

/// Minimize `objective` starting at `start`.
///
/// Non-finite objective values are treated as +inf so the simplex steps away
/// from regions where the likelihood is undefined.
pub fn nelder_mead<F>(
    objective: F,
    start: &Array1<f64>,
    settings: &OptimizerSettings,
) -> Result<Minimum, SearchFailure>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let eval = |x: &Array1<f64>| {
        let value = objective(x);
        if value.is_finite() {
            value
        } else {
            f64::INFINITY
        }
    };

    let n = start.len();
    let mut simplex: Vec<Array1<f64>> = Vec::with_capacity(n + 1);
    simplex.push(start.clone());
    for i in 0..n {
        let mut vertex = start.clone();
        vertex[i] = if vertex[i] != 0.0 {
            (1.0 + NONZERO_STEP) * vertex[i]
        } else {
            ZERO_STEP
        };
        simplex.push(vertex);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| eval(v)).collect();
    if !values[0].is_finite() {
        return Err(SearchFailure::NonFiniteStart);
    }

    let mut iterations = 0;
    loop {
        sort_simplex(&mut simplex, &mut values);

        if has_converged(&simplex, &values, settings) {
            return Ok(Minimum {
                point: simplex[0].clone(),
                value: values[0],
                iterations,
            });
        }
        if iterations >= settings.max_iterations {
            return Err(SearchFailure::MaxIterations(iterations));
        }
        iterations += 1;

        let centroid = simplex[..n]
            .iter()
            .fold(Array1::<f64>::zeros(n), |acc, v| acc + v)
            / n as f64;
        let worst = &simplex[n];

        let reflected = &centroid + &((&centroid - worst) * REFLECTION);
        let f_reflected = eval(&reflected);

        if f_reflected < values[0] {
            let expanded = &centroid + &((&centroid - worst) * EXPANSION);
            let f_expanded = eval(&expanded);
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
            continue;
        }

        if f_reflected < values[n - 1] {
            simplex[n] = reflected;
            values[n] = f_reflected;
            continue;
        }

        if f_reflected < values[n] {
            // Outside contraction
            let contracted = &centroid + &((&reflected - &centroid) * CONTRACTION);
            let f_contracted = eval(&contracted);
            if f_contracted <= f_reflected {
                simplex[n] = contracted;
                values[n] = f_contracted;
                continue;
            }
        } else {
            // Inside contraction
            let contracted = &centroid + &((worst - &centroid) * CONTRACTION);
            let f_contracted = eval(&contracted);
            if f_contracted < values[n] {
                simplex[n] = contracted;
                values[n] = f_contracted;
                continue;
            }
        }

        let best = simplex[0].clone();
        for i in 1..=n {
            simplex[i] = &best + &((&simplex[i] - &best) * SHRINK);
            values[i] = eval(&simplex[i]);
        }
    }
}

/// Stable sort so equal objective values keep their vertex order.
fn sort_simplex(simplex: &mut Vec<Array1<f64>>, values: &mut Vec<f64>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    *simplex = order.iter().map(|&i| simplex[i].clone()).collect();
    *values = order.iter().map(|&i| values[i]).collect();
}

fn has_converged(simplex: &[Array1<f64>], values: &[f64], settings: &OptimizerSettings) -> bool {
    let best = &simplex[0];
    let x_spread = simplex[1..]
        .iter()
        .flat_map(|v| v.iter().zip(best.iter()).map(|(a, b)| (a - b).abs()))
        .fold(0.0_f64, f64::max);
    let f_spread = values[1..]
        .iter()
        .map(|v| (v - values[0]).abs())
        .fold(0.0_f64, f64::max);
    x_spread <= settings.x_tolerance && f_spread <= settings.f_tolerance
}
