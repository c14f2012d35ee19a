//! Special functions used by the closed-form mixture likelihoods.

use std::f64::consts::PI;

/// Lanczos approximation of ln(Gamma(x)).
pub fn ln_gamma(x: f64) -> f64 {
    // Lanczos coefficients (g=7, n=9).
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    const G: f64 = 7.0;

    if x.is_nan() || x <= 0.0 {
        return f64::INFINITY;
    }

    if x < 0.5 {
        // Reflection formula.
        let sin_val = (PI * x).sin();
        if sin_val.abs() < 1e-300 {
            return f64::INFINITY;
        }
        return PI.ln() - sin_val.abs().ln() - ln_gamma(1.0 - x);
    }

    let z = x - 1.0;
    let mut sum = COEFFS[0];
    for (i, &c) in COEFFS[1..].iter().enumerate() {
        sum += c / (z + i as f64 + 1.0);
    }

    let t = z + G + 0.5;
    (z + 0.5).mul_add(t.ln(), 0.5 * (2.0 * PI).ln()) - t + sum.ln()
}

/// ln(B(a, b)).
pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// Numerically stable ln(exp(a) + exp(b)).
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Numerically stable log-sum-exp.
pub fn log_sum_exp(log_terms: &[f64]) -> f64 {
    if log_terms.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max = log_terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = log_terms.iter().map(|&lt| (lt - max).exp()).sum();
    max + sum.ln()
}

const HYP2F1_MIN_TERMS: f64 = 200_000.0;
const HYP2F1_MAX_TERMS: f64 = 100_000_000.0;

/// Number of series terms to allow before giving up.
///
/// The term ratio stays above 1 until roughly `n = (a + b - c - 1) z / (1 - z)`,
/// so for z close to 1 the terms peak late and decay slowly afterwards.
fn hyp2f1_term_budget(a: f64, b: f64, c: f64, z: f64) -> usize {
    let tail = 1.0 - z;
    let peak = (a + b - c - 1.0).max(0.0) * z / tail;
    (HYP2F1_MIN_TERMS + 2.0 * peak + 100.0 / tail).min(HYP2F1_MAX_TERMS) as usize
}

/// ln of the Gauss hypergeometric function 2F1(a, b; c; z) for a, b, c > 0
/// and 0 <= z < 1.
///
/// Every term of the series is positive in this domain, so the sum is carried
/// in log space and cannot overflow for the large shape values produced by
/// customers with many transactions.
pub fn ln_hyp2f1(a: f64, b: f64, c: f64, z: f64) -> f64 {
    if !(a > 0.0 && b > 0.0 && c > 0.0) || !(0.0..1.0).contains(&z) {
        return f64::NAN;
    }
    if z == 0.0 {
        return 0.0;
    }

    let ln_z = z.ln();
    let budget = hyp2f1_term_budget(a, b, c, z);
    let mut ln_term = 0.0_f64;
    let mut ln_sum = 0.0_f64;
    for n in 0..budget {
        let n = n as f64;
        let ln_ratio = (a + n).ln() + (b + n).ln() - (c + n).ln() - (n + 1.0).ln() + ln_z;
        ln_term += ln_ratio;
        ln_sum = log_add_exp(ln_sum, ln_term);
        // Past the peak every later term shrinks geometrically.
        if ln_ratio < 0.0 && ln_term < ln_sum - 40.0 {
            return ln_sum;
        }
    }
    log::warn!("2F1({a}, {b}; {c}; {z}) series truncated after {budget} terms");
    ln_sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ln_gamma_matches_factorials() {
        assert!(ln_gamma(1.0).abs() < 1e-12);
        assert!(ln_gamma(2.0).abs() < 1e-12);
        assert!((ln_gamma(5.0) - 24.0_f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - PI.sqrt().ln()).abs() < 1e-10);
        assert!((ln_gamma(101.0) - 363.739_375_555_563_5).abs() < 1e-8);
    }

    #[test]
    fn test_log_sum_exp_handles_wide_exponent_range() {
        let terms = [-1000.0, -1000.0 + 2.0_f64.ln()];
        let expected = -1000.0 + 3.0_f64.ln();
        assert!((log_sum_exp(&terms) - expected).abs() < 1e-12);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert!((log_add_exp(-800.0, f64::NEG_INFINITY) + 800.0).abs() < 1e-12);
    }

    #[test]
    fn test_ln_hyp2f1_closed_forms() {
        // 2F1(1, 1; 2; z) = -ln(1 - z) / z
        let z = 0.3;
        let expected = (-(1.0_f64 - z).ln() / z).ln();
        assert!((ln_hyp2f1(1.0, 1.0, 2.0, z) - expected).abs() < 1e-12);

        // 2F1(a, b; b; z) = (1 - z)^-a
        let expected = -2.5 * (1.0 - 0.6_f64).ln();
        assert!((ln_hyp2f1(2.5, 4.0, 4.0, 0.6) - expected).abs() < 1e-10);

        assert_eq!(ln_hyp2f1(2.0, 3.0, 4.0, 0.0), 0.0);
        assert!(ln_hyp2f1(2.0, 3.0, 4.0, 1.0).is_nan());
    }

    #[test]
    fn test_ln_hyp2f1_close_to_one() {
        // Terms peak near n = 3e6 here, far past a fixed term cap.
        let expected = -300.0 * (1.0 - 0.9999_f64).ln();
        let value = ln_hyp2f1(300.0, 7.0, 7.0, 0.9999);
        assert!((value - expected).abs() < 1e-6, "got {value}, expected {expected}");

        let z = 0.99999;
        let expected = (-(1.0_f64 - z).ln() / z).ln();
        assert!((ln_hyp2f1(1.0, 1.0, 2.0, z) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_term_budget_follows_peak() {
        assert_eq!(hyp2f1_term_budget(1.0, 1.0, 2.0, 0.5), 200_200);
        assert!(hyp2f1_term_budget(300.0, 7.0, 7.0, 0.9999) > 6_000_000);
        assert_eq!(hyp2f1_term_budget(300.0, 7.0, 7.0, 1.0 - 1e-12), 100_000_000);
    }

    #[test]
    fn test_ln_hyp2f1_large_shapes_stay_finite() {
        let value = ln_hyp2f1(400.0, 410.0, 420.0, 0.4);
        assert!(value.is_finite());
        assert!(value > 100.0);
    }
}
