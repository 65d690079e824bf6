//! Beta distribution numerics
//!
//! Quantiles come from bisection over the CDF so that the tolerance and
//! iteration budget are explicit. The CDF is the regularized incomplete beta
//! for modest parameters and a normal approximation once alpha+beta is large
//! enough that the incomplete beta gets slow and the approximation is tight.

use statrs::function::beta::checked_beta_reg;
use statrs::function::erf::erf;

/// z for a two-sided 95% interval
pub const Z_95: f64 = 1.959_963_984_540_054;

/// Result of a quantile search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantile {
    pub value: f64,
    /// False when the search ran out of iterations or the CDF failed
    pub converged: bool,
}

/// CDF of Beta(alpha, beta) at `x`.
///
/// Returns `None` when the special function rejects its inputs.
pub fn beta_cdf(x: f64, alpha: f64, beta: f64, normal_threshold: f64) -> Option<f64> {
    if x <= 0.0 {
        return Some(0.0);
    }
    if x >= 1.0 {
        return Some(1.0);
    }

    if alpha + beta > normal_threshold {
        let n = alpha + beta;
        let mean = alpha / n;
        let sd = ((alpha * beta) / (n * n * (n + 1.0))).sqrt();
        if sd <= 0.0 || !sd.is_finite() {
            return None;
        }
        let z = (x - mean) / sd;
        return Some(0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2)));
    }

    checked_beta_reg(alpha, beta, x).ok()
}

/// Inverse CDF of Beta(alpha, beta) by bisection.
///
/// Never fails: on a CDF error or an exhausted iteration budget the midpoint
/// of the best bracket so far is returned with `converged = false`.
pub fn beta_quantile(
    p: f64,
    alpha: f64,
    beta: f64,
    tolerance: f64,
    max_iterations: usize,
    normal_threshold: f64,
) -> Quantile {
    let p = p.clamp(0.0, 1.0);
    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);

    for _ in 0..max_iterations {
        let mid = 0.5 * (lo + hi);
        let Some(cdf) = beta_cdf(mid, alpha, beta, normal_threshold) else {
            return Quantile {
                value: mid,
                converged: false,
            };
        };

        if (cdf - p).abs() <= tolerance || (hi - lo) <= tolerance {
            return Quantile {
                value: mid,
                converged: true,
            };
        }

        if cdf < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Quantile {
        value: 0.5 * (lo + hi),
        converged: false,
    }
}

/// Wilson score lower bound for a 95% interval.
///
/// Treats alpha as successes out of alpha+beta trials. Always at or below
/// the point estimate alpha/(alpha+beta).
pub fn wilson_lower_bound(alpha: f64, beta: f64) -> f64 {
    let n = alpha + beta;
    if n <= 0.0 || !n.is_finite() {
        return 0.0;
    }

    let p = alpha / n;
    let z2 = Z_95 * Z_95;
    let center = p + z2 / (2.0 * n);
    let margin = Z_95 * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    let lower = (center - margin) / (1.0 + z2 / n);

    lower.clamp(0.0, 1.0).min(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::distribution::{Beta, ContinuousCDF};

    #[test]
    fn test_quantile_matches_statrs() {
        for &(a, b) in &[(1.0, 1.0), (3.0, 2.0), (11.0, 4.0), (2.5, 40.0)] {
            let reference = Beta::new(a, b).unwrap();
            for &p in &[0.025, 0.5, 0.975] {
                let q = beta_quantile(p, a, b, 1e-6, 100, 1000.0);
                assert!(q.converged);
                let expected = reference.inverse_cdf(p);
                assert!(
                    (q.value - expected).abs() < 1e-4,
                    "Beta({}, {}) q({}) = {} expected {}",
                    a, b, p, q.value, expected
                );
            }
        }
    }

    #[test]
    fn test_normal_approximation_for_large_counts() {
        let exact = beta_quantile(0.5, 600.0, 400.0, 1e-6, 100, f64::INFINITY);
        let approx = beta_quantile(0.5, 600.0, 400.0, 1e-6, 100, 100.0);
        assert!(exact.converged && approx.converged);
        assert!((exact.value - approx.value).abs() < 1e-3);
    }

    #[test]
    fn test_exhausted_budget_returns_midpoint() {
        let q = beta_quantile(0.3, 2.0, 5.0, 1e-12, 3, 1000.0);
        assert!(!q.converged);
        assert!(q.value > 0.0 && q.value < 1.0);
    }

    #[test]
    fn test_wilson_uniform_prior() {
        let lower = wilson_lower_bound(1.0, 1.0);
        assert!(lower > 0.0 && lower < 0.5);
    }

    #[test]
    fn test_wilson_all_successes_below_one() {
        let lower = wilson_lower_bound(20.0, 0.0001);
        assert!(lower < 1.0);
        assert!(lower > 0.8);
    }
}
