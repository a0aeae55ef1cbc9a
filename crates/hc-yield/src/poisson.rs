//! Low-count Poisson error floor.
//!
//! Below [`POISSON_THRESHOLD`] raw entries the Gaussian `sqrt(Σw²)` error
//! underestimates the uncertainty (it is 0 for an empty bin). The floor uses
//! the central one-sigma Poisson interval from chi-square quantiles:
//!
//! - `low  = n - 0.5 * Q(α, 2n)` (0 for `n = 0`)
//! - `high = 0.5 * Q(1 - α, 2(n + 1)) - n`
//!
//! with `α = 0.1586555` per tail.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use hc_core::{Error, Result};

/// Entry counts below this get the Poisson floor.
pub const POISSON_THRESHOLD: u64 = 10;

/// One-sided tail probability of the one-sigma interval.
pub const TAIL_PROBABILITY: f64 = 0.1586555;

fn chi2_quantile(p: f64, dof: f64) -> Result<f64> {
    let dist = ChiSquared::new(dof)
        .map_err(|e| Error::Validation(format!("chi-square with {dof} dof: {e}")))?;
    Ok(dist.inverse_cdf(p))
}

/// Lower and upper one-sigma distances from `n`.
pub fn poisson_interval(n: u64) -> Result<(f64, f64)> {
    let nf = n as f64;
    let low = if n == 0 { 0.0 } else { nf - 0.5 * chi2_quantile(TAIL_PROBABILITY, 2.0 * nf)? };
    let high = 0.5 * chi2_quantile(1.0 - TAIL_PROBABILITY, 2.0 * (nf + 1.0))? - nf;
    Ok((low, high))
}

/// `max(naive, max(low, high))` when `n` is below the threshold, else `naive`.
pub fn poisson_floor(naive: f64, n: u64) -> Result<f64> {
    if n >= POISSON_THRESHOLD {
        return Ok(naive);
    }
    let (low, high) = poisson_interval(n)?;
    Ok(naive.max(low.max(high)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_bin_has_positive_error() {
        let (low, high) = poisson_interval(0).unwrap();
        assert_eq!(low, 0.0);
        // 0.5 * Q(0.8413, 2) = -ln(0.1586555)
        assert_relative_eq!(high, -(TAIL_PROBABILITY.ln()), epsilon = 1e-4);
        assert!(poisson_floor(0.0, 0).unwrap() > 0.0);
    }

    #[test]
    fn garwood_values() {
        let (low, high) = poisson_interval(1).unwrap();
        assert_relative_eq!(low, 1.0 - 0.1727, epsilon = 1e-3);
        assert_relative_eq!(high, 3.2995 - 1.0, epsilon = 1e-3);

        let (low, high) = poisson_interval(5).unwrap();
        assert_relative_eq!(low, 5.0 - 2.8403, epsilon = 1e-3);
        assert_relative_eq!(high, 8.3820 - 5.0, epsilon = 1e-3);
    }

    #[test]
    fn floor_only_below_threshold() {
        assert_relative_eq!(poisson_floor(0.5, 3).unwrap(), poisson_interval(3).unwrap().1);
        assert_eq!(poisson_floor(100.0, 3).unwrap(), 100.0);
        assert_eq!(poisson_floor(0.5, 10).unwrap(), 0.5);
    }
}
