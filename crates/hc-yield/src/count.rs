//! Scalar yields with uncertainty.

use std::ops::Add;

use serde::{Deserialize, Serialize};

/// A yield, its one-sigma error and, when known, the raw entries behind it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountResult {
    /// Yield.
    pub value: f64,
    /// One-sigma uncertainty.
    pub error: f64,
    /// Raw entry count; `None` when any contribution did not report one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<u64>,
}

impl Default for CountResult {
    fn default() -> Self {
        Self::zero()
    }
}

impl CountResult {
    /// `(0 ± 0)` from zero entries.
    pub const fn zero() -> Self {
        Self { value: 0.0, error: 0.0, entries: Some(0) }
    }

    /// Yield without entry information.
    pub fn new(value: f64, error: f64) -> Self {
        Self { value, error, entries: None }
    }

    /// Attach a raw entry count.
    pub fn with_entries(mut self, entries: u64) -> Self {
        self.entries = Some(entries);
        self
    }

    /// `error²`.
    pub fn variance(&self) -> f64 {
        self.error * self.error
    }

    /// `self + sign * other`, errors in quadrature.
    pub fn signed_add(self, other: CountResult, sign: f64) -> CountResult {
        CountResult {
            value: self.value + sign * other.value,
            error: (self.variance() + other.variance()).sqrt(),
            entries: match (self.entries, other.entries) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            },
        }
    }

    /// Entry count for Poisson purposes: the reported one, else the rounded
    /// non-negative value.
    pub fn effective_entries(&self) -> u64 {
        self.entries.unwrap_or_else(|| rounded_entries(self.value))
    }
}

/// `round(value)` clamped to `u64`, 0 for negative or non-finite input.
pub fn rounded_entries(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 { value.round() as u64 } else { 0 }
}

impl Add for CountResult {
    type Output = CountResult;

    fn add(self, rhs: CountResult) -> CountResult {
        self.signed_add(rhs, 1.0)
    }
}

impl std::iter::Sum for CountResult {
    fn sum<I: Iterator<Item = CountResult>>(iter: I) -> Self {
        iter.fold(CountResult::zero(), Add::add)
    }
}
