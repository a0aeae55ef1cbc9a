//! Per-dimension binning and the axis type carried by aggregates.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Binning of one aggregate dimension.
///
/// In YAML/JSON this reads as `{ type: uniform, n_bins: 60, low: 60, high: 120 }`
/// or `{ type: edges, edges: [..] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Binning {
    /// `n_bins` equal-width bins on `[low, high)`.
    Uniform {
        /// Number of bins.
        n_bins: usize,
        /// Lower edge.
        low: f64,
        /// Upper edge.
        high: f64,
    },
    /// Explicit, strictly increasing bin edges (`n_bins + 1` values).
    Edges {
        /// Bin edges.
        edges: Vec<f64>,
    },
}

impl Binning {
    /// Uniform binning constructor.
    pub fn uniform(n_bins: usize, low: f64, high: f64) -> Self {
        Binning::Uniform { n_bins, low, high }
    }

    /// Explicit-edge binning constructor.
    pub fn explicit(edges: Vec<f64>) -> Self {
        Binning::Edges { edges }
    }

    /// Number of bins (excluding under/overflow).
    pub fn n_bins(&self) -> usize {
        match self {
            Binning::Uniform { n_bins, .. } => *n_bins,
            Binning::Edges { edges } => edges.len().saturating_sub(1),
        }
    }

    /// Materialized bin edges (length = `n_bins + 1`).
    pub fn edges(&self) -> Vec<f64> {
        match self {
            Binning::Uniform { n_bins: n, low: lo, high: hi } => {
                let width = (hi - lo) / *n as f64;
                let mut edges: Vec<f64> = (0..*n).map(|i| lo + width * i as f64).collect();
                edges.push(*hi);
                edges
            }
            Binning::Edges { edges } => edges.clone(),
        }
    }

    /// Check that the binning describes at least one finite, increasing bin.
    pub fn validate(&self) -> Result<()> {
        match self {
            Binning::Uniform { n_bins: n, low: lo, high: hi } => {
                if *n == 0 {
                    return Err(Error::Validation("uniform binning needs at least one bin".into()));
                }
                if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                    return Err(Error::Validation(format!(
                        "uniform binning range must be finite with low < high, got [{lo}, {hi})"
                    )));
                }
            }
            Binning::Edges { edges: e } => {
                if e.len() < 2 {
                    return Err(Error::Validation(format!(
                        "edge binning needs at least 2 edges, got {}",
                        e.len()
                    )));
                }
                if e.iter().any(|x| !x.is_finite()) {
                    return Err(Error::Validation("bin edges must be finite".into()));
                }
                if e.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::Validation(format!(
                        "bin edges must be strictly increasing: {e:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Canonical text form used in fingerprints.
    ///
    /// Uniform and explicit binnings with identical edges canonicalize
    /// differently; they are different requests even if they fill the same way.
    pub fn canonical(&self) -> String {
        match self {
            Binning::Uniform { n_bins: n, low: lo, high: hi } => format!("u({n},{lo:?},{hi:?})"),
            Binning::Edges { edges: e } => {
                let parts: Vec<String> = e.iter().map(|x| format!("{x:?}")).collect();
                format!("e({})", parts.join(","))
            }
        }
    }
}

/// One materialized axis of an [`crate::Aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Axis name, used to address category axes in projections (e.g. `"channel"`).
    pub name: String,
    /// Bin edges (length = `n_bins + 1`).
    pub edges: Vec<f64>,
    /// Optional per-bin labels (empty, or length = `n_bins`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl Axis {
    /// Build an axis from a binning.
    pub fn new(name: impl Into<String>, binning: &Binning) -> Self {
        Self { name: name.into(), edges: binning.edges(), labels: Vec::new() }
    }

    /// Attach bin labels.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }

    /// Bin indices carrying `label` (a label may span several bins).
    pub fn label_bins(&self, label: &str) -> Vec<usize> {
        self.labels.iter().enumerate().filter(|(_, l)| l.as_str() == label).map(|(i, _)| i).collect()
    }

    /// Locate the bin for `x` with `[lo, hi)` semantics.
    ///
    /// Returns `None` for under/overflow and NaN.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        let n = self.n_bins();
        if n == 0 || x.is_nan() || x < self.edges[0] || x >= self.edges[n] {
            return None;
        }
        // First edge strictly greater than x, minus one.
        let upper = self.edges.partition_point(|&e| e <= x);
        Some(upper - 1)
    }

    /// Like [`Axis::find_bin`] but clamps out-of-range values into the
    /// first/last bin. NaN still yields `None`.
    pub fn find_bin_folded(&self, x: f64) -> Option<usize> {
        let n = self.n_bins();
        if n == 0 || x.is_nan() {
            return None;
        }
        if x < self.edges[0] {
            return Some(0);
        }
        if x >= self.edges[n] {
            return Some(n - 1);
        }
        self.find_bin(x)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        Binning::explicit(self.edges.clone()).validate()?;
        if !self.labels.is_empty() && self.labels.len() != self.n_bins() {
            return Err(Error::Validation(format!(
                "axis '{}' has {} labels for {} bins",
                self.name,
                self.labels.len(),
                self.n_bins()
            )));
        }
        Ok(())
    }
}
