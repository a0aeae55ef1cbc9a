//! N-dimensional binned (value, variance) grid.

use serde::{Deserialize, Serialize};

use crate::binning::Axis;
use crate::error::{Error, Result};

/// Highest supported aggregate rank.
pub const MAX_RANK: usize = 3;

/// An N-dimensional (1..=3) binned statistical summary.
///
/// Cells are stored row-major (last axis fastest). Every cell carries the
/// weighted sum (`values`), the sum of squared weights (`variances`) and the
/// number of raw entries that landed in it (`counts`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Aggregate name (usually the last component of its path).
    pub name: String,
    /// Axes, outermost first.
    pub axes: Vec<Axis>,
    /// Sum of weights per cell.
    pub values: Vec<f64>,
    /// Sum of weights squared per cell.
    pub variances: Vec<f64>,
    /// Raw (unweighted) entries per cell.
    pub counts: Vec<u64>,
}

impl Aggregate {
    /// A zero-valued aggregate with the given axes.
    pub fn zeros(name: impl Into<String>, axes: Vec<Axis>) -> Self {
        let n: usize = axes.iter().map(Axis::n_bins).product();
        Self {
            name: name.into(),
            axes,
            values: vec![0.0; n],
            variances: vec![0.0; n],
            counts: vec![0; n],
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    /// Bins per axis.
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(Axis::n_bins).collect()
    }

    /// Total number of cells.
    pub fn n_cells(&self) -> usize {
        self.values.len()
    }

    /// Row-major strides for [`Aggregate::shape`].
    pub fn strides(&self) -> Vec<usize> {
        strides_of(&self.shape())
    }

    /// Flat index of a multi-index.
    ///
    /// Panics if `index` has the wrong rank or any component is out of range.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let shape = self.shape();
        assert!(
            index.len() == shape.len() && index.iter().zip(&shape).all(|(i, n)| i < n),
            "index {index:?} out of range for shape {shape:?}"
        );
        strides_of(&shape).iter().zip(index).map(|(s, i)| s * i).sum()
    }

    /// Position of the axis called `name`.
    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name == name)
    }

    /// Add one weighted entry to a cell.
    #[inline]
    pub fn fill_cell(&mut self, cell: usize, weight: f64) {
        self.values[cell] += weight;
        self.variances[cell] += weight * weight;
        self.counts[cell] += 1;
    }

    /// Sum over all cells: `(value, variance)`.
    pub fn integral(&self) -> (f64, f64) {
        (self.values.iter().sum(), self.variances.iter().sum())
    }

    /// Total raw entries.
    pub fn entries(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Whether both aggregates have identical axes (edges and labels).
    pub fn same_shape(&self, other: &Aggregate) -> bool {
        self.axes == other.axes
    }

    /// Cell-wise addition. Values and variances add; raw counts add.
    pub fn add_assign(&mut self, other: &Aggregate) -> Result<()> {
        if !self.same_shape(other) {
            return Err(Error::Validation(format!(
                "cannot add aggregate '{}' {:?} to '{}' {:?}",
                other.name,
                other.shape(),
                self.name,
                self.shape()
            )));
        }
        for i in 0..self.values.len() {
            self.values[i] += other.values[i];
            self.variances[i] += other.variances[i];
            self.counts[i] += other.counts[i];
        }
        Ok(())
    }

    /// Scale by `factor`: values by `factor`, variances by `factor²`.
    ///
    /// Raw counts are unchanged. A non-finite factor is treated as 0.
    pub fn scale(&mut self, factor: f64) {
        let f = if factor.is_finite() { factor } else { 0.0 };
        let f2 = f * f;
        for v in &mut self.values {
            *v *= f;
        }
        for v in &mut self.variances {
            *v *= f2;
        }
    }

    /// Structural consistency check used when reading persisted aggregates.
    pub fn validate(&self) -> Result<()> {
        if self.axes.is_empty() || self.axes.len() > MAX_RANK {
            return Err(Error::Validation(format!(
                "aggregate '{}' has unsupported rank {}",
                self.name,
                self.axes.len()
            )));
        }
        for axis in &self.axes {
            axis.validate()?;
        }
        let n: usize = self.shape().iter().product();
        if self.values.len() != n || self.variances.len() != n || self.counts.len() != n {
            return Err(Error::Validation(format!(
                "aggregate '{}' expects {} cells, has values={} variances={} counts={}",
                self.name,
                n,
                self.values.len(),
                self.variances.len(),
                self.counts.len()
            )));
        }
        if self.values.iter().chain(&self.variances).any(|x| !x.is_finite()) {
            return Err(Error::Validation(format!("aggregate '{}' has non-finite cells", self.name)));
        }
        Ok(())
    }
}

/// Row-major strides for a shape.
pub fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::Binning;
    use approx::assert_relative_eq;

    fn grid() -> Aggregate {
        Aggregate::zeros(
            "h",
            vec![
                Axis::new("channel", &Binning::uniform(3, 0.0, 3.0)),
                Axis::new("mass", &Binning::uniform(2, 0.0, 100.0)),
            ],
        )
    }

    #[test]
    fn zeros_shape() {
        let a = grid();
        assert_eq!(a.rank(), 2);
        assert_eq!(a.shape(), vec![3, 2]);
        assert_eq!(a.n_cells(), 6);
        assert_eq!(a.strides(), vec![2, 1]);
        assert_eq!(a.flat_index(&[2, 1]), 5);
        assert!(a.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn flat_index_rejects_out_of_range() {
        grid().flat_index(&[0, 2]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn flat_index_rejects_wrong_rank() {
        grid().flat_index(&[1]);
    }

    #[test]
    fn fill_and_integral() {
        let mut a = grid();
        a.fill_cell(0, 2.0);
        a.fill_cell(5, 3.0);
        let (v, var) = a.integral();
        assert_relative_eq!(v, 5.0);
        assert_relative_eq!(var, 13.0);
        assert_eq!(a.entries(), 2);
    }

    #[test]
    fn scale_squares_variance() {
        let mut a = grid();
        a.fill_cell(1, 2.0);
        a.scale(3.0);
        assert_relative_eq!(a.values[1], 6.0);
        assert_relative_eq!(a.variances[1], 36.0);
        assert_eq!(a.counts[1], 1);
        a.scale(f64::INFINITY);
        assert_eq!(a.values[1], 0.0);
    }

    #[test]
    fn add_requires_same_shape() {
        let mut a = grid();
        let b = Aggregate::zeros("b", vec![Axis::new("x", &Binning::uniform(2, 0.0, 1.0))]);
        assert!(a.add_assign(&b).is_err());
        let mut c = grid();
        c.fill_cell(3, 1.5);
        a.add_assign(&c).unwrap();
        assert_relative_eq!(a.values[3], 1.5);
    }

    #[test]
    fn validate_catches_truncated_cells() {
        let mut a = grid();
        a.variances.pop();
        assert!(a.validate().is_err());
    }
}
