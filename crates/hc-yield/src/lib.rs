//! # hc-yield
//!
//! Scalar yields with uncertainties from cached aggregates: constituent sums
//! in quadrature, a low-count Poisson error floor and data-driven background
//! estimates from signed sideband regions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod count;
pub mod counter;
pub mod poisson;
pub mod region;

pub use count::CountResult;
pub use counter::{BackgroundConfig, CountMode, Counter, Directory, ProcessCatalog, YieldSource};
pub use poisson::{POISSON_THRESHOLD, poisson_floor, poisson_interval};
pub use region::{Region, RegionSpec, with_selection};
