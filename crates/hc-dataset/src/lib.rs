//! # hc-dataset
//!
//! Raw event datasets for histcache.
//!
//! A sample's backing files are Parquet event tables. [`RawDataset`] opens
//! them lazily (footers only), computes the luminosity normalization and
//! answers one-shot aggregation queries; [`SampleRegistry`] owns every
//! dataset of an analysis.
//!
//! ## Example
//!
//! ```no_run
//! use hc_core::Binning;
//! use hc_dataset::{DataLayout, SampleDef, SampleRegistry};
//!
//! let mut registry = SampleRegistry::new(
//!     DataLayout::new("/data/zmumu"),
//!     40.0,
//!     [SampleDef::mc("Z", 2000.0)],
//! );
//! let id = registry.open("Z", None).unwrap();
//! let h = registry
//!     .get_mut(id)
//!     .aggregate_fields(&["m_ll"], "n_mu >= 2", "w_gen", &[Binning::uniform(60, 60.0, 120.0)])
//!     .unwrap();
//! println!("yield: {:?}", h.integral());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dataset;
pub mod expr;
pub mod fill;
pub mod sample;
pub mod source;

pub use dataset::{AggregateSource, RawDataset};
pub use expr::CompiledExpr;
pub use fill::CompiledSelection;
pub use sample::{DataLayout, NOMINAL, SampleDef, SampleId, SampleKind, SampleRegistry};
pub use source::{Columns, DigestMode, EventSource, MemoryTable, ParquetFile, SUM_WEIGHTS_KEY};
