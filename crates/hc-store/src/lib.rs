//! # hc-store
//!
//! Persistent, fingerprint-validated storage of aggregates.
//!
//! - [`AggregateStore`]: the on-disk container of one `(analysis, sample, shift)`.
//! - [`AggregateCache`]: memo, store and regeneration in front of a dataset.
//! - [`ProjectionEngine`]: category-axis projections of cached parents.
//! - [`SkimStore`]: authoritative pre-reduced scalar counts.
//! - [`AnalysisSession`]: bookings plus one cache per container.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod fingerprint;
pub mod lock;
pub mod projection;
pub mod session;
pub mod skim;
pub mod store;

pub use cache::{AggregateCache, CacheConfig, CacheStats};
pub use fingerprint::Fingerprint;
pub use lock::PathLock;
pub use projection::{
    ProjectionEngine, ProjectionKey, ProjectionPolicy, ProjectionSpec, StoredProjection, project,
};
pub use session::{AnalysisSession, Booking, FillRecord, SessionConfig};
pub use skim::{SkimEntry, SkimStore};
pub use store::{AggregateStore, StoreKey};
