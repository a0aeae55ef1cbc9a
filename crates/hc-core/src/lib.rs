//! # hc-core
//!
//! Core types shared by every histcache crate: the [`Aggregate`] grid, the
//! [`SelectionSpec`] request it is built from, binning, and the error type.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod binning;
pub mod error;
pub mod selection;

pub use aggregate::{Aggregate, MAX_RANK, strides_of};
pub use binning::{Axis, Binning};
pub use error::{Error, Result};
pub use selection::{AxisSpec, FlowPolicy, SelectionSpec};

/// Split a slash-delimited aggregate path into its components.
///
/// Rejects empty paths, empty components and `.`/`..`, so a path can always
/// be mapped under a store root without escaping it.
pub fn path_components(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Validation("empty aggregate path".into()));
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    for p in &parts {
        if p.is_empty() || *p == "." || *p == ".." || p.contains('\\') {
            return Err(Error::Validation(format!("invalid aggregate path '{path}'")));
        }
    }
    Ok(parts)
}
