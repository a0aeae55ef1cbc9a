//! Control and "N objects failed" sideband regions.

use serde::{Deserialize, Serialize};

use hc_core::{Result, path_components};

/// A region of a data-driven background estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// The control region itself.
    Control,
    /// Sideband where `failed` objects fail the tight requirement.
    Sideband {
        /// Number of failing objects.
        failed: u32,
    },
}

impl Region {
    /// Combination sign: -1 for an even, non-zero number of failures, else +1.
    pub fn sign(self) -> f64 {
        match self {
            Region::Sideband { failed } if failed > 0 && failed % 2 == 0 => -1.0,
            _ => 1.0,
        }
    }
}

/// A region and the selection name that addresses it in aggregate paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    /// Selection (first path component) of this region.
    pub selection: String,
    /// Failed objects; 0 is the control region.
    #[serde(default)]
    pub failed: u32,
}

impl RegionSpec {
    /// Control region at `selection`.
    pub fn control(selection: impl Into<String>) -> Self {
        Self { selection: selection.into(), failed: 0 }
    }

    /// Sideband with `failed` failing objects at `selection`.
    pub fn sideband(selection: impl Into<String>, failed: u32) -> Self {
        Self { selection: selection.into(), failed }
    }

    /// Tagged region.
    pub fn region(&self) -> Region {
        match self.failed {
            0 => Region::Control,
            failed => Region::Sideband { failed },
        }
    }
}

/// `path` with its first component replaced by `selection`.
pub fn with_selection(path: &str, selection: &str) -> Result<String> {
    let parts = path_components(path)?;
    path_components(selection)?;
    let mut out = selection.trim_matches('/').to_string();
    for p in &parts[1..] {
        out.push('/');
        out.push_str(p);
    }
    Ok(out)
}
