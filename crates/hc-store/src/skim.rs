//! Scalar-count side index (`skim.json`).
//!
//! Skims are produced by upstream jobs that already reduced a selection to a
//! number. A present key is authoritative: it bypasses the dataset and all
//! fingerprinting.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hc_core::{Error, Result};

use crate::store::{read_json, write_json_atomic};

/// One pre-reduced yield.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkimEntry {
    /// Yield.
    pub value: f64,
    /// One-sigma uncertainty.
    pub error: f64,
    /// Raw entries behind the yield, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<u64>,
}

/// Skim index of one store container, keyed by slash-path.
#[derive(Debug, Clone, Default)]
pub struct SkimStore {
    file: PathBuf,
    entries: BTreeMap<String, SkimEntry>,
}

impl SkimStore {
    /// Load `file`. A missing file is an empty index; a corrupt one is logged
    /// and treated as empty.
    pub fn load(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let entries = match read_json::<BTreeMap<String, SkimEntry>>(&file) {
            Ok(Some(entries)) => entries,
            Ok(None) => BTreeMap::new(),
            Err(e @ Error::CacheCorruption(_)) => {
                tracing::warn!("{e}; ignoring skim index");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self { file, entries })
    }

    /// Entry for `path`, if skimmed.
    pub fn get(&self, path: &str) -> Option<SkimEntry> {
        self.entries.get(path.trim_matches('/')).copied()
    }

    /// Add or replace an entry (in memory until [`SkimStore::save`]).
    pub fn insert(&mut self, path: &str, entry: SkimEntry) {
        self.entries.insert(path.trim_matches('/').to_string(), entry);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomically write the index.
    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.file, &self.entries)
    }
}
