//! Content-derived cache keys.
//!
//! A fingerprint is SHA-256 over the sorted per-file digests, the sample's
//! normalization tag and the canonical selection string. Sorting makes it
//! insensitive to backing-file order.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hc_core::{Result, SelectionSpec};
use hc_dataset::{AggregateSource, DigestMode};

/// Lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Combine source digests, a normalization tag and a selection.
    pub fn compute(source_digests: &[String], normalization: &str, spec: &SelectionSpec) -> Self {
        let mut digests: Vec<&str> = source_digests.iter().map(String::as_str).collect();
        digests.sort_unstable();

        let mut h = Sha256::new();
        h.update(b"histcache-fingerprint-v1\n");
        for d in &digests {
            h.update(d.as_bytes());
            h.update(b"\n");
        }
        h.update(b"norm:");
        h.update(normalization.as_bytes());
        h.update(b"\nspec:");
        h.update(spec.canonical().as_bytes());
        Fingerprint(format!("{:x}", h.finalize()))
    }

    /// Fingerprint of `spec` evaluated on `source`.
    pub fn of(source: &mut dyn AggregateSource, spec: &SelectionSpec, mode: DigestMode) -> Result<Self> {
        let digests = source.source_digests(mode)?;
        Ok(Self::compute(&digests, &source.normalization_tag(), spec))
    }

    /// Parse a stored digest record. Returns `None` unless it is 64 hex chars.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        (s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Fingerprint(s.to_ascii_lowercase()))
    }

    /// Hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
