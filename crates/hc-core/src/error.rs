//! Error types for histcache

use thiserror::Error;

/// histcache error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A sample has no backing files (non-fatal; aggregation yields zeros).
    #[error("missing data: {0}")]
    MissingData(String),

    /// A stored aggregate is unreadable or does not match its selection.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// Luminosity normalization is undefined (no cross-section, zero weight sum).
    #[error("normalization error: {0}")]
    Normalization(String),

    /// Unknown process, sample or selection name.
    #[error("unrecognized key: {0}")]
    UnrecognizedKey(String),

    /// Expression tokenize/parse/evaluation error
    #[error("expression error: {0}")]
    Expression(String),

    /// Validation error (bad binning, bad path, bad selection)
    #[error("validation error: {0}")]
    Validation(String),

    /// Backing data could not be read
    #[error("data source error: {0}")]
    DataSource(String),
}

impl Error {
    /// Whether this error is one of the degrade-to-zero conditions
    /// (missing data, normalization, unknown key) rather than a real fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingData(_) | Error::Normalization(_) | Error::UnrecognizedKey(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::MissingData("Z".into()).is_recoverable());
        assert!(Error::UnrecognizedKey("ttbar".into()).is_recoverable());
        assert!(!Error::CacheCorruption("agg/a".into()).is_recoverable());
        assert!(!Error::Validation("bad".into()).is_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let e = Error::Normalization("sample 'Z' has no cross-section".into());
        assert_eq!(e.to_string(), "normalization error: sample 'Z' has no cross-section");
    }
}
