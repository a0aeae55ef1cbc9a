//! Backing event tables.
//!
//! A backing file is a Parquet table with one row per event and numeric
//! columns. The generated-weight sum of the file is stored in the Arrow
//! schema metadata under [`SUM_WEIGHTS_KEY`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array};
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hc_core::{Error, Result};

/// Schema-metadata key holding the generated-weight sum of a backing file.
pub const SUM_WEIGHTS_KEY: &str = "sum_weights";

/// Column name → values, one value per event.
pub type Columns = HashMap<String, Vec<f64>>;

/// How a backing source is summarized for cache fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestMode {
    /// SHA-256 over the full byte content. Detects silent corruption.
    #[default]
    FullContent,
    /// SHA-256 over (path, size, mtime). Cheap, misses in-place rewrites
    /// that preserve size and mtime.
    MtimeSize,
}

/// One table of events.
pub trait EventSource {
    /// Human-readable identifier (file path or table name).
    fn label(&self) -> String;

    /// Number of events.
    fn n_entries(&self) -> usize;

    /// Generated-weight sum recorded with the table.
    fn sum_weights(&self) -> f64;

    /// Read the named columns as `f64`.
    fn read_columns(&self, names: &[String]) -> Result<Columns>;

    /// Content digest (lowercase hex) used in fingerprints.
    fn digest(&self, mode: DigestMode) -> Result<String>;
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── In-memory tables ───────────────────────────────────────────

/// An in-memory event table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    name: String,
    columns: Columns,
    n_entries: usize,
    sum_weights: f64,
}

impl MemoryTable {
    /// Empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Add a column. All columns must have the same length.
    pub fn column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        if self.columns.is_empty() {
            self.n_entries = values.len();
        }
        self.columns.insert(name.into(), values);
        self
    }

    /// Set the number of events explicitly (for tables without columns).
    pub fn entries(mut self, n: usize) -> Self {
        self.n_entries = n;
        self
    }

    /// Set the generated-weight sum.
    pub fn sum_weights(mut self, sum: f64) -> Self {
        self.sum_weights = sum;
        self
    }

    /// Column names in sorted order.
    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Check that every column has `n_entries` values.
    pub fn validate(&self) -> Result<()> {
        for (name, values) in &self.columns {
            if values.len() != self.n_entries {
                return Err(Error::DataSource(format!(
                    "table '{}': column '{name}' has {} values, expected {}",
                    self.name,
                    values.len(),
                    self.n_entries
                )));
            }
        }
        Ok(())
    }

    /// Write this table as a Parquet backing file.
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let names = self.column_names();
        let fields: Vec<Field> =
            names.iter().map(|n| Field::new(*n, DataType::Float64, false)).collect();
        let metadata =
            HashMap::from([(SUM_WEIGHTS_KEY.to_string(), format!("{:?}", self.sum_weights))]);
        let schema = Arc::new(Schema::new_with_metadata(fields, metadata));
        let arrays: Vec<ArrayRef> = names
            .iter()
            .map(|n| Arc::new(Float64Array::from(self.columns[*n].clone())) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(Arc::clone(&schema), arrays).map_err(arrow_err)?;

        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, schema, None).map_err(parquet_err)?;
        writer.write(&batch).map_err(parquet_err)?;
        writer.close().map_err(parquet_err)?;
        Ok(())
    }
}

impl EventSource for MemoryTable {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn n_entries(&self) -> usize {
        self.n_entries
    }

    fn sum_weights(&self) -> f64 {
        self.sum_weights
    }

    fn read_columns(&self, names: &[String]) -> Result<Columns> {
        names
            .iter()
            .map(|n| {
                self.columns.get(n).map(|v| (n.clone(), v.clone())).ok_or_else(|| {
                    Error::DataSource(format!("table '{}' has no column '{n}'", self.name))
                })
            })
            .collect()
    }

    fn digest(&self, _mode: DigestMode) -> Result<String> {
        let mut h = Sha256::new();
        h.update(self.name.as_bytes());
        h.update((self.n_entries as u64).to_le_bytes());
        h.update(self.sum_weights.to_le_bytes());
        for name in self.column_names() {
            h.update(name.as_bytes());
            for v in &self.columns[name] {
                h.update(v.to_le_bytes());
            }
        }
        Ok(hex(&h.finalize()))
    }
}

// ── Parquet backing files ──────────────────────────────────────

/// A Parquet backing file. Only the footer is read on open; column data is
/// read on demand.
#[derive(Debug, Clone)]
pub struct ParquetFile {
    path: PathBuf,
    n_entries: usize,
    sum_weights: f64,
}

impl ParquetFile {
    /// Open a backing file and read its footer.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)
            .map_err(|e| Error::DataSource(format!("{}: {e}", path.display())))?;
        let n_entries = builder.metadata().file_metadata().num_rows().max(0) as usize;
        let sum_weights = match builder.schema().metadata().get(SUM_WEIGHTS_KEY) {
            Some(raw) => raw.trim().parse::<f64>().map_err(|_| {
                Error::DataSource(format!(
                    "{}: '{SUM_WEIGHTS_KEY}' metadata is not a number: '{raw}'",
                    path.display()
                ))
            })?,
            None => {
                tracing::debug!(path = %path.display(), "no sum_weights metadata, assuming 0");
                0.0
            }
        };
        Ok(Self { path, n_entries, sum_weights })
    }
}

impl EventSource for ParquetFile {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn n_entries(&self) -> usize {
        self.n_entries
    }

    fn sum_weights(&self) -> f64 {
        self.sum_weights
    }

    fn read_columns(&self, names: &[String]) -> Result<Columns> {
        let mut out: Columns = names.iter().map(|n| (n.clone(), Vec::new())).collect();
        if names.is_empty() {
            return Ok(out);
        }

        let ctx = |e: &dyn std::fmt::Display| {
            Error::DataSource(format!("{}: {e}", self.path.display()))
        };
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(File::open(&self.path)?).map_err(|e| ctx(&e))?;
        let leaves = builder.parquet_schema().columns();
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let idx = leaves
                .iter()
                .position(|c| c.name() == name.as_str())
                .ok_or_else(|| ctx(&format!("no column '{name}'")))?;
            indices.push(idx);
        }
        let mask = ProjectionMask::leaves(builder.parquet_schema(), indices);
        let reader = builder.with_projection(mask).build().map_err(|e| ctx(&e))?;

        for batch in reader {
            let batch = batch.map_err(|e| ctx(&e))?;
            for name in names {
                let col = batch.column_by_name(name).ok_or_else(|| ctx(&format!("no column '{name}'")))?;
                let col = arrow::compute::cast(col, &DataType::Float64).map_err(|e| ctx(&e))?;
                let values = col.as_primitive::<Float64Type>();
                if let Some(dst) = out.get_mut(name) {
                    dst.reserve(values.len());
                    for i in 0..values.len() {
                        dst.push(if values.is_null(i) { f64::NAN } else { values.value(i) });
                    }
                }
            }
        }
        Ok(out)
    }

    fn digest(&self, mode: DigestMode) -> Result<String> {
        let mut h = Sha256::new();
        match mode {
            DigestMode::FullContent => {
                let mut reader = BufReader::new(File::open(&self.path)?);
                let mut buf = vec![0u8; 1 << 16];
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    h.update(&buf[..n]);
                }
            }
            DigestMode::MtimeSize => {
                let meta = std::fs::metadata(&self.path)?;
                let mtime = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                h.update(self.path.display().to_string().as_bytes());
                h.update(meta.len().to_le_bytes());
                h.update(mtime.to_le_bytes());
            }
        }
        Ok(hex(&h.finalize()))
    }
}

fn arrow_err(e: arrow::error::ArrowError) -> Error {
    Error::DataSource(format!("arrow: {e}"))
}

fn parquet_err(e: parquet::errors::ParquetError) -> Error {
    Error::DataSource(format!("parquet: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MemoryTable {
        MemoryTable::new("t")
            .column("pt", vec![10.0, 30.0, 50.0])
            .column("n_mu", vec![1.0, 2.0, 2.0])
            .sum_weights(1000.0)
    }

    #[test]
    fn memory_table_reads_columns() {
        let t = table();
        assert_eq!(t.n_entries(), 3);
        let cols = t.read_columns(&["pt".to_string()]).unwrap();
        assert_eq!(cols["pt"], vec![10.0, 30.0, 50.0]);
        assert!(t.read_columns(&["eta".to_string()]).is_err());
    }

    #[test]
    fn memory_digest_tracks_content() {
        let a = table().digest(DigestMode::FullContent).unwrap();
        let b = table().digest(DigestMode::FullContent).unwrap();
        let c = table().column("pt", vec![10.0, 30.0, 51.0]).digest(DigestMode::FullContent).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn validate_rejects_ragged_columns() {
        let t = table().column("eta", vec![0.1]);
        assert!(t.validate().is_err());
    }

    #[test]
    fn parquet_roundtrip_keeps_sum_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.parquet");
        table().write_parquet(&path).unwrap();

        let f = ParquetFile::open(&path).unwrap();
        assert_eq!(f.n_entries(), 3);
        assert_eq!(f.sum_weights(), 1000.0);
        let cols = f.read_columns(&["n_mu".to_string(), "pt".to_string()]).unwrap();
        assert_eq!(cols["pt"], vec![10.0, 30.0, 50.0]);
        assert_eq!(cols["n_mu"], vec![1.0, 2.0, 2.0]);
        assert!(f.read_columns(&["eta".to_string()]).is_err());
    }

    #[test]
    fn parquet_digest_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.parquet");
        table().write_parquet(&path).unwrap();
        let f = ParquetFile::open(&path).unwrap();

        let full = f.digest(DigestMode::FullContent).unwrap();
        assert_eq!(full, f.digest(DigestMode::FullContent).unwrap());
        let cheap = f.digest(DigestMode::MtimeSize).unwrap();
        assert_ne!(full, cheap);

        table().column("pt", vec![11.0, 30.0, 50.0]).write_parquet(&path).unwrap();
        assert_ne!(full, ParquetFile::open(&path).unwrap().digest(DigestMode::FullContent).unwrap());
    }
}
