//! Sample definitions and the per-analysis sample registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use hc_core::{Error, Result};

use crate::dataset::RawDataset;

/// Simulated or recorded data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// Simulation, normalized to the integrated luminosity.
    #[default]
    Mc,
    /// Recorded data, never rescaled.
    Data,
}

/// Static description of a sample (from the analysis configuration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDef {
    /// Sample name.
    pub name: String,
    /// MC or data.
    #[serde(default)]
    pub kind: SampleKind,
    /// Cross-section (pb). Required for MC normalization.
    #[serde(default)]
    pub cross_section: Option<f64>,
    /// Directory under the data root; defaults to the sample name.
    #[serde(default)]
    pub directory: Option<String>,
}

impl SampleDef {
    /// MC sample with a cross-section.
    pub fn mc(name: impl Into<String>, cross_section: f64) -> Self {
        Self {
            name: name.into(),
            kind: SampleKind::Mc,
            cross_section: Some(cross_section),
            directory: None,
        }
    }

    /// Data sample.
    pub fn data(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: SampleKind::Data, cross_section: None, directory: None }
    }

    /// Directory name under the data root.
    pub fn directory_name(&self) -> &str {
        self.directory.as_deref().unwrap_or(&self.name)
    }
}

/// Where backing files live: `<data_root>/<sample dir>/<shift or "nominal">/*.<extension>`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLayout {
    /// Root directory of all backing files.
    pub data_root: PathBuf,
    /// Backing file extension (without the dot).
    pub extension: String,
}

/// Directory name used when no shift is requested.
pub const NOMINAL: &str = "nominal";

impl DataLayout {
    /// Layout rooted at `data_root` with Parquet files.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self { data_root: data_root.into(), extension: "parquet".into() }
    }

    /// Directory holding the backing files of `(sample, shift)`.
    pub fn sample_dir(&self, def: &SampleDef, shift: Option<&str>) -> PathBuf {
        self.data_root.join(def.directory_name()).join(shift.unwrap_or(NOMINAL))
    }

    /// Sorted backing files of `(sample, shift)`. A missing directory yields
    /// an empty list.
    pub fn discover(&self, def: &SampleDef, shift: Option<&str>) -> Result<Vec<PathBuf>> {
        let dir = self.sample_dir(def, shift);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_extension(p, &self.extension))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Opaque handle to a dataset owned by a [`SampleRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleId(usize);

/// Owns every [`RawDataset`] of one analysis, created on first use and
/// addressed by [`SampleId`].
pub struct SampleRegistry {
    layout: DataLayout,
    int_lumi: f64,
    catalog: HashMap<String, SampleDef>,
    datasets: Vec<RawDataset>,
    index: HashMap<(String, Option<String>), SampleId>,
}

impl SampleRegistry {
    /// New registry over a sample catalog.
    pub fn new(layout: DataLayout, int_lumi: f64, samples: impl IntoIterator<Item = SampleDef>) -> Self {
        Self {
            layout,
            int_lumi,
            catalog: samples.into_iter().map(|s| (s.name.clone(), s)).collect(),
            datasets: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Sample definition by name.
    pub fn definition(&self, name: &str) -> Option<&SampleDef> {
        self.catalog.get(name)
    }

    /// Handle for `(sample, shift)`, opening the dataset on first use.
    ///
    /// Fails only for samples absent from the catalog or unreadable footers;
    /// a sample without backing files opens as an empty dataset.
    pub fn open(&mut self, name: &str, shift: Option<&str>) -> Result<SampleId> {
        let key = (name.to_string(), shift.map(str::to_string));
        if let Some(id) = self.index.get(&key) {
            return Ok(*id);
        }
        let def = self
            .catalog
            .get(name)
            .ok_or_else(|| Error::UnrecognizedKey(format!("sample '{name}'")))?;
        let dataset = RawDataset::open(def, shift, &self.layout, self.int_lumi)?;
        let id = SampleId(self.datasets.len());
        self.datasets.push(dataset);
        self.index.insert(key, id);
        Ok(id)
    }

    /// Register an already-built dataset (e.g. in-memory tables).
    pub fn insert(&mut self, dataset: RawDataset) -> SampleId {
        let key = (dataset.name().to_string(), dataset.shift().map(str::to_string));
        let id = SampleId(self.datasets.len());
        self.datasets.push(dataset);
        self.index.insert(key, id);
        id
    }

    /// Dataset behind a handle.
    pub fn get(&self, id: SampleId) -> &RawDataset {
        &self.datasets[id.0]
    }

    /// Mutable dataset behind a handle.
    pub fn get_mut(&mut self, id: SampleId) -> &mut RawDataset {
        &mut self.datasets[id.0]
    }

    /// Number of opened datasets.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Whether no dataset has been opened yet.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTable;

    #[test]
    fn discover_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let def = SampleDef::mc("Z", 2000.0);
        let sdir = layout.sample_dir(&def, None);
        std::fs::create_dir_all(&sdir).unwrap();
        std::fs::write(sdir.join("b.parquet"), b"x").unwrap();
        std::fs::write(sdir.join("a.parquet"), b"x").unwrap();
        std::fs::write(sdir.join("notes.txt"), b"x").unwrap();

        let files = layout.discover(&def, None).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
        assert!(layout.discover(&def, Some("JES_up")).unwrap().is_empty());
    }

    #[test]
    fn registry_opens_once_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = SampleRegistry::new(
            DataLayout::new(dir.path()),
            40.0,
            [SampleDef::mc("Z", 2000.0), SampleDef::data("data")],
        );
        let a = reg.open("Z", None).unwrap();
        let b = reg.open("Z", None).unwrap();
        let c = reg.open("Z", Some("JES_up")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(c).shift(), Some("JES_up"));
        assert!(matches!(reg.open("ttbar", None), Err(Error::UnrecognizedKey(_))));
    }

    #[test]
    fn registry_accepts_prebuilt_datasets() {
        let mut reg = SampleRegistry::new(DataLayout::new("/nonexistent"), 1.0, Vec::new());
        let ds = RawDataset::from_sources(
            &SampleDef::data("data"),
            None,
            vec![Box::new(MemoryTable::new("t").entries(3))],
            1.0,
        );
        let id = reg.insert(ds);
        assert_eq!(reg.open("data", None).unwrap(), id);
        assert_eq!(reg.get(id).n_entries(), 3);
    }
}
