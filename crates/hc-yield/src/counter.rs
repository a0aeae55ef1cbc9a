//! Process-level yields from per-sample aggregates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hc_core::{Error, Result};
use hc_store::AnalysisSession;

use crate::count::{CountResult, rounded_entries};
use crate::poisson::poisson_floor;
use crate::region::{Region, RegionSpec, with_selection};

/// Per-sample scalar yields at an aggregate path.
pub trait YieldSource {
    /// Yield of `sample` at `path`; `Ok(None)` when nothing exists there.
    fn sample_yield(&mut self, sample: &str, shift: Option<&str>, path: &str) -> Result<Option<CountResult>>;
}

impl YieldSource for AnalysisSession {
    /// Skim index first; otherwise the (validated, if booked) aggregate integral.
    fn sample_yield(&mut self, sample: &str, shift: Option<&str>, path: &str) -> Result<Option<CountResult>> {
        if let Some(entry) = self.skim(sample, shift)?.get(path) {
            tracing::debug!(sample, path, "skim hit");
            return Ok(Some(CountResult { value: entry.value, error: entry.error, entries: entry.entries }));
        }
        Ok(self.materialize(sample, shift, path)?.map(|agg| {
            let (value, var) = agg.integral();
            CountResult::new(value, var.sqrt()).with_entries(agg.entries())
        }))
    }
}

/// Process name to constituent sample names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessCatalog(BTreeMap<String, Vec<String>>);

impl ProcessCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a process.
    pub fn with<I, S>(mut self, process: impl Into<String>, samples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.insert(process.into(), samples.into_iter().map(Into::into).collect());
        self
    }

    /// Constituent samples of `process`.
    pub fn samples(&self, process: &str) -> Option<&[String]> {
        self.0.get(process).map(Vec::as_slice)
    }

    /// Process names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Where to count: one path for every sample, or one path per sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Directory {
    /// Same path for every constituent.
    Single(String),
    /// Path per sample name.
    PerSample(BTreeMap<String, String>),
}

impl Directory {
    /// Path to count `sample` at.
    pub fn path_for(&self, sample: &str) -> Option<&str> {
        match self {
            Directory::Single(p) => Some(p),
            Directory::PerSample(m) => m.get(sample).map(String::as_str),
        }
    }

    /// Same directory with every path's selection replaced.
    pub fn with_selection(&self, selection: &str) -> Result<Directory> {
        Ok(match self {
            Directory::Single(p) => Directory::Single(with_selection(p, selection)?),
            Directory::PerSample(m) => Directory::PerSample(
                m.iter()
                    .map(|(s, p)| Ok((s.clone(), with_selection(p, selection)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

impl From<&str> for Directory {
    fn from(path: &str) -> Self {
        Directory::Single(path.to_string())
    }
}

/// Error treatment for counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountMode {
    /// `sqrt(Σw²)`.
    #[default]
    Naive,
    /// Naive, floored by the Poisson interval below 10 raw entries.
    Poisson,
}

/// How backgrounds are estimated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Process holding recorded data, for the data-driven estimate.
    #[serde(default)]
    pub data_process: String,
    /// Simulated background processes.
    #[serde(default)]
    pub mc_backgrounds: Vec<String>,
    /// Control and sideband regions. Without a control entry the requested
    /// directory itself is the control region.
    #[serde(default)]
    pub regions: Vec<RegionSpec>,
}

/// Combines constituent yields into process yields. Never fails: unknown
/// processes, empty paths and source errors are logged and count as zero.
pub struct Counter<'a> {
    source: &'a mut dyn YieldSource,
    catalog: &'a ProcessCatalog,
    shift: Option<&'a str>,
}

impl<'a> Counter<'a> {
    /// Counter over `source` with process definitions from `catalog`.
    pub fn new(source: &'a mut dyn YieldSource, catalog: &'a ProcessCatalog) -> Self {
        Self { source, catalog, shift: None }
    }

    /// Count a systematic shift instead of the nominal samples.
    pub fn with_shift(mut self, shift: Option<&'a str>) -> Self {
        self.shift = shift;
        self
    }

    /// Yield of `process` at `directory`, constituents summed in quadrature.
    pub fn get_count(&mut self, process: &str, directory: &Directory, mode: CountMode) -> CountResult {
        let Some(samples) = self.catalog.samples(process) else {
            let err = Error::UnrecognizedKey(format!("process '{process}'"));
            tracing::warn!("{err}; counting zero");
            return CountResult::zero();
        };

        let mut total = CountResult::zero();
        for sample in samples {
            total = total + self.sample_count(sample, directory);
        }

        if mode == CountMode::Poisson {
            total.error = self.floored(total.error, total.effective_entries());
            if total.entries.is_none() {
                total.entries = Some(total.effective_entries());
            }
        }
        total
    }

    fn sample_count(&mut self, sample: &str, directory: &Directory) -> CountResult {
        let Some(path) = directory.path_for(sample) else {
            tracing::warn!(sample, "no directory given for sample, counting zero");
            return CountResult::zero();
        };
        match self.source.sample_yield(sample, self.shift, path) {
            Ok(Some(c)) => c,
            Ok(None) => {
                tracing::warn!(sample, path, "no yield at path, counting zero");
                CountResult::zero()
            }
            Err(e) => {
                if e.is_recoverable() {
                    tracing::warn!(sample, path, "{e}; counting zero");
                } else {
                    tracing::error!(sample, path, "{e}; counting zero");
                }
                CountResult::zero()
            }
        }
    }

    fn floored(&self, naive: f64, n: u64) -> f64 {
        match poisson_floor(naive, n) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(n, "{e}; keeping naive error");
                naive
            }
        }
    }

    /// Background yield at `directory`.
    ///
    /// Data-driven: the data process in each configured region, combined
    /// with [`Region::sign`], floored at zero and then Poisson-floored with
    /// `n = round(value)`. Otherwise: the quadrature sum of the MC
    /// backgrounds.
    pub fn get_background_count(
        &mut self,
        directory: &Directory,
        config: &BackgroundConfig,
        datadriven: bool,
    ) -> CountResult {
        if !datadriven {
            let mut total = CountResult::zero();
            for process in &config.mc_backgrounds {
                total = total + self.get_count(process, directory, CountMode::Naive);
            }
            return total;
        }

        let has_control = config.regions.iter().any(|r| r.region() == Region::Control);
        let mut regions: Vec<(Region, Directory)> = Vec::new();
        if !has_control {
            regions.push((Region::Control, directory.clone()));
        }
        for spec in &config.regions {
            match directory.with_selection(&spec.selection) {
                Ok(d) => regions.push((spec.region(), d)),
                Err(e) => tracing::warn!(selection = %spec.selection, "{e}; skipping region"),
            }
        }

        let mut total = CountResult::new(0.0, 0.0);
        for (region, dir) in &regions {
            let c = self.get_count(&config.data_process, dir, CountMode::Naive);
            tracing::debug!(?region, value = c.value, error = c.error, "region yield");
            total = total.signed_add(c, region.sign());
        }

        let value = total.value.max(0.0);
        let n = rounded_entries(value);
        CountResult { value, error: self.floored(total.error, n), entries: Some(n) }
    }
}
