//! One sample's backing files and the aggregation queries answered from them.

use std::path::PathBuf;

use hc_core::{Aggregate, AxisSpec, Binning, Error, Result, SelectionSpec};

use crate::fill::CompiledSelection;
use crate::sample::{DataLayout, SampleDef, SampleKind};
use crate::source::{DigestMode, EventSource, ParquetFile};

/// Something that can produce aggregates and describe its inputs for
/// fingerprinting. [`RawDataset`] is the production implementation.
pub trait AggregateSource {
    /// Name of the sample.
    fn sample_name(&self) -> &str;

    /// Per-source content digests, in source order.
    fn source_digests(&mut self, mode: DigestMode) -> Result<Vec<String>>;

    /// Canonical description of the normalization applied to weights.
    fn normalization_tag(&self) -> String;

    /// Compute an aggregate. This is the expensive operation the cache avoids.
    fn aggregate(&mut self, spec: &SelectionSpec) -> Result<Aggregate>;
}

/// The backing event tables of one `(sample, shift)`.
pub struct RawDataset {
    name: String,
    kind: SampleKind,
    shift: Option<String>,
    cross_section: Option<f64>,
    sources: Vec<Box<dyn EventSource>>,
    sum_weights: f64,
    sample_lumi: f64,
    int_lumi: f64,
    digests: Option<(DigestMode, Vec<String>)>,
}

impl std::fmt::Debug for RawDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDataset")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("shift", &self.shift)
            .field("sources", &self.sources.len())
            .field("sum_weights", &self.sum_weights)
            .field("sample_lumi", &self.sample_lumi)
            .finish()
    }
}

impl RawDataset {
    /// Discover and open the backing files of `(sample, shift)`.
    ///
    /// Zero backing files is not an error: it is logged and the dataset
    /// answers every query with zeros.
    pub fn open(def: &SampleDef, shift: Option<&str>, layout: &DataLayout, int_lumi: f64) -> Result<Self> {
        let files = layout.discover(def, shift)?;
        if files.is_empty() {
            let err = Error::MissingData(format!(
                "no backing files for sample '{}' in {}",
                def.name,
                layout.sample_dir(def, shift).display()
            ));
            tracing::warn!(sample = %def.name, shift = shift.unwrap_or("nominal"), "{err}");
        }
        let sources = files
            .into_iter()
            .map(|p| ParquetFile::open(p).map(|f| Box::new(f) as Box<dyn EventSource>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_sources(def, shift, sources, int_lumi))
    }

    /// Build a dataset from already-open sources.
    pub fn from_sources(
        def: &SampleDef,
        shift: Option<&str>,
        sources: Vec<Box<dyn EventSource>>,
        int_lumi: f64,
    ) -> Self {
        let sum_weights: f64 = sources.iter().map(|s| s.sum_weights()).sum();
        let sample_lumi = match def.cross_section {
            Some(xs) if xs > 0.0 && xs.is_finite() => sum_weights / xs,
            _ => 0.0,
        };
        let ds = Self {
            name: def.name.clone(),
            kind: def.kind,
            shift: shift.map(str::to_string),
            cross_section: def.cross_section,
            sources,
            sum_weights,
            sample_lumi,
            int_lumi,
            digests: None,
        };
        if ds.kind == SampleKind::Mc && !ds.sources.is_empty() && ds.sample_lumi == 0.0 {
            let err = Error::Normalization(format!(
                "sample '{}' has cross-section {:?} and generated-weight sum {}",
                ds.name, ds.cross_section, ds.sum_weights
            ));
            tracing::warn!(sample = %ds.name, "{err}; aggregates are forced to zero");
        }
        ds
    }

    /// Sample name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Systematic shift, if any.
    pub fn shift(&self) -> Option<&str> {
        self.shift.as_deref()
    }

    /// Backing source labels (file paths for on-disk samples).
    pub fn source_labels(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.label()).collect()
    }

    /// Backing file paths.
    pub fn files(&self) -> Vec<PathBuf> {
        self.source_labels().into_iter().map(PathBuf::from).collect()
    }

    /// Whether the sample has no backing sources.
    pub fn is_missing(&self) -> bool {
        self.sources.is_empty()
    }

    /// Total events over all sources.
    pub fn n_entries(&self) -> usize {
        self.sources.iter().map(|s| s.n_entries()).sum()
    }

    /// Generated-weight sum over all sources.
    pub fn sum_weights(&self) -> f64 {
        self.sum_weights
    }

    /// `sum_weights / cross_section`, or 0 when undefined.
    pub fn sample_lumi(&self) -> f64 {
        self.sample_lumi
    }

    /// Factor applied to every event weight: `int_lumi / sample_lumi` for MC
    /// (0 when `sample_lumi == 0`), 1 for data.
    pub fn normalization(&self) -> f64 {
        match self.kind {
            SampleKind::Data => 1.0,
            SampleKind::Mc if self.sample_lumi > 0.0 => self.int_lumi / self.sample_lumi,
            SampleKind::Mc => 0.0,
        }
    }

    /// Aggregate `fields` (1..=3 expressions) with one binning per field.
    ///
    /// Axes are named after their field expressions.
    pub fn aggregate_fields(
        &mut self,
        fields: &[&str],
        filter: &str,
        weight: &str,
        binning: &[Binning],
    ) -> Result<Aggregate> {
        if fields.len() != binning.len() {
            return Err(Error::Validation(format!(
                "{} fields but {} binnings",
                fields.len(),
                binning.len()
            )));
        }
        let spec = fields
            .iter()
            .zip(binning)
            .fold(SelectionSpec::new(filter, weight), |s, (f, b)| s.axis(AxisSpec::new(*f, b.clone())));
        self.aggregate_spec(&spec)
    }

    /// Aggregate a full selection over every backing source.
    pub fn aggregate_spec(&self, spec: &SelectionSpec) -> Result<Aggregate> {
        let selection = CompiledSelection::compile(spec)?;
        let mut total = selection.empty(&self.name);
        if self.sources.is_empty() {
            tracing::warn!(sample = %self.name, "no backing files, returning zero aggregate");
            return Ok(total);
        }

        let scale = self.normalization();
        for source in &self.sources {
            let part = selection.fill_source(&self.name, source.as_ref(), scale)?;
            total.add_assign(&part)?;
        }
        tracing::debug!(
            sample = %self.name,
            sources = self.sources.len(),
            entries = total.entries(),
            scale,
            "aggregated"
        );
        Ok(total)
    }
}

impl AggregateSource for RawDataset {
    fn sample_name(&self) -> &str {
        &self.name
    }

    fn source_digests(&mut self, mode: DigestMode) -> Result<Vec<String>> {
        if let Some((cached_mode, digests)) = &self.digests {
            if *cached_mode == mode {
                return Ok(digests.clone());
            }
        }
        let digests = self.sources.iter().map(|s| s.digest(mode)).collect::<Result<Vec<_>>>()?;
        self.digests = Some((mode, digests.clone()));
        Ok(digests)
    }

    fn normalization_tag(&self) -> String {
        match self.kind {
            SampleKind::Data => "data".to_string(),
            SampleKind::Mc => format!(
                "mc;int_lumi={:?};sample_lumi={:?}",
                self.int_lumi, self.sample_lumi
            ),
        }
    }

    fn aggregate(&mut self, spec: &SelectionSpec) -> Result<Aggregate> {
        self.aggregate_spec(spec)
    }
}
