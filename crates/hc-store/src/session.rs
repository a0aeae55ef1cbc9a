//! One analysis run: the sample registry, the bookings and one cache per
//! `(sample, shift)` container.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hc_core::{Aggregate, Error, Result, SelectionSpec, path_components};
use hc_dataset::SampleRegistry;

use crate::cache::{AggregateCache, CacheConfig, CacheStats};
use crate::projection::{ProjectionEngine, ProjectionPolicy, ProjectionSpec};
use crate::skim::SkimStore;
use crate::store::{AggregateStore, StoreKey};

/// A registered aggregate: where it lives, how it is selected, and the
/// projections derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    /// Slash-delimited aggregate path; the first component is the selection.
    pub path: String,
    /// Selection producing the aggregate.
    pub selection: SelectionSpec,
    /// Projections stored at `<path>/<projection name>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projections: Vec<ProjectionSpec>,
}

impl Booking {
    /// Booking of `selection` at `path`.
    pub fn new(path: impl Into<String>, selection: SelectionSpec) -> Self {
        Self { path: path.into(), selection, projections: Vec::new() }
    }

    /// Attach a projection.
    pub fn projection(mut self, projection: ProjectionSpec) -> Self {
        self.projections.push(projection);
        self
    }
}

/// Where and how a session caches.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Analysis name (first store path level).
    pub analysis: String,
    /// Root of all store containers.
    pub cache_root: PathBuf,
    /// Cache behaviour.
    pub cache: CacheConfig,
    /// Projection reuse policy.
    pub projection_policy: ProjectionPolicy,
}

impl SessionConfig {
    /// Defaults for `analysis` under `cache_root`.
    pub fn new(analysis: impl Into<String>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            analysis: analysis.into(),
            cache_root: cache_root.into(),
            cache: CacheConfig::default(),
            projection_policy: ProjectionPolicy::default(),
        }
    }
}

/// Summary line for one materialized path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillRecord {
    /// Aggregate path.
    pub path: String,
    /// Integral.
    pub value: f64,
    /// Square root of the summed variance.
    pub error: f64,
    /// Raw entries.
    pub entries: u64,
}

impl FillRecord {
    fn of(path: &str, agg: &Aggregate) -> Self {
        let (value, var) = agg.integral();
        Self { path: path.to_string(), value, error: var.sqrt(), entries: agg.entries() }
    }
}

type ContainerKey = (String, Option<String>);

enum Target<'a> {
    Booked(&'a Booking),
    Projected(&'a Booking, &'a ProjectionSpec),
}

fn resolve<'a>(bookings: &'a [Booking], path: &str) -> Option<Target<'a>> {
    for b in bookings {
        let bp = b.path.trim_matches('/');
        if bp == path {
            return Some(Target::Booked(b));
        }
        if let Some(name) = path.strip_prefix(bp).and_then(|rest| rest.strip_prefix('/')) {
            if let Some(p) = b.projections.iter().find(|p| p.name == name) {
                return Some(Target::Projected(b, p));
            }
        }
    }
    None
}

fn container(sample: &str, shift: Option<&str>) -> ContainerKey {
    (sample.to_string(), shift.map(str::to_string))
}

/// Everything an analysis run needs to answer aggregate and yield queries.
pub struct AnalysisSession {
    registry: SampleRegistry,
    config: SessionConfig,
    bookings: Vec<Booking>,
    caches: HashMap<ContainerKey, AggregateCache>,
    skims: HashMap<ContainerKey, SkimStore>,
    projections: ProjectionEngine,
}

impl AnalysisSession {
    /// New session. Every booking is validated up front.
    pub fn new(registry: SampleRegistry, config: SessionConfig, bookings: Vec<Booking>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for b in &bookings {
            path_components(&b.path)?;
            b.selection.validate()?;
            if !seen.insert(b.path.trim_matches('/').to_string()) {
                return Err(Error::Validation(format!("path '{}' booked twice", b.path)));
            }
            for p in &b.projections {
                path_components(&p.name)?;
            }
        }
        Ok(Self {
            registry,
            projections: ProjectionEngine::new(config.projection_policy),
            config,
            bookings,
            caches: HashMap::new(),
            skims: HashMap::new(),
        })
    }

    /// Sample registry.
    pub fn registry(&self) -> &SampleRegistry {
        &self.registry
    }

    fn store_key(&self, sample: &str, shift: Option<&str>) -> StoreKey {
        StoreKey::new(self.config.analysis.clone(), sample, shift)
    }

    fn ensure_known(&self, sample: &str) -> Result<()> {
        match self.registry.definition(sample) {
            Some(_) => Ok(()),
            None => Err(Error::UnrecognizedKey(format!("sample '{sample}'"))),
        }
    }

    /// Aggregate at `path` for `(sample, shift)`.
    ///
    /// Booked paths and their projections are validated and regenerated as
    /// needed; other paths are read unvalidated from the store and are
    /// `None` when absent.
    pub fn materialize(&mut self, sample: &str, shift: Option<&str>, path: &str) -> Result<Option<Aggregate>> {
        let path = path.trim_matches('/');
        path_components(path)?;
        let id = self.registry.open(sample, shift)?;
        let store_key = self.store_key(sample, shift);

        let cache = match self.caches.entry(container(sample, shift)) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let store = AggregateStore::open(&self.config.cache_root, store_key)?;
                e.insert(AggregateCache::new(store, self.config.cache.clone()))
            }
        };
        let dataset = self.registry.get_mut(id);

        match resolve(&self.bookings, path) {
            Some(Target::Booked(b)) => cache.materialize(dataset, path, &b.selection).map(Some),
            Some(Target::Projected(b, p)) => self
                .projections
                .materialize(cache, dataset, b.path.trim_matches('/'), &b.selection, p)
                .map(Some),
            None => cache.load(path),
        }
    }

    /// Materialize every booking and projection of `(sample, shift)`.
    pub fn fill(&mut self, sample: &str, shift: Option<&str>) -> Result<Vec<FillRecord>> {
        let mut paths = Vec::new();
        for b in &self.bookings {
            let bp = b.path.trim_matches('/');
            paths.push(bp.to_string());
            paths.extend(b.projections.iter().map(|p| format!("{bp}/{}", p.name)));
        }

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(agg) = self.materialize(sample, shift, &path)? {
                out.push(FillRecord::of(&path, &agg));
            }
        }
        tracing::info!(sample, shift = shift.unwrap_or("nominal"), paths = out.len(), "filled");
        Ok(out)
    }

    /// Remove every stored aggregate of `(sample, shift)`.
    pub fn clear(&mut self, sample: &str, shift: Option<&str>) -> Result<()> {
        self.ensure_known(sample)?;
        match self.caches.get_mut(&container(sample, shift)) {
            Some(cache) => cache.clear(),
            None => AggregateStore::open(&self.config.cache_root, self.store_key(sample, shift))?.clear(),
        }
    }

    /// Skim index of `(sample, shift)`, loaded on first use. Does not open
    /// the dataset.
    pub fn skim(&mut self, sample: &str, shift: Option<&str>) -> Result<&SkimStore> {
        self.ensure_known(sample)?;
        match self.skims.entry(container(sample, shift)) {
            Entry::Occupied(e) => Ok(&*e.into_mut()),
            Entry::Vacant(e) => {
                let key = StoreKey::new(self.config.analysis.clone(), sample, shift);
                let store = AggregateStore::open(&self.config.cache_root, key)?;
                Ok(&*e.insert(SkimStore::load(store.skim_file())?))
            }
        }
    }

    /// Cache counters of `(sample, shift)`, if its cache was used.
    pub fn stats(&self, sample: &str, shift: Option<&str>) -> Option<CacheStats> {
        self.caches.get(&container(sample, shift)).map(AggregateCache::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_core::{AxisSpec, Binning};

    fn booking() -> Booking {
        Booking::new(
            "sel/mass",
            SelectionSpec::new("1", "1").axis(AxisSpec::new("m", Binning::uniform(2, 0.0, 1.0))),
        )
        .projection(ProjectionSpec::new("ee", "channel", ["ee"]))
    }

    #[test]
    fn resolve_booking_and_projection() {
        let bs = vec![booking()];
        assert!(matches!(resolve(&bs, "sel/mass"), Some(Target::Booked(_))));
        assert!(matches!(resolve(&bs, "sel/mass/ee"), Some(Target::Projected(_, p)) if p.name == "ee"));
        assert!(resolve(&bs, "sel/mass/mm").is_none());
        assert!(resolve(&bs, "sel/massive").is_none());
    }

    #[test]
    fn duplicate_and_invalid_bookings_rejected() {
        let reg = || SampleRegistry::new(hc_dataset::DataLayout::new("/nonexistent"), 1.0, Vec::new());
        let cfg = SessionConfig::new("a", "/nonexistent");
        assert!(AnalysisSession::new(reg(), cfg.clone(), vec![booking(), booking()]).is_err());
        let bad = Booking::new("sel/x", SelectionSpec::new("1", "1"));
        assert!(AnalysisSession::new(reg(), cfg.clone(), vec![bad]).is_err());
        assert!(AnalysisSession::new(reg(), cfg, vec![booking()]).is_ok());
    }
}
