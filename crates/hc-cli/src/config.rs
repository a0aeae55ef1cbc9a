//! Analysis configuration (YAML).
//!
//! ```yaml
//! analysis: zmumu
//! int_lumi: 40.0
//! samples:
//!   - { name: Z, kind: mc, cross_section: 2000.0 }
//!   - { name: data, kind: data }
//! processes:
//!   Zjets: [Z]
//!   data: [data]
//! bookings:
//!   - path: sr/mass
//!     selection:
//!       filter: "n_mu >= 2"
//!       weight: "w"
//!       axes:
//!         - { field: m_ll, binning: { type: uniform, n_bins: 60, low: 60, high: 120 } }
//! background:
//!   data_process: data
//!   mc_backgrounds: [Zjets]
//!   regions:
//!     - { selection: cr }
//!     - { selection: fail1, failed: 1 }
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use hc_dataset::{DataLayout, SampleDef, SampleRegistry};
use hc_store::{AnalysisSession, Booking, CacheConfig, ProjectionPolicy, SessionConfig};
use hc_yield::{BackgroundConfig, ProcessCatalog};

/// Base directory for data and cache when not set in the file.
pub const BASE_ENV: &str = "HISTCACHE_BASE";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    pub analysis: String,
    pub int_lumi: f64,
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
    pub samples: Vec<SampleDef>,
    #[serde(default)]
    pub processes: ProcessCatalog,
    #[serde(default)]
    pub bookings: Vec<Booking>,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub projection_policy: ProjectionPolicy,
}

/// Resolved data and cache roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roots {
    pub data: PathBuf,
    pub cache: PathBuf,
}

impl AnalysisConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg: AnalysisConfig = serde_yaml_ng::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if !(self.int_lumi.is_finite() && self.int_lumi > 0.0) {
            bail!("int_lumi must be positive, got {}", self.int_lumi);
        }
        let mut names = std::collections::HashSet::new();
        for s in &self.samples {
            if !names.insert(s.name.as_str()) {
                bail!("sample '{}' defined twice", s.name);
            }
        }
        for process in self.processes.names() {
            for sample in self.processes.samples(process).unwrap_or_default() {
                if !names.contains(sample.as_str()) {
                    tracing::warn!(process, sample = %sample, "process refers to an undefined sample");
                }
            }
        }
        Ok(())
    }

    /// Data and cache roots. Explicit entries win (relative ones resolve
    /// against `config_dir`); otherwise `<base>/data` and `<base>/cache`
    /// where base is `$HISTCACHE_BASE` or `config_dir`.
    pub fn roots(&self, config_dir: &Path, env_base: Option<PathBuf>) -> Roots {
        let base = env_base.unwrap_or_else(|| config_dir.to_path_buf());
        let resolve = |explicit: &Option<PathBuf>, default: &str| match explicit {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => config_dir.join(p),
            None => base.join(default),
        };
        Roots { data: resolve(&self.data_root, "data"), cache: resolve(&self.cache_root, "cache") }
    }

    /// Build the analysis session over `roots`.
    pub fn session(&self, roots: &Roots) -> Result<AnalysisSession> {
        let registry = SampleRegistry::new(
            DataLayout::new(&roots.data),
            self.int_lumi,
            self.samples.iter().cloned(),
        );
        let mut cfg = SessionConfig::new(self.analysis.clone(), &roots.cache);
        cfg.cache = self.cache.clone();
        cfg.projection_policy = self.projection_policy;
        Ok(AnalysisSession::new(registry, cfg, self.bookings.clone())?)
    }
}

/// `$HISTCACHE_BASE`, if set and non-empty.
pub fn env_base() -> Option<PathBuf> {
    std::env::var_os(BASE_ENV).filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_dataset::{DigestMode, SampleKind};

    const YAML: &str = r#"
analysis: zmumu
int_lumi: 40.0
samples:
  - { name: Z, kind: mc, cross_section: 2000.0 }
  - { name: data, kind: data }
processes:
  Zjets: [Z]
  data: [data]
bookings:
  - path: sr/mass
    selection:
      filter: "n_mu >= 2"
      weight: "w"
      axes:
        - { field: channel, binning: { type: edges, edges: [0, 1, 2] }, labels: [ee, mm] }
        - { field: m_ll, binning: { type: uniform, n_bins: 60, low: 60, high: 120 } }
    projections:
      - { name: ll, axis: channel, labels: [ee, mm] }
background:
  data_process: data
  mc_backgrounds: [Zjets]
  regions:
    - { selection: cr }
    - { selection: fail1, failed: 1 }
cache:
  fingerprint_mode: mtime_size
projection_policy: trust_parent_fingerprint
"#;

    #[test]
    fn parses_full_config() {
        let cfg: AnalysisConfig = serde_yaml_ng::from_str(YAML).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.samples[1].kind, SampleKind::Data);
        assert_eq!(cfg.processes.samples("Zjets").unwrap(), ["Z".to_string()]);
        assert_eq!(cfg.bookings[0].selection.axes[1].binning.n_bins(), 60);
        assert_eq!(cfg.bookings[0].projections[0].labels.len(), 2);
        assert_eq!(cfg.background.regions[1].failed, 1);
        assert_eq!(cfg.cache.fingerprint_mode, DigestMode::MtimeSize);
        assert!(cfg.cache.locking);
        assert_eq!(cfg.projection_policy, ProjectionPolicy::TrustParentFingerprint);
    }

    #[test]
    fn unknown_keys_rejected() {
        let bad = format!("{YAML}\nint_lumni: 3\n");
        assert!(serde_yaml_ng::from_str::<AnalysisConfig>(&bad).is_err());
    }

    #[test]
    fn root_resolution() {
        let mut cfg: AnalysisConfig = serde_yaml_ng::from_str(YAML).unwrap();
        let dir = Path::new("/ana");

        let r = cfg.roots(dir, None);
        assert_eq!(r, Roots { data: "/ana/data".into(), cache: "/ana/cache".into() });

        let r = cfg.roots(dir, Some("/base".into()));
        assert_eq!(r, Roots { data: "/base/data".into(), cache: "/base/cache".into() });

        cfg.data_root = Some("ntuples".into());
        cfg.cache_root = Some("/scratch/cache".into());
        let r = cfg.roots(dir, Some("/base".into()));
        assert_eq!(r, Roots { data: "/ana/ntuples".into(), cache: "/scratch/cache".into() });
    }

    #[test]
    fn rejects_bad_lumi_and_duplicate_samples() {
        let mut cfg: AnalysisConfig = serde_yaml_ng::from_str(YAML).unwrap();
        cfg.int_lumi = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg: AnalysisConfig = serde_yaml_ng::from_str(YAML).unwrap();
        cfg.samples.push(cfg.samples[0].clone());
        assert!(cfg.validate().is_err());
    }
}
