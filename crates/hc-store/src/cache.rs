//! Fingerprint-validated aggregate cache.
//!
//! `materialize` resolves in three tiers: the in-process memo, the on-disk
//! store (valid only when the stored fingerprint equals the fresh one), and
//! finally regeneration from the [`AggregateSource`] followed by a persist.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hc_core::{Aggregate, Error, Result, SelectionSpec, path_components};
use hc_dataset::{AggregateSource, DigestMode};

use crate::fingerprint::Fingerprint;
use crate::lock::PathLock;
use crate::store::AggregateStore;

/// Cache behaviour knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How backing files are digested for fingerprints.
    pub fingerprint_mode: DigestMode,
    /// How long a writer waits for a path lock before proceeding unlocked.
    #[serde(with = "duration_ms", rename = "lock_wait_ms")]
    pub lock_wait: Duration,
    /// Age after which an existing lock file is taken to belong to a dead
    /// writer and is broken.
    #[serde(with = "duration_ms", rename = "lock_stale_ms")]
    pub lock_stale_after: Duration,
    /// Whether writers take per-path lock files at all.
    pub locking: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fingerprint_mode: DigestMode::FullContent,
            lock_wait: Duration::from_secs(10),
            lock_stale_after: Duration::from_secs(30 * 60),
            locking: true,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Served from memo or a valid stored entry.
    pub hits: u64,
    /// No valid entry was found before locking.
    pub misses: u64,
    /// Calls into [`AggregateSource::aggregate`].
    pub regenerations: u64,
    /// Stored entries discarded as unreadable or mismatched.
    pub corrupt: u64,
}

/// Aggregate cache over one store container.
#[derive(Debug)]
pub struct AggregateCache {
    store: AggregateStore,
    config: CacheConfig,
    memo: HashMap<String, (Fingerprint, Aggregate)>,
    stats: CacheStats,
}

impl AggregateCache {
    /// Cache over `store`.
    pub fn new(store: AggregateStore, config: CacheConfig) -> Self {
        Self { store, config, memo: HashMap::new(), stats: CacheStats::default() }
    }

    /// Backing store.
    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    /// Counters so far.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Fresh fingerprint of `spec` on `source`.
    pub fn fingerprint(&self, source: &mut dyn AggregateSource, spec: &SelectionSpec) -> Result<Fingerprint> {
        Fingerprint::of(source, spec, self.config.fingerprint_mode)
    }

    /// Whether the fingerprint stored at `path` matches a fresh one.
    pub fn check_fingerprint(
        &self,
        source: &mut dyn AggregateSource,
        path: &str,
        spec: &SelectionSpec,
    ) -> Result<bool> {
        let fresh = self.fingerprint(source, spec)?;
        Ok(self.store.read_fingerprint(path)?.as_ref() == Some(&fresh))
    }

    /// Return a valid aggregate for `(path, spec)`, regenerating if needed.
    pub fn materialize(
        &mut self,
        source: &mut dyn AggregateSource,
        path: &str,
        spec: &SelectionSpec,
    ) -> Result<Aggregate> {
        self.materialize_fingerprinted(source, path, spec).map(|(_, agg)| agg)
    }

    /// Like [`AggregateCache::materialize`], also returning the fingerprint
    /// the aggregate is valid for.
    pub fn materialize_fingerprinted(
        &mut self,
        source: &mut dyn AggregateSource,
        path: &str,
        spec: &SelectionSpec,
    ) -> Result<(Fingerprint, Aggregate)> {
        path_components(path)?;
        spec.validate()?;
        let fp = self.fingerprint(source, spec)?;

        if let Some((memo_fp, agg)) = self.memo.get(path) {
            if *memo_fp == fp {
                self.stats.hits += 1;
                return Ok((fp, agg.clone()));
            }
        }

        if let Some(agg) = self.stored_if_valid(path, spec, &fp, false)? {
            self.stats.hits += 1;
            tracing::debug!(sample = source.sample_name(), path, fp = fp.short(), "cache hit");
            return Ok(self.remember(path, fp, agg));
        }
        self.stats.misses += 1;

        let lock = if self.config.locking {
            let lock = PathLock::acquire(
                &self.store.lock_file(path)?,
                self.config.lock_wait,
                self.config.lock_stale_after,
            )?;
            if lock.is_none() {
                tracing::warn!(
                    path,
                    wait_ms = self.config.lock_wait.as_millis() as u64,
                    "path lock still held, writing without it"
                );
            }
            lock
        } else {
            None
        };

        // Another writer may have finished while we waited.
        if lock.is_some() {
            if let Some(agg) = self.stored_if_valid(path, spec, &fp, true)? {
                self.stats.hits += 1;
                return Ok(self.remember(path, fp, agg));
            }
        }

        tracing::info!(sample = source.sample_name(), path, fp = fp.short(), "regenerating aggregate");
        let mut agg = source.aggregate(spec)?;
        self.stats.regenerations += 1;
        if let Some(last) = path_components(path)?.last() {
            agg.name = (*last).to_string();
        }
        self.store.write(path, &agg, &fp)?;
        drop(lock);
        Ok(self.remember(path, fp, agg))
    }

    /// Unvalidated read of whatever is stored at `path`.
    ///
    /// For aggregates produced by another job. Corrupt entries read as absent.
    pub fn load(&mut self, path: &str) -> Result<Option<Aggregate>> {
        if let Some((_, agg)) = self.memo.get(path) {
            return Ok(Some(agg.clone()));
        }
        match self.store.read_aggregate(path) {
            Ok(agg) => Ok(agg),
            Err(e @ Error::CacheCorruption(_)) => {
                self.stats.corrupt += 1;
                tracing::warn!(path, "{e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the memo and every stored entry of this container.
    pub fn clear(&mut self) -> Result<()> {
        self.memo.clear();
        self.store.clear()
    }

    fn remember(&mut self, path: &str, fp: Fingerprint, agg: Aggregate) -> (Fingerprint, Aggregate) {
        self.memo.insert(path.to_string(), (fp.clone(), agg.clone()));
        (fp, agg)
    }

    /// Stored aggregate at `path` if its fingerprint is `fp` and its shape
    /// matches `spec`. A re-check under the lock does not count the same
    /// corrupt entry twice.
    ///
    /// The fingerprint embedded in the aggregate record is authoritative: a
    /// writer may replace the record between the two reads.
    fn stored_if_valid(
        &mut self,
        path: &str,
        spec: &SelectionSpec,
        fp: &Fingerprint,
        recheck: bool,
    ) -> Result<Option<Aggregate>> {
        if self.store.read_fingerprint(path)?.as_ref() != Some(fp) {
            return Ok(None);
        }
        let err = match self.store.read_entry(path) {
            Ok(Some((stored, _))) if stored != *fp => return Ok(None),
            Ok(Some((_, agg))) if spec.matches(&agg) => return Ok(Some(agg)),
            Ok(Some((_, agg))) => Error::CacheCorruption(format!(
                "stored shape {:?} does not match the selection",
                agg.shape()
            )),
            Ok(None) => return Ok(None),
            Err(e @ Error::CacheCorruption(_)) => e,
            Err(e) => return Err(e),
        };
        if !recheck {
            self.stats.corrupt += 1;
            tracing::warn!(path, "{err}; regenerating");
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreKey;
    use hc_core::{AxisSpec, Binning};

    /// Source that fills one fixed entry per call and counts calls.
    struct Counting {
        calls: usize,
        digests: Vec<String>,
        tag: String,
    }

    impl Counting {
        fn new() -> Self {
            Self { calls: 0, digests: vec!["01".repeat(32), "02".repeat(32)], tag: "data".into() }
        }
    }

    impl AggregateSource for Counting {
        fn sample_name(&self) -> &str {
            "Z"
        }

        fn source_digests(&mut self, _mode: DigestMode) -> Result<Vec<String>> {
            Ok(self.digests.clone())
        }

        fn normalization_tag(&self) -> String {
            self.tag.clone()
        }

        fn aggregate(&mut self, spec: &SelectionSpec) -> Result<Aggregate> {
            self.calls += 1;
            let mut agg = spec.empty_aggregate("tmp");
            agg.fill_cell(0, 3.0);
            Ok(agg)
        }
    }

    fn spec() -> SelectionSpec {
        SelectionSpec::new("n_mu >= 2", "w").axis(AxisSpec::new("m_ll", Binning::uniform(4, 60.0, 120.0)))
    }

    fn cache(root: &std::path::Path) -> AggregateCache {
        let store = AggregateStore::open(root, StoreKey::new("zmumu", "Z", None)).unwrap();
        AggregateCache::new(store, CacheConfig::default())
    }

    #[test]
    fn second_materialize_is_memo_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        let mut src = Counting::new();

        let a = c.materialize(&mut src, "sel/mass", &spec()).unwrap();
        let b = c.materialize(&mut src, "sel/mass", &spec()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name, "mass");
        assert_eq!(src.calls, 1);
        assert_eq!(c.stats(), CacheStats { hits: 1, misses: 1, regenerations: 1, corrupt: 0 });
        assert!(c.check_fingerprint(&mut src, "sel/mass", &spec()).unwrap());
    }

    #[test]
    fn idempotent_across_cache_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        let a = cache(dir.path()).materialize(&mut src, "sel/mass", &spec()).unwrap();

        let mut fresh = cache(dir.path());
        let b = fresh.materialize(&mut src, "sel/mass", &spec()).unwrap();
        assert_eq!(a, b);
        assert_eq!(src.calls, 1);
        assert_eq!(fresh.stats().hits, 1);
        assert_eq!(fresh.stats().regenerations, 0);
    }

    #[test]
    fn any_input_change_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        let mut src = Counting::new();
        c.materialize(&mut src, "p", &spec()).unwrap();

        let mut binned = spec();
        binned.axes[0].binning = Binning::uniform(5, 60.0, 120.0);
        let agg = c.materialize(&mut src, "p", &binned).unwrap();
        assert_eq!(agg.shape(), vec![5]);
        assert_eq!(src.calls, 2);

        src.digests[0] = "03".repeat(32);
        c.materialize(&mut src, "p", &binned).unwrap();
        assert_eq!(src.calls, 3);

        src.tag = "mc;int_lumi=41.0;sample_lumi=1.0".into();
        c.materialize(&mut src, "p", &binned).unwrap();
        assert_eq!(src.calls, 4);

        // Reordering files does not.
        src.digests.reverse();
        c.materialize(&mut src, "p", &binned).unwrap();
        assert_eq!(src.calls, 4);
    }

    #[test]
    fn corrupt_store_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        let first = cache(dir.path()).materialize(&mut src, "sel/mass", &spec()).unwrap();

        let mut c = cache(dir.path());
        std::fs::write(c.store().aggregate_file("sel/mass").unwrap(), b"\x00\x01").unwrap();
        let again = c.materialize(&mut src, "sel/mass", &spec()).unwrap();
        assert_eq!(first, again);
        assert_eq!(src.calls, 2);
        assert_eq!(c.stats().corrupt, 1);
    }

    #[test]
    fn shape_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        let mut c = cache(dir.path());
        let fp = c.fingerprint(&mut src, &spec()).unwrap();
        let wrong = SelectionSpec::new("1", "1")
            .axis(AxisSpec::new("x", Binning::uniform(2, 0.0, 1.0)))
            .empty_aggregate("mass");
        c.store().write("sel/mass", &wrong, &fp).unwrap();

        let agg = c.materialize(&mut src, "sel/mass", &spec()).unwrap();
        assert_eq!(agg.shape(), vec![4]);
        assert_eq!(c.stats().corrupt, 1);
        assert_eq!(src.calls, 1);
    }

    #[test]
    fn missing_fingerprint_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        cache(dir.path()).materialize(&mut src, "m", &spec()).unwrap();

        let mut c = cache(dir.path());
        std::fs::remove_file(c.store().fingerprint_file("m").unwrap()).unwrap();
        c.materialize(&mut src, "m", &spec()).unwrap();
        assert_eq!(src.calls, 2);
    }

    #[test]
    fn record_swapped_by_another_writer_is_a_plain_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        let c = cache(dir.path());
        let fp = c.fingerprint(&mut src, &spec()).unwrap();
        let agg = spec().empty_aggregate("mass");
        c.store().write("sel/mass", &agg, &fp).unwrap();

        // Same shape, written for other inputs, landing after our hash record.
        let other = Fingerprint::parse(&"f".repeat(64)).unwrap();
        let hash = std::fs::read(c.store().fingerprint_file("sel/mass").unwrap()).unwrap();
        c.store().write("sel/mass", &agg, &other).unwrap();
        std::fs::write(c.store().fingerprint_file("sel/mass").unwrap(), hash).unwrap();

        let mut c = cache(dir.path());
        let got = c.materialize(&mut src, "sel/mass", &spec()).unwrap();
        assert_eq!(got.values[0], 3.0);
        assert_eq!(src.calls, 1);
        assert_eq!(c.stats().corrupt, 0);
        assert_eq!(c.store().read_entry("sel/mass").unwrap().map(|(f, _)| f), Some(fp));
    }

    #[test]
    fn leaf_and_branch_paths_in_either_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        for (i, order) in [["sr", "sr/count"], ["cr/count", "cr"]].iter().enumerate() {
            let mut c = cache(dir.path());
            for path in order {
                c.materialize(&mut src, path, &spec()).unwrap();
            }
            assert_eq!(src.calls, 2 * (i + 1));
        }

        let mut fresh = cache(dir.path());
        for path in ["sr", "sr/count", "cr", "cr/count"] {
            fresh.materialize(&mut src, path, &spec()).unwrap();
        }
        assert_eq!(fresh.stats().hits, 4);
        assert_eq!(src.calls, 4);
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = AggregateStore::open(dir.path(), StoreKey::new("zmumu", "Z", None)).unwrap();
        let lock = store.lock_file("m").unwrap();
        std::fs::create_dir_all(lock.parent().unwrap()).unwrap();
        std::fs::write(&lock, b"4194303\n").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(2 * 3600);
        std::fs::File::options().write(true).open(&lock).unwrap().set_modified(old).unwrap();

        let config = CacheConfig { lock_wait: Duration::ZERO, ..CacheConfig::default() };
        let mut c = AggregateCache::new(store, config);
        c.materialize(&mut Counting::new(), "m", &spec()).unwrap();
        assert!(!lock.exists());
    }

    #[test]
    fn held_lock_falls_back_to_unlocked_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = AggregateStore::open(dir.path(), StoreKey::new("zmumu", "Z", None)).unwrap();
        let config = CacheConfig { lock_wait: Duration::from_millis(20), ..CacheConfig::default() };
        let _held =
            PathLock::acquire(&store.lock_file("m").unwrap(), Duration::ZERO, Duration::from_secs(60)).unwrap();
        let mut c = AggregateCache::new(store, config);
        let mut src = Counting::new();
        c.materialize(&mut src, "m", &spec()).unwrap();
        assert_eq!(src.calls, 1);
        assert!(c.store().read_aggregate("m").unwrap().is_some());
    }

    #[test]
    fn load_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = Counting::new();
        let mut c = cache(dir.path());
        assert!(c.load("m").unwrap().is_none());
        c.materialize(&mut src, "m", &spec()).unwrap();
        assert!(c.load("m").unwrap().is_some());

        c.clear().unwrap();
        assert!(c.load("m").unwrap().is_none());
        c.materialize(&mut src, "m", &spec()).unwrap();
        assert_eq!(src.calls, 2);
    }

    #[test]
    fn invalid_inputs_are_hard_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cache(dir.path());
        let mut src = Counting::new();
        assert!(c.materialize(&mut src, "a/../b", &spec()).is_err());
        assert!(c.materialize(&mut src, "m", &SelectionSpec::new("1", "1")).is_err());
        assert_eq!(src.calls, 0);
    }

    #[test]
    fn config_yaml_friendly_shape() {
        let cfg: CacheConfig =
            serde_json::from_str(r#"{"fingerprint_mode":"mtime_size","lock_wait_ms":250,"lock_stale_ms":60000}"#)
                .unwrap();
        assert_eq!(cfg.fingerprint_mode, DigestMode::MtimeSize);
        assert_eq!(cfg.lock_wait, Duration::from_millis(250));
        assert_eq!(cfg.lock_stale_after, Duration::from_secs(60));
        assert!(cfg.locking);
    }
}
