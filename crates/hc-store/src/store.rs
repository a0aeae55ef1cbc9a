//! On-disk container of one `(analysis, sample, shift)`.
//!
//! ```text
//! <cache_root>/<analysis>/<sample>/<shift|nominal>/
//!     agg/<path>.json      aggregate, with the fingerprint it was built for
//!     hash/<path>.sha256   fingerprint (one hex digest)
//!     proj/<path>.json     derived projection
//!     lock/<path>.lock     advisory writer lock
//!     skim.json            scalar-count side index
//! ```

use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use hc_core::{Aggregate, Error, Result, path_components};
use hc_dataset::NOMINAL;

use crate::fingerprint::Fingerprint;

const AGG_DIR: &str = "agg";
const HASH_DIR: &str = "hash";
const PROJ_DIR: &str = "proj";
const LOCK_DIR: &str = "lock";
const SKIM_FILE: &str = "skim.json";

/// Identity of one store container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// Analysis name.
    pub analysis: String,
    /// Sample name.
    pub sample: String,
    /// Systematic shift; `None` is the nominal sample.
    pub shift: Option<String>,
}

impl StoreKey {
    /// Key for `(analysis, sample, shift)`.
    pub fn new(analysis: impl Into<String>, sample: impl Into<String>, shift: Option<&str>) -> Self {
        Self { analysis: analysis.into(), sample: sample.into(), shift: shift.map(str::to_string) }
    }

    fn relative_dir(&self) -> Result<PathBuf> {
        let mut dir = PathBuf::new();
        for part in [self.analysis.as_str(), self.sample.as_str(), self.shift.as_deref().unwrap_or(NOMINAL)] {
            // Each part must be a single safe component.
            match path_components(part)?.as_slice() {
                [one] => dir.push(one),
                _ => return Err(Error::Validation(format!("invalid store key component '{part}'"))),
            }
        }
        Ok(dir)
    }
}

/// Persisted aggregates, fingerprints and projections of one container.
#[derive(Debug, Clone)]
pub struct AggregateStore {
    root: PathBuf,
}

/// Record written to `agg/`. Carrying the fingerprint makes the pair a
/// single atomic file for readers that never lock.
#[derive(Serialize, Deserialize)]
struct StoredAggregate {
    fingerprint: Fingerprint,
    aggregate: Aggregate,
}

impl AggregateStore {
    /// Open (creating if needed) the container for `key` under `cache_root`.
    ///
    /// Failing to create the container directory is a hard error.
    pub fn open(cache_root: &Path, key: StoreKey) -> Result<Self> {
        let root = cache_root.join(key.relative_dir()?);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Container directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the aggregate at `path`.
    pub fn aggregate_file(&self, path: &str) -> Result<PathBuf> {
        self.entry_file(AGG_DIR, path, "json")
    }

    /// File holding the fingerprint of the aggregate at `path`.
    pub fn fingerprint_file(&self, path: &str) -> Result<PathBuf> {
        self.entry_file(HASH_DIR, path, "sha256")
    }

    /// File holding the projection at `path`.
    pub fn projection_file(&self, path: &str) -> Result<PathBuf> {
        self.entry_file(PROJ_DIR, path, "json")
    }

    /// Lock file guarding writes of `path`.
    pub fn lock_file(&self, path: &str) -> Result<PathBuf> {
        self.entry_file(LOCK_DIR, path, "lock")
    }

    /// Skim index file.
    pub fn skim_file(&self) -> PathBuf {
        self.root.join(SKIM_FILE)
    }

    fn entry_file(&self, sub: &str, path: &str, ext: &str) -> Result<PathBuf> {
        let parts = path_components(path)?;
        let mut p = self.root.join(sub);
        let (last, dirs) = parts
            .split_last()
            .ok_or_else(|| Error::Validation(format!("empty aggregate path '{path}'")))?;
        for d in dirs {
            p.push(d);
        }
        p.push(format!("{last}.{ext}"));
        Ok(p)
    }

    /// Read the aggregate stored at `path`.
    ///
    /// `Ok(None)` when nothing is stored; [`Error::CacheCorruption`] when the
    /// file exists but cannot be read or is structurally invalid.
    pub fn read_aggregate(&self, path: &str) -> Result<Option<Aggregate>> {
        Ok(self.read_entry(path)?.map(|(_, agg)| agg))
    }

    /// Read the aggregate at `path` together with the fingerprint it was
    /// written for, both from the same file.
    pub fn read_entry(&self, path: &str) -> Result<Option<(Fingerprint, Aggregate)>> {
        let file = self.aggregate_file(path)?;
        let Some(record) = read_json::<StoredAggregate>(&file)? else {
            return Ok(None);
        };
        record
            .aggregate
            .validate()
            .map_err(|e| Error::CacheCorruption(format!("{}: {e}", file.display())))?;
        Ok(Some((record.fingerprint, record.aggregate)))
    }

    /// Read the stored fingerprint of `path`. Unparsable records read as absent.
    pub fn read_fingerprint(&self, path: &str) -> Result<Option<Fingerprint>> {
        let file = self.fingerprint_file(path)?;
        match std::fs::read_to_string(&file) {
            Ok(s) => {
                let fp = Fingerprint::parse(&s);
                if fp.is_none() {
                    tracing::warn!(path, file = %file.display(), "ignoring malformed fingerprint record");
                }
                Ok(fp)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `agg` with its fingerprint.
    ///
    /// Order: remove the fingerprint, write the aggregate, write the
    /// fingerprint. Both writes go through a temp file and a rename, so an
    /// interruption leaves either a valid pair or a missing fingerprint.
    pub fn write(&self, path: &str, agg: &Aggregate, fingerprint: &Fingerprint) -> Result<()> {
        let hash_file = self.fingerprint_file(path)?;
        remove_if_exists(&hash_file)?;
        let record = StoredAggregate { fingerprint: fingerprint.clone(), aggregate: agg.clone() };
        write_json_atomic(&self.aggregate_file(path)?, &record)?;
        write_atomic(&hash_file, format!("{fingerprint}\n").as_bytes())?;
        tracing::debug!(store = %self.root.display(), path, fp = fingerprint.short(), "persisted aggregate");
        Ok(())
    }

    /// Remove every stored aggregate, fingerprint and projection.
    ///
    /// The skim index and lock directory are left alone.
    pub fn clear(&self) -> Result<()> {
        let removed = self.list()?.len();
        for sub in [HASH_DIR, AGG_DIR, PROJ_DIR] {
            match std::fs::remove_dir_all(self.root.join(sub)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(store = %self.root.display(), removed, "cleared");
        Ok(())
    }

    /// Slash-paths of every stored aggregate, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        collect_json(&self.root.join(AGG_DIR), "", &mut out)?;
        out.sort();
        Ok(out)
    }

    /// Read a JSON record from the projection sub-tree.
    pub fn read_projection<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        read_json(&self.projection_file(path)?)
    }

    /// Atomically write a JSON record into the projection sub-tree.
    pub fn write_projection<T: Serialize>(&self, path: &str, record: &T) -> Result<()> {
        write_json_atomic(&self.projection_file(path)?, record)
    }
}

fn collect_json(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let joined = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
        if entry.file_type()?.is_dir() {
            collect_json(&entry.path(), &joined, out)?;
        } else if let Some(stem) = joined.strip_suffix(".json") {
            out.push(stem.to_string());
        }
    }
    Ok(())
}

/// Read JSON from `file`. Missing file is `Ok(None)`; anything unreadable is
/// [`Error::CacheCorruption`].
pub(crate) fn read_json<T: DeserializeOwned>(file: &Path) -> Result<Option<T>> {
    let f = match std::fs::File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::CacheCorruption(format!("{}: {e}", file.display()))),
    };
    serde_json::from_reader(BufReader::new(f))
        .map(Some)
        .map_err(|e| Error::CacheCorruption(format!("{}: {e}", file.display())))
}

pub(crate) fn write_json_atomic<T: Serialize>(file: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    write_atomic(file, &bytes)
}

fn write_atomic(file: &Path, bytes: &[u8]) -> Result<()> {
    let dir = file
        .parent()
        .ok_or_else(|| Error::Validation(format!("no parent directory for {}", file.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        w.write_all(bytes)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(file).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn remove_if_exists(file: &Path) -> Result<()> {
    match std::fs::remove_file(file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_core::{Axis, Binning};

    fn store() -> (tempfile::TempDir, AggregateStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = AggregateStore::open(dir.path(), StoreKey::new("zmumu", "Z", None)).unwrap();
        (dir, s)
    }

    fn agg() -> Aggregate {
        let mut a = Aggregate::zeros("mass", vec![Axis::new("m_ll", &Binning::uniform(2, 0.0, 1.0))]);
        a.fill_cell(1, 2.5);
        a
    }

    fn fp(c: char) -> Fingerprint {
        Fingerprint::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn layout_under_container() {
        let (dir, s) = store();
        assert_eq!(s.root(), dir.path().join("zmumu/Z/nominal"));
        assert_eq!(s.aggregate_file("sel/ee/m.ll").unwrap(), s.root().join("agg/sel/ee/m.ll.json"));
        assert_eq!(s.fingerprint_file("sel/ee/mass").unwrap(), s.root().join("hash/sel/ee/mass.sha256"));
        assert!(s.aggregate_file("../x").is_err());

        let shifted =
            AggregateStore::open(dir.path(), StoreKey::new("zmumu", "Z", Some("JES_up"))).unwrap();
        assert!(shifted.root().ends_with("Z/JES_up"));
        assert!(AggregateStore::open(dir.path(), StoreKey::new("a/b", "Z", None)).is_err());
    }

    #[test]
    fn write_then_read_pair() {
        let (_dir, s) = store();
        assert!(s.read_aggregate("sel/mass").unwrap().is_none());
        assert!(s.read_fingerprint("sel/mass").unwrap().is_none());

        s.write("sel/mass", &agg(), &fp('a')).unwrap();
        assert_eq!(s.read_aggregate("sel/mass").unwrap(), Some(agg()));
        assert_eq!(s.read_fingerprint("sel/mass").unwrap(), Some(fp('a')));

        s.write("sel/mass", &agg(), &fp('b')).unwrap();
        assert_eq!(s.read_fingerprint("sel/mass").unwrap(), Some(fp('b')));
        assert_eq!(s.read_entry("sel/mass").unwrap(), Some((fp('b'), agg())));
        assert_eq!(s.list().unwrap(), vec!["sel/mass".to_string()]);
    }

    #[test]
    fn leaf_and_branch_paths_coexist() {
        let (_dir, s) = store();
        s.write("sr", &agg(), &fp('a')).unwrap();
        s.write("sr/count", &agg(), &fp('b')).unwrap();
        assert_eq!(s.read_fingerprint("sr").unwrap(), Some(fp('a')));
        assert_eq!(s.read_fingerprint("sr/count").unwrap(), Some(fp('b')));
        assert_eq!(s.list().unwrap(), vec!["sr".to_string(), "sr/count".to_string()]);
    }

    #[test]
    fn corrupt_file_is_cache_corruption() {
        let (_dir, s) = store();
        s.write("sel/mass", &agg(), &fp('a')).unwrap();
        std::fs::write(s.aggregate_file("sel/mass").unwrap(), b"{not json").unwrap();
        let err = s.read_aggregate("sel/mass").unwrap_err();
        assert!(matches!(err, Error::CacheCorruption(_)));
    }

    #[test]
    fn malformed_fingerprint_reads_as_absent() {
        let (_dir, s) = store();
        s.write("m", &agg(), &fp('a')).unwrap();
        std::fs::write(s.fingerprint_file("m").unwrap(), b"garbage").unwrap();
        assert!(s.read_fingerprint("m").unwrap().is_none());
    }

    #[test]
    fn clear_keeps_skim_index() {
        let (_dir, s) = store();
        s.write("a/x", &agg(), &fp('a')).unwrap();
        s.write("b", &agg(), &fp('b')).unwrap();
        std::fs::write(s.skim_file(), b"{}").unwrap();
        assert_eq!(s.list().unwrap(), vec!["a/x".to_string(), "b".to_string()]);

        s.clear().unwrap();
        assert!(s.list().unwrap().is_empty());
        assert!(s.read_fingerprint("a/x").unwrap().is_none());
        assert!(s.skim_file().exists());
    }
}
