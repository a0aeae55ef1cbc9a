//! Category-axis projections of cached aggregates.
//!
//! A projection removes one labelled axis from a rank-2/3 parent by summing
//! the bins whose labels are in a label set. Variances add, so merged bins
//! carry the quadrature sum of their constituents.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use hc_core::{Aggregate, Result, SelectionSpec, strides_of};
use hc_dataset::AggregateSource;

use crate::cache::AggregateCache;
use crate::fingerprint::Fingerprint;

/// A named projection attached to a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionSpec {
    /// Output name; the projection lives at `<parent path>/<name>`.
    pub name: String,
    /// Category axis to merge away.
    pub axis: String,
    /// Labels whose bins are merged.
    pub labels: Vec<String>,
}

impl ProjectionSpec {
    /// New projection of `axis` onto `labels`.
    pub fn new<I, S>(name: impl Into<String>, axis: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { name: name.into(), axis: axis.into(), labels: labels.into_iter().map(Into::into).collect() }
    }

    /// Order- and duplicate-insensitive identity of this projection.
    pub fn key(&self) -> ProjectionKey {
        ProjectionKey::new(&self.axis, &self.labels)
    }
}

/// Canonical `(axis, label set)` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectionKey(String);

impl ProjectionKey {
    /// Key for `axis` and a label set.
    pub fn new(axis: &str, labels: &[String]) -> Self {
        let set: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
        let joined: Vec<&str> = set.into_iter().collect();
        ProjectionKey(format!("{axis}:[{}]", joined.join(",")))
    }
}

/// When persisted projections may be reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionPolicy {
    /// Recompute from the validated parent on every call.
    #[default]
    AlwaysRecompute,
    /// Reuse the persisted output when its parent fingerprint and key match.
    TrustParentFingerprint,
}

/// Persisted projection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProjection {
    /// Fingerprint of the parent it was derived from.
    pub parent_fingerprint: Fingerprint,
    /// Projection identity.
    pub key: ProjectionKey,
    /// The projected aggregate.
    pub aggregate: Aggregate,
}

/// Merge the bins of `labels` along `axis`, removing that axis.
///
/// Rank-1 parents and unknown axes are returned unchanged. If any label is
/// absent on the axis, the result is a zero-valued aggregate of the reduced
/// shape.
pub fn project(parent: &Aggregate, axis: &str, labels: &[String]) -> Aggregate {
    let Some(k) = parent.axis_index(axis) else {
        tracing::debug!(aggregate = %parent.name, axis, "axis not on parent, projection is a no-op");
        return parent.clone();
    };
    if parent.rank() < 2 {
        tracing::debug!(aggregate = %parent.name, axis, "rank-1 parent, projection is a no-op");
        return parent.clone();
    }

    let mut reduced_axes = parent.axes.clone();
    let removed = reduced_axes.remove(k);
    let mut out = Aggregate::zeros(parent.name.clone(), reduced_axes);

    let mut selected = vec![false; removed.n_bins()];
    let unique: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
    for label in unique {
        let bins = removed.label_bins(label);
        if bins.is_empty() {
            tracing::warn!(
                aggregate = %parent.name,
                axis,
                label,
                "label not on axis, returning zero projection"
            );
            return out;
        }
        for b in bins {
            selected[b] = true;
        }
    }

    let shape = parent.shape();
    let strides = parent.strides();
    let out_strides = strides_of(&out.shape());
    for flat in 0..parent.n_cells() {
        if !selected[(flat / strides[k]) % shape[k]] {
            continue;
        }
        let mut o = 0;
        let mut j = 0;
        for d in 0..shape.len() {
            if d == k {
                continue;
            }
            o += ((flat / strides[d]) % shape[d]) * out_strides[j];
            j += 1;
        }
        out.values[o] += parent.values[flat];
        out.variances[o] += parent.variances[flat];
        out.counts[o] += parent.counts[flat];
    }
    out
}

/// Produces projections of cached parents, persisting them under `proj/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionEngine {
    policy: ProjectionPolicy,
}

impl ProjectionEngine {
    /// Engine with `policy`.
    pub fn new(policy: ProjectionPolicy) -> Self {
        Self { policy }
    }

    /// Materialize the parent at `parent_path` and project it.
    ///
    /// The parent always goes through [`AggregateCache::materialize`], so an
    /// invalidated parent is regenerated before any projection is served.
    pub fn materialize(
        &self,
        cache: &mut AggregateCache,
        source: &mut dyn AggregateSource,
        parent_path: &str,
        parent_spec: &SelectionSpec,
        projection: &ProjectionSpec,
    ) -> Result<Aggregate> {
        let (parent_fp, parent) = cache.materialize_fingerprinted(source, parent_path, parent_spec)?;
        let path = format!("{}/{}", parent_path.trim_end_matches('/'), projection.name);
        let key = projection.key();

        if self.policy == ProjectionPolicy::TrustParentFingerprint {
            match cache.store().read_projection::<StoredProjection>(&path) {
                Ok(Some(stored)) if stored.parent_fingerprint == parent_fp && stored.key == key => {
                    tracing::debug!(path = %path, "reusing stored projection");
                    return Ok(stored.aggregate);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path, "{e}; recomputing projection"),
            }
        }

        let mut aggregate = project(&parent, &projection.axis, &projection.labels);
        aggregate.name = projection.name.clone();
        let record = StoredProjection { parent_fingerprint: parent_fp, key, aggregate };
        cache.store().write_projection(&path, &record)?;
        Ok(record.aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hc_core::{Axis, Binning};

    fn labels(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    /// channel (ee, mm, em, ee) x mass (2 bins), cell value = 10*channel + mass + 1.
    fn parent() -> Aggregate {
        let channel = Axis::new("channel", &Binning::uniform(4, 0.0, 4.0))
            .with_labels(labels(&["ee", "mm", "em", "ee"]));
        let mass = Axis::new("mass", &Binning::uniform(2, 60.0, 120.0));
        let mut a = Aggregate::zeros("h", vec![channel, mass]);
        for c in 0..4 {
            for m in 0..2 {
                let cell = a.flat_index(&[c, m]);
                a.values[cell] = (10 * c + m + 1) as f64;
                a.variances[cell] = (c + 1) as f64;
                a.counts[cell] = 1;
            }
        }
        a
    }

    #[test]
    fn label_covering_several_bins() {
        let p = project(&parent(), "channel", &labels(&["ee"]));
        assert_eq!(p.shape(), vec![2]);
        assert_eq!(p.axes[0].name, "mass");
        assert_relative_eq!(p.values[0], 1.0 + 31.0);
        assert_relative_eq!(p.values[1], 2.0 + 32.0);
        assert_relative_eq!(p.variances[0], 1.0 + 4.0);
        assert_eq!(p.counts, vec![2, 2]);
    }

    #[test]
    fn duplicates_counted_once() {
        let once = project(&parent(), "channel", &labels(&["mm"]));
        let twice = project(&parent(), "channel", &labels(&["mm", "mm"]));
        assert_eq!(once, twice);
    }

    #[test]
    fn disjoint_label_sets_add_up() {
        let a = parent();
        let l1 = project(&a, "channel", &labels(&["ee"]));
        let l2 = project(&a, "channel", &labels(&["mm", "em"]));
        let all = project(&a, "channel", &labels(&["ee", "mm", "em"]));
        let mut sum = l1.clone();
        sum.add_assign(&l2).unwrap();
        assert_eq!(sum.values, all.values);
        assert_eq!(sum.variances, all.variances);
        assert_relative_eq!(all.integral().0, a.integral().0);
    }

    #[test]
    fn inner_axis_projection_of_3d() {
        let ax = |n: &str, k: usize| {
            Axis::new(n, &Binning::uniform(k, 0.0, k as f64))
                .with_labels((0..k).map(|i| format!("{n}{i}")).collect())
        };
        let mut a = Aggregate::zeros("h", vec![ax("a", 2), ax("b", 3), ax("c", 2)]);
        for (i, v) in a.values.iter_mut().enumerate() {
            *v = i as f64;
        }
        let p = project(&a, "b", &labels(&["b0", "b2"]));
        assert_eq!(p.shape(), vec![2, 2]);
        // a=0,c=0: cells (0,0,0)=0 and (0,2,0)=4
        assert_relative_eq!(p.values[0], 4.0);
        // a=1,c=1: cells (1,0,1)=7 and (1,2,1)=11
        assert_relative_eq!(p.values[3], 18.0);
    }

    #[test]
    fn absent_label_gives_zeros_of_reduced_shape() {
        let p = project(&parent(), "channel", &labels(&["ee", "tt"]));
        assert_eq!(p.shape(), vec![2]);
        assert_eq!(p.integral(), (0.0, 0.0));
    }

    #[test]
    fn noop_cases() {
        let a = parent();
        assert_eq!(project(&a, "flavour", &labels(&["ee"])), a);

        let one = Aggregate::zeros("x", vec![Axis::new("channel", &Binning::uniform(2, 0.0, 2.0))]);
        assert_eq!(project(&one, "channel", &labels(&["ee"])), one);
    }

    #[test]
    fn key_ignores_order_and_duplicates() {
        let a = ProjectionSpec::new("ll", "channel", ["mm", "ee"]);
        let b = ProjectionSpec::new("ll", "channel", ["ee", "mm", "ee"]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), ProjectionSpec::new("ll", "flavour", ["ee", "mm"]).key());
    }
}
