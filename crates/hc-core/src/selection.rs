//! Selection requests: filter, weight and per-dimension binning.

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, MAX_RANK};
use crate::binning::{Axis, Binning};
use crate::error::{Error, Result};

/// Out-of-range handling while filling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPolicy {
    /// Drop entries outside any axis range.
    #[default]
    Drop,
    /// Fold underflow into the first bin and overflow into the last bin.
    Fold,
}

impl FlowPolicy {
    fn canonical(self) -> &'static str {
        match self {
            FlowPolicy::Drop => "drop",
            FlowPolicy::Fold => "fold",
        }
    }
}

/// One dimension of a selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Expression for the coordinate (e.g. `"m_ll"` or `"channel_index"`).
    pub field: String,
    /// Axis name; defaults to the field expression.
    #[serde(default)]
    pub name: Option<String>,
    /// Binning of this dimension.
    pub binning: Binning,
    /// Optional category labels, one per bin.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl AxisSpec {
    /// New axis spec for `field` with `binning`.
    pub fn new(field: impl Into<String>, binning: Binning) -> Self {
        Self { field: field.into(), name: None, binning, labels: Vec::new() }
    }

    /// Set the axis name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set category labels (one per bin).
    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Effective axis name.
    pub fn axis_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.field)
    }

    /// Materialized axis.
    pub fn to_axis(&self) -> Axis {
        Axis::new(self.axis_name(), &self.binning).with_labels(self.labels.clone())
    }
}

/// A binned-summary request: which entries, with what weight, binned how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSpec {
    /// Filter expression; entries pass when it evaluates > 0.
    pub filter: String,
    /// Per-entry weight expression.
    pub weight: String,
    /// Dimensions (1..=3), outermost first.
    pub axes: Vec<AxisSpec>,
    /// Out-of-range policy.
    #[serde(default)]
    pub flow: FlowPolicy,
}

impl SelectionSpec {
    /// New selection with no axes yet.
    pub fn new(filter: impl Into<String>, weight: impl Into<String>) -> Self {
        Self { filter: filter.into(), weight: weight.into(), axes: Vec::new(), flow: FlowPolicy::Drop }
    }

    /// Add a dimension.
    pub fn axis(mut self, axis: AxisSpec) -> Self {
        self.axes.push(axis);
        self
    }

    /// Set the flow policy.
    pub fn flow(mut self, flow: FlowPolicy) -> Self {
        self.flow = flow;
        self
    }

    /// Check rank, binnings and labels.
    pub fn validate(&self) -> Result<()> {
        if self.axes.is_empty() || self.axes.len() > MAX_RANK {
            return Err(Error::Validation(format!(
                "selection must have 1..={MAX_RANK} axes, got {}",
                self.axes.len()
            )));
        }
        for ax in &self.axes {
            ax.binning.validate()?;
            if !ax.labels.is_empty() && ax.labels.len() != ax.binning.n_bins() {
                return Err(Error::Validation(format!(
                    "axis '{}' has {} labels for {} bins",
                    ax.axis_name(),
                    ax.labels.len(),
                    ax.binning.n_bins()
                )));
            }
        }
        Ok(())
    }

    /// Materialized axes in order.
    pub fn to_axes(&self) -> Vec<Axis> {
        self.axes.iter().map(AxisSpec::to_axis).collect()
    }

    /// Zero-valued aggregate with this selection's shape.
    pub fn empty_aggregate(&self, name: impl Into<String>) -> Aggregate {
        Aggregate::zeros(name, self.to_axes())
    }

    /// Whether `agg` has exactly the axes this selection produces.
    pub fn matches(&self, agg: &Aggregate) -> bool {
        agg.axes == self.to_axes()
    }

    /// Canonical text form. Whitespace inside expressions is insignificant.
    pub fn canonical(&self) -> String {
        let axes: Vec<String> = self
            .axes
            .iter()
            .map(|a| {
                // JSON keeps separators inside labels and names unambiguous.
                let parts = (squash(&a.field), a.axis_name().trim(), a.binning.canonical(), &a.labels);
                serde_json::to_string(&parts).unwrap_or_default()
            })
            .collect();
        format!(
            "filter={};weight={};axes=[{}];flow={}",
            squash(&self.filter),
            squash(&self.weight),
            axes.join(";"),
            self.flow.canonical()
        )
    }
}

fn squash(expr: &str) -> String {
    expr.chars().filter(|c| !c.is_whitespace()).collect()
}
