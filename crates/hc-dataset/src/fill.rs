//! Single-pass N-dimensional filling from column data with a filter and a weight.

use hc_core::{Aggregate, Axis, Error, FlowPolicy, Result, SelectionSpec};

use crate::expr::CompiledExpr;
use crate::source::{Columns, EventSource};

/// A [`SelectionSpec`] with its expressions compiled.
#[derive(Debug, Clone)]
pub struct CompiledSelection {
    filter: CompiledExpr,
    weight: CompiledExpr,
    fields: Vec<CompiledExpr>,
    axes: Vec<Axis>,
    flow: FlowPolicy,
}

impl CompiledSelection {
    /// Validate and compile a selection.
    pub fn compile(spec: &SelectionSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            filter: CompiledExpr::compile(&spec.filter)?,
            weight: CompiledExpr::compile(&spec.weight)?,
            fields: spec
                .axes
                .iter()
                .map(|a| CompiledExpr::compile(&a.field))
                .collect::<Result<_>>()?,
            axes: spec.to_axes(),
            flow: spec.flow,
        })
    }

    /// Union of all columns referenced by filter, weight and fields.
    pub fn required_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let all = std::iter::once(&self.filter).chain(std::iter::once(&self.weight)).chain(&self.fields);
        for expr in all {
            for c in &expr.columns {
                if !out.contains(c) {
                    out.push(c.clone());
                }
            }
        }
        out
    }

    /// Zero-valued aggregate of this selection's shape.
    pub fn empty(&self, name: &str) -> Aggregate {
        Aggregate::zeros(name, self.axes.clone())
    }

    /// Fill from already-loaded columns. Each accepted entry contributes
    /// `weight * scale`.
    pub fn fill_columns(
        &self,
        name: &str,
        columns: &Columns,
        n_entries: usize,
        scale: f64,
    ) -> Result<Aggregate> {
        let mut agg = self.empty(name);
        if n_entries == 0 {
            return Ok(agg);
        }

        let pass = self.filter.eval_columns(columns, n_entries)?;
        let weights = self.weight.eval_columns(columns, n_entries)?;
        let coords: Vec<Vec<f64>> = self
            .fields
            .iter()
            .map(|f| f.eval_columns(columns, n_entries))
            .collect::<Result<_>>()?;
        let strides = agg.strides();

        let mut skipped_nan_weight = 0u64;
        'entries: for entry in 0..n_entries {
            if pass[entry] <= 0.0 {
                continue;
            }
            let w = weights[entry] * scale;
            if !w.is_finite() {
                skipped_nan_weight += 1;
                continue;
            }
            let mut cell = 0usize;
            for (d, axis) in self.axes.iter().enumerate() {
                let x = coords[d][entry];
                let bin = match self.flow {
                    FlowPolicy::Drop => axis.find_bin(x),
                    FlowPolicy::Fold => axis.find_bin_folded(x),
                };
                match bin {
                    Some(b) => cell += b * strides[d],
                    None => continue 'entries,
                }
            }
            agg.fill_cell(cell, w);
        }

        if skipped_nan_weight > 0 {
            tracing::warn!(aggregate = name, skipped = skipped_nan_weight, "non-finite weights skipped");
        }
        Ok(agg)
    }

    /// Read the required columns from `source` and fill.
    pub fn fill_source(&self, name: &str, source: &dyn EventSource, scale: f64) -> Result<Aggregate> {
        let n = source.n_entries();
        let columns = source.read_columns(&self.required_columns())?;
        for (col, values) in &columns {
            if values.len() != n {
                return Err(Error::DataSource(format!(
                    "{}: column '{col}' has {} values, footer says {n}",
                    source.label(),
                    values.len()
                )));
            }
        }
        self.fill_columns(name, &columns, n, scale)
    }
}
