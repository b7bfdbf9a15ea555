//! Library-size normalization: counts relative to each cell's total, scaled to a constant
//! and optionally log-transformed with `ln(1 + x)`.
use crate::config::{NormalizationMethod, NormalizationParams};
use crate::error::{PipelineError, Stage};
use crate::matrix::ExpressionMatrix;
use log::info;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Library-size normalize a count matrix. See [`normalize_counts`].
pub fn normalize(matrix: &ExpressionMatrix, params: &NormalizationParams) -> Result<Array2<f64>, PipelineError> {
    normalize_counts(matrix.counts_f64().view(), matrix.cell_ids(), params)
}

/// Normalize a genes x cells matrix of (possibly fractional) counts:
/// 1. Scale each column (cell) to a total of `params.scale_factor`
/// 2. For [`NormalizationMethod::LogNormalize`], apply `x -> ln(1 + x)`
///
/// A cell with zero total counts is an error naming the cell.
pub fn normalize_counts(
    counts: ArrayView2<f64>,
    cell_ids: &[String],
    params: &NormalizationParams,
) -> Result<Array2<f64>, PipelineError> {
    let totals = counts.sum_axis(Axis(0)).to_vec();
    if let Some(c) = totals.iter().position(|&t| t <= 0.0) {
        return Err(PipelineError::DegenerateCell {
            stage: Stage::Normalization,
            cell_id: cell_ids.get(c).cloned().unwrap_or_else(|| format!("column {c}")),
        });
    }

    let scale = params.scale_factor;
    let log = params.method == NormalizationMethod::LogNormalize;
    let mut normalized = counts.to_owned();
    normalized
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .zip(totals.par_iter())
        .for_each(|(mut col, &total)| {
            let f = scale / total;
            if log {
                col.mapv_inplace(|v| (v * f).ln_1p());
            } else {
                col.mapv_inplace(|v| v * f);
            }
        });

    info!(
        "normalized {} genes x {} cells ({:?}, scale {})",
        normalized.nrows(),
        normalized.ncols(),
        params.method,
        scale
    );
    Ok(normalized)
}
