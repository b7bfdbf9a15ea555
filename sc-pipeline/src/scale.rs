//! Confound regression and scaling of the variable genes.
//!
//! All genes share one design `[1, covariates...]`. Its thin QR factorization is computed
//! once; the residual of a gene is `y - Q Q^T y`, which is then standardized and clipped.
use crate::config::{Covariate, ScaleParams};
use crate::error::{Diagnostic, PipelineError};
use crate::matrix::CellMetadata;
use crate::stats::{mean_sd, standardize_clip};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Relative size below which a diagonal entry of `R` marks the design as singular
const RANK_TOLERANCE: f64 = 1e-10;

/// Covariate columns of the design, cells x covariates. The cell-cycle covariate adds two
/// columns (S then G2M score).
pub fn covariate_matrix(cells: &CellMetadata, covariates: &[Covariate]) -> Result<Array2<f64>, PipelineError> {
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for cov in covariates {
        match cov {
            Covariate::LogLibrarySize => columns.push(cells.cells.iter().map(|c| c.library_size.ln_1p()).collect()),
            Covariate::DetectedFeatures => {
                columns.push(cells.cells.iter().map(|c| c.detected_features as f64).collect())
            }
            Covariate::PercentMito => columns.push(cells.cells.iter().map(|c| c.percent_mito).collect()),
            Covariate::PercentRibo => columns.push(cells.cells.iter().map(|c| c.percent_ribo).collect()),
            Covariate::Contamination(name) => {
                let column = cells
                    .cells
                    .iter()
                    .map(|c| c.contamination.get(name).copied())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| PipelineError::Config(format!("no contamination filter named {name}")))?;
                columns.push(column);
            }
            Covariate::CellCycle => {
                let s = cells.cells.iter().map(|c| c.s_score).collect::<Option<Vec<_>>>();
                let g2m = cells.cells.iter().map(|c| c.g2m_score).collect::<Option<Vec<_>>>();
                match (s, g2m) {
                    (Some(s), Some(g2m)) => {
                        columns.push(s);
                        columns.push(g2m);
                    }
                    _ => {
                        return Err(PipelineError::Config(
                            "the cell-cycle covariate needs S and G2M scores".to_string(),
                        ))
                    }
                }
            }
        }
    }
    Ok(Array2::from_shape_fn((cells.len(), columns.len()), |(c, j)| columns[j][c]))
}

/// Orthonormal basis of the design column space, or why there is none
fn design_basis(covariates: ArrayView2<f64>) -> Result<DMatrix<f64>, String> {
    let n = covariates.nrows();
    let p = covariates.ncols() + 1;
    if n <= p {
        return Err(format!("{p} design columns for {n} cells"));
    }
    if covariates.iter().any(|v| !v.is_finite()) {
        return Err("non-finite covariate value".to_string());
    }
    let x = DMatrix::from_fn(n, p, |i, j| if j == 0 { 1.0 } else { covariates[[i, j - 1]] });
    let qr = x.qr();
    let r = qr.r();
    let max_diag = (0..p).map(|i| r[(i, i)].abs()).fold(0.0, f64::max);
    if (0..p).any(|i| r[(i, i)].abs() <= RANK_TOLERANCE * max_diag) {
        return Err("design matrix is rank deficient".to_string());
    }
    Ok(qr.q())
}

/// Regress `covariates` (cells x p) out of every row of `data` (genes x cells), then
/// standardize each residual row and clip it to `±params.clip`. Rows without variance scale
/// to zero. A gene whose regression fails is scaled from its raw values and reported as a
/// diagnostic.
pub fn regress_and_scale(
    data: ArrayView2<f64>,
    gene_ids: &[String],
    covariates: ArrayView2<f64>,
    params: &ScaleParams,
) -> (Array2<f64>, Vec<Diagnostic>) {
    let basis = design_basis(covariates);
    if let Err(msg) = &basis {
        warn!("regression skipped for all {} genes: {}", data.nrows(), msg);
    }

    let clip = params.clip;
    let mut scaled = data.to_owned();
    let diagnostics = scaled
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(gene_ids.par_iter())
        .filter_map(|(mut row, gene)| {
            if mean_sd(row.view()).1 == 0.0 {
                row.fill(0.0);
                return None;
            }
            let residual = match &basis {
                Ok(q) => {
                    let y = DVector::from_iterator(row.len(), row.iter().copied());
                    let fitted = q * (q.transpose() * &y);
                    let r = y - fitted;
                    if r.iter().all(|v| v.is_finite()) {
                        Ok(r)
                    } else {
                        Err("non-finite residuals".to_string())
                    }
                }
                Err(msg) => Err(msg.clone()),
            };
            let diagnostic = match residual {
                Ok(r) => {
                    row.iter_mut().zip(r.iter()).for_each(|(v, &x)| *v = x);
                    None
                }
                Err(msg) => Some(Diagnostic::singular_regression(gene, msg)),
            };
            standardize_clip(row, clip);
            diagnostic
        })
        .collect::<Vec<_>>();

    if basis.is_ok() {
        for d in &diagnostics {
            warn!("{}", d);
        }
    }
    info!(
        "scaled {} genes x {} cells on {} covariate columns",
        scaled.nrows(),
        scaled.ncols(),
        covariates.ncols()
    );
    (scaled, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticKind;
    use crate::matrix::CellRecord;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("g{i}")).collect()
    }

    #[test]
    fn test_no_covariates_is_z_scoring() {
        let data = array![[1.0, 2.0, 3.0, 4.0], [5.0, 5.0, 5.0, 5.0]];
        let (scaled, diags) = regress_and_scale(data.view(), &ids(2), Array2::zeros((4, 0)).view(), &ScaleParams {
            covariates: vec![],
            clip: 10.0,
        });
        assert!(diags.is_empty());
        let sd = (5.0f64 / 3.0).sqrt();
        assert_relative_eq!(scaled[[0, 0]], -1.5 / sd, epsilon = 1e-12);
        assert_eq!(scaled.row(1).to_vec(), vec![0.0; 4]);
    }

    #[test]
    fn test_regression_removes_covariate() {
        // gene 0 is a linear function of the covariate plus a small alternating signal
        let cov = Array1::from_iter((0..20).map(|c| c as f64));
        let signal = Array1::from_iter((0..20).map(|c| if c % 2 == 0 { 1.0 } else { -1.0 }));
        let mut data = Array2::zeros((2, 20));
        data.row_mut(0).assign(&(&cov * 3.0 + &signal));
        data.row_mut(1).assign(&signal);
        let covariates = cov.clone().insert_axis(Axis(1));

        let (scaled, diags) = regress_and_scale(data.view(), &ids(2), covariates.view(), &ScaleParams::default());
        assert!(diags.is_empty());
        // both genes leave the same residual
        for c in 0..20 {
            assert_relative_eq!(scaled[[0, c]], scaled[[1, c]], epsilon = 1e-9);
        }
        for row in scaled.axis_iter(Axis(0)) {
            assert_relative_eq!(row.sum(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_singular_design_falls_back() {
        let data = array![[1.0, 2.0, 3.0, 9.0], [4.0, 1.0, 0.0, 2.0]];
        // constant covariate duplicates the intercept
        let covariates = Array2::from_elem((4, 1), 2.0);
        let (scaled, diags) = regress_and_scale(data.view(), &ids(2), covariates.view(), &ScaleParams::default());
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].kind, DiagnosticKind::SingularRegression);
        assert_eq!(diags[1].subject, "g1");

        let (z, _) = regress_and_scale(data.view(), &ids(2), Array2::zeros((4, 0)).view(), &ScaleParams::default());
        for (a, b) in scaled.iter().zip(z.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_clip() {
        let mut row = vec![0.0; 200];
        row[0] = 1000.0;
        let data = Array2::from_shape_vec((1, 200), row).unwrap();
        let (scaled, _) = regress_and_scale(data.view(), &ids(1), Array2::zeros((200, 0)).view(), &ScaleParams::default());
        assert_eq!(scaled[[0, 0]], 10.0);
    }

    #[test]
    fn test_covariate_matrix() {
        let mut a = CellRecord::new("a".into(), "x".into());
        a.library_size = 99.0;
        a.percent_mito = 2.5;
        a.s_score = Some(0.1);
        a.g2m_score = Some(0.2);
        let cells = CellMetadata { cells: vec![a] };

        let m = covariate_matrix(&cells, &[Covariate::LogLibrarySize, Covariate::PercentMito, Covariate::CellCycle])
            .unwrap();
        assert_eq!(m.dim(), (1, 4));
        assert_relative_eq!(m[[0, 0]], 100f64.ln());
        assert_eq!(m.row(0).to_vec()[1..], [2.5, 0.1, 0.2]);

        let e = covariate_matrix(&cells, &[Covariate::Contamination("hb".into())]).unwrap_err();
        assert!(matches!(e, PipelineError::Config(_)));
    }
}
