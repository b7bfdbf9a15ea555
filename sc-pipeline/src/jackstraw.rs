//! Permutation significance of principal components.
//!
//! Each replicate permutes a small random set of genes across cells, reruns the PCA and
//! collects the absolute loadings of the permuted genes as a null distribution. A
//! component is significant when the empirical p-values of the real loadings are far from
//! uniform.
use crate::config::{JackStrawParams, PcaParams};
use crate::dim_red::{run_pca, PcaEmbedding};
use crate::error::{Diagnostic, PipelineError, Stage};
use log::{info, warn};
use ndarray::{ArrayView2, Axis};
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;

/// Null pools smaller than this per component give unreliable p-values
const MIN_NULL_SIZE: usize = 100;

/// Outcome of the permutation test
#[derive(Clone, Debug, PartialEq)]
pub struct JackStrawResult {
    /// KS p-value of each component
    pub component_p_values: Vec<f64>,
    /// component p-value below `alpha`
    pub significant: Vec<bool>,
    /// components to use downstream
    pub dims: usize,
    /// replicates that completed
    pub replicates_used: usize,
    /// null values per component
    pub null_size: usize,
}

/// Genes permuted per replicate
pub fn num_permuted(genes: usize, params: &JackStrawParams) -> usize {
    let n = (params.prop_freq * genes as f64).round() as usize;
    n.max(params.min_genes).min(genes)
}

/// Fraction of `sorted_null` at least `x`
fn empirical_p(sorted_null: &[f64], x: f64) -> f64 {
    let below = sorted_null.partition_point(|&v| v < x);
    (sorted_null.len() - below) as f64 / sorted_null.len() as f64
}

/// One-sided Kolmogorov-Smirnov test of `p_values` against Uniform(0, 1), alternative
/// that they are stochastically smaller. Returns `(D+, p)`.
pub fn ks_uniform_greater(p_values: &[f64]) -> (f64, f64) {
    let n = p_values.len();
    if n == 0 {
        return (0.0, 1.0);
    }
    let mut sorted = p_values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let d = sorted
        .iter()
        .enumerate()
        .map(|(i, &p)| (i + 1) as f64 / n as f64 - p)
        .fold(0.0, f64::max);
    (d, (-2.0 * n as f64 * d * d).exp().min(1.0))
}

/// Absolute loadings of `genes` after permuting them, one vector per component
fn replicate_null(
    scaled: ArrayView2<f64>,
    k: usize,
    n_perm: usize,
    seed: u64,
    pca_params: &PcaParams,
) -> Result<Vec<Vec<f64>>, PipelineError> {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let genes = index::sample(&mut rng, scaled.nrows(), n_perm).into_vec();

    let mut permuted = scaled.to_owned();
    for &g in &genes {
        let mut row = permuted.row(g).to_vec();
        row.shuffle(&mut rng);
        permuted.row_mut(g).assign(&ndarray::Array1::from(row));
    }

    let params = PcaParams {
        num_components: k,
        ..pca_params.clone()
    };
    let pca = run_pca(permuted.view(), &params)?;
    if pca.num_components() < k {
        return Err(PipelineError::numerical(
            Stage::JackStraw,
            anyhow::format_err!("{} of {} components", pca.num_components(), k),
        ));
    }
    Ok((0..k)
        .map(|j| genes.iter().map(|&g| pca.loadings[[g, j]].abs()).collect())
        .collect())
}

/// Score the components of `pca`, computed from `scaled` (genes x cells), and choose the
/// number of components to keep.
pub fn jackstraw(
    scaled: ArrayView2<f64>,
    pca: &PcaEmbedding,
    params: &JackStrawParams,
    pca_params: &PcaParams,
) -> (JackStrawResult, Vec<Diagnostic>) {
    let k = pca.num_components();
    let n_perm = num_permuted(scaled.nrows(), params);
    info!(
        "jackstraw: {} replicates permuting {} of {} genes, {} components",
        params.replicates,
        n_perm,
        scaled.nrows(),
        k
    );

    let outcomes = (0..params.replicates)
        .into_par_iter()
        .map(|r| replicate_null(scaled, k, n_perm, params.seed.wrapping_add(r as u64), pca_params))
        .collect::<Vec<_>>();

    let mut diagnostics = Vec::new();
    let mut null = vec![Vec::new(); k];
    let mut replicates_used = 0;
    for (r, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(values) => {
                replicates_used += 1;
                for (pool, v) in null.iter_mut().zip(values) {
                    pool.extend(v);
                }
            }
            Err(e) => {
                warn!("jackstraw replicate {} failed: {}", r, e);
                diagnostics.push(Diagnostic::replicate_failure(r, e.to_string()));
            }
        }
    }
    for pool in &mut null {
        pool.sort_by(f64::total_cmp);
    }
    let null_size = null.first().map_or(0, Vec::len);

    let component_p_values = if replicates_used == 0 {
        diagnostics.push(Diagnostic::convergence(
            Stage::JackStraw,
            "replicates",
            "no replicate completed",
        ));
        vec![1.0; k]
    } else {
        if null_size < MIN_NULL_SIZE {
            diagnostics.push(Diagnostic::convergence(
                Stage::JackStraw,
                "null distribution",
                format!("{null_size} null values per component, at least {MIN_NULL_SIZE} needed"),
            ));
        }
        pca.loadings
            .axis_iter(Axis(1))
            .into_par_iter()
            .zip(null.par_iter())
            .map(|(loadings, pool)| {
                let p = loadings.iter().map(|&x| empirical_p(pool, x.abs())).collect::<Vec<_>>();
                ks_uniform_greater(&p).1
            })
            .collect()
    };

    let significant = component_p_values.iter().map(|&p| p < params.alpha).collect::<Vec<_>>();
    let last = significant.iter().rposition(|&s| s).map_or(0, |i| i + 1);
    let dims = last.max(params.min_components).min(k);
    for d in &diagnostics {
        if d.is_low_confidence() {
            warn!("{}", d);
        }
    }
    info!(
        "jackstraw: {} significant components, using {}",
        significant.iter().filter(|&&s| s).count(),
        dims
    );

    (
        JackStrawResult {
            component_p_values,
            significant,
            dims,
            replicates_used,
            null_size,
        },
        diagnostics,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_empirical_p() {
        let null = [0.1, 0.2, 0.2, 0.5];
        assert_eq!(empirical_p(&null, 0.2), 0.75);
        assert_eq!(empirical_p(&null, 0.6), 0.0);
        assert_eq!(empirical_p(&null, 0.0), 1.0);
    }

    #[test]
    fn test_ks() {
        let (d, p) = ks_uniform_greater(&[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(d, 1.0);
        assert_relative_eq!(p, (-8.0f64).exp());

        let uniform = (0..100).map(|i| (i as f64 + 0.5) / 100.0).collect::<Vec<_>>();
        let (d, p) = ks_uniform_greater(&uniform);
        assert_relative_eq!(d, 0.005, epsilon = 1e-12);
        assert!(p > 0.99);
    }

    #[test]
    fn test_num_permuted() {
        let params = JackStrawParams::default();
        assert_eq!(num_permuted(2000, &params), 20);
        assert_eq!(num_permuted(100, &params), 3);
        assert_eq!(num_permuted(2, &params), 2);
    }

    /// 200 genes x 120 cells: genes 0..150 follow three hidden cell factors, the rest noise
    fn structured() -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let factors = Array2::from_shape_fn((3, 120), |_| normal.sample(&mut rng));
        let mut data = Array2::from_shape_fn((200, 120), |_| normal.sample(&mut rng));
        for g in 0..150 {
            let f = g % 3;
            let w = 4.0 - f as f64;
            let signal = &factors.row(f) * w;
            let mut row = data.row_mut(g);
            row += &signal;
        }
        for mut row in data.axis_iter_mut(Axis(0)) {
            crate::stats::standardize_clip(row.view_mut(), 10.0);
        }
        data
    }

    #[test]
    fn test_signal_components_are_significant() {
        let scaled = structured();
        let pca_params = PcaParams {
            num_components: 8,
            ..PcaParams::default()
        };
        let pca = run_pca(scaled.view(), &pca_params).unwrap();
        let params = JackStrawParams {
            prop_freq: 0.05,
            min_components: 1,
            ..JackStrawParams::default()
        };
        let (result, diagnostics) = jackstraw(scaled.view(), &pca, &params, &pca_params);
        assert!(diagnostics.is_empty());
        assert_eq!(result.replicates_used, 10);
        assert_eq!(result.null_size, 100);
        assert!(result.significant[..3].iter().all(|&s| s));
        assert!(result.dims >= 3 && result.dims <= 8);

        let (again, _) = jackstraw(scaled.view(), &pca, &params, &pca_params);
        assert_eq!(result, again);
    }

    #[test]
    fn test_small_null_is_flagged() {
        let scaled = structured();
        let pca_params = PcaParams {
            num_components: 6,
            ..PcaParams::default()
        };
        let pca = run_pca(scaled.view(), &pca_params).unwrap();
        let params = JackStrawParams {
            replicates: 2,
            ..JackStrawParams::default()
        };
        let (result, diagnostics) = jackstraw(scaled.view(), &pca, &params, &pca_params);
        assert_eq!(result.null_size, 6);
        assert!(diagnostics.iter().any(|d| d.is_low_confidence()));
        assert!(result.dims >= 5);
    }

    #[test]
    fn test_seed_near_u64_max() {
        let scaled = structured();
        let pca_params = PcaParams {
            num_components: 4,
            ..PcaParams::default()
        };
        let pca = run_pca(scaled.view(), &pca_params).unwrap();
        let params = JackStrawParams {
            seed: u64::MAX,
            replicates: 2,
            ..JackStrawParams::default()
        };
        let (result, diagnostics) = jackstraw(scaled.view(), &pca, &params, &pca_params);
        assert_eq!(result.replicates_used, 2);
        assert!(diagnostics
            .iter()
            .all(|d| d.kind != crate::error::DiagnosticKind::ReplicateFailure));
    }
}
