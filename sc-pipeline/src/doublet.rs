//! Doublet detection from the density of artificial doublets.
//!
//! Random pairs of real cells are averaged into artificial doublets. The merged population
//! is normalized, scaled and embedded again, and every real cell is scored by the fraction
//! of artificial doublets among its nearest neighbors (pANN).
use crate::config::{DoubletParams, HvgParams, NormalizationParams, PcaParams, ScaleParams};
use crate::dim_red::run_pca;
use crate::error::{PipelineError, Stage};
use crate::hvg::find_variable_genes;
use crate::matrix::ExpressionMatrix;
use crate::nn::knn;
use crate::normalization::normalize_counts;
use crate::scale::regress_and_scale;
use log::info;
use ndarray::{s, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::Serialize;

/// Doublet calls of the real cells
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DoubletCalls {
    /// fraction of artificial doublets among the neighbors of each cell
    pub pann: Vec<f64>,
    /// called doublets
    pub is_doublet: Vec<bool>,
    /// artificial doublets generated
    pub num_artificial: usize,
    /// neighbors per cell
    pub k: usize,
    /// cells called
    pub num_expected: usize,
}

/// Artificial doublets to add to `n` real cells so they make up `pn` of the merged set
pub fn num_artificial(n: usize, pn: f64) -> usize {
    (n as f64 / (1.0 - pn) - n as f64).round() as usize
}

/// Number of cells to call. With `clusters`, doublets of two cells from the same cluster
/// are discounted.
pub fn expected_doublets(n: usize, rate: f64, clusters: Option<&[usize]>) -> usize {
    let n_exp = (rate * n as f64).round();
    let n_exp = match clusters {
        Some(labels) if !labels.is_empty() => {
            let num_clusters = labels.iter().max().map_or(0, |m| m + 1);
            let mut sizes = vec![0usize; num_clusters];
            for &l in labels {
                sizes[l] += 1;
            }
            let homotypic: f64 = sizes
                .iter()
                .map(|&s| {
                    let p = s as f64 / labels.len() as f64;
                    p * p
                })
                .sum();
            (n_exp * (1.0 - homotypic)).round()
        }
        _ => n_exp,
    };
    (n_exp as usize).min(n)
}

/// Raw counts of `matrix` followed by `count` averages of random cell pairs
fn with_artificial_doublets(matrix: &ExpressionMatrix, count: usize, seed: u64) -> Array2<f64> {
    let n = matrix.n_cells();
    let raw = matrix.counts_f64();
    let mut merged = Array2::zeros((matrix.n_genes(), n + count));
    merged.slice_mut(s![.., ..n]).assign(&raw);

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    for a in 0..count {
        let i = rng.gen_range(0..n);
        let j = rng.gen_range(0..n);
        let avg = (&raw.column(i) + &raw.column(j)) * 0.5;
        merged.column_mut(n + a).assign(&avg);
    }
    merged
}

/// Score and call the doublets among the cells of `matrix`. `clusters` is only used by the
/// homotypic adjustment.
pub fn detect_doublets(
    matrix: &ExpressionMatrix,
    clusters: Option<&[usize]>,
    params: &DoubletParams,
    normalization: &NormalizationParams,
    hvg: &HvgParams,
    pca: &PcaParams,
) -> Result<DoubletCalls, PipelineError> {
    let n = matrix.n_cells();
    if n == 0 {
        return Err(PipelineError::input_shape(Stage::Doublets, "no cells"));
    }
    let num_artificial = num_artificial(n, params.pn);
    let n_total = n + num_artificial;
    let k = ((params.pk * n_total as f64).round() as usize).max(1);
    if n_total < k + 1 {
        return Err(PipelineError::InsufficientCells {
            stage: Stage::Doublets,
            cells: n_total,
            k,
        });
    }
    info!(
        "doublets: {} artificial doublets for {} cells, {} neighbors",
        num_artificial, n, k
    );

    let merged = with_artificial_doublets(matrix, num_artificial, params.seed);
    let ids = matrix
        .cell_ids()
        .iter()
        .cloned()
        .chain((0..num_artificial).map(|a| format!("artificial_{a}")))
        .collect::<Vec<_>>();
    let normalized = normalize_counts(merged.view(), &ids, normalization)?;

    let (_, variable) = find_variable_genes(normalized.view(), matrix.gene_ids(), hvg)?;
    let selected = normalized.select(Axis(0), &variable);
    let selected_ids = variable
        .iter()
        .map(|&g| matrix.gene_ids()[g].clone())
        .collect::<Vec<_>>();
    let scale_params = ScaleParams {
        covariates: vec![],
        ..ScaleParams::default()
    };
    let (scaled, _) = regress_and_scale(
        selected.view(),
        &selected_ids,
        Array2::zeros((n_total, 0)).view(),
        &scale_params,
    );

    let pca_params = PcaParams {
        num_components: params.num_pcs,
        ..pca.clone()
    };
    let embedding = run_pca(scaled.view(), &pca_params)?;
    let neighbors = knn(embedding.embeddings.view(), k)?;

    let pann = neighbors
        .outer_iter()
        .take(n)
        .map(|row| row.iter().filter(|&&j| j >= n).count() as f64 / k as f64)
        .collect::<Vec<_>>();

    let clusters = if params.homotypic_adjustment { clusters } else { None };
    let num_expected = expected_doublets(n, params.doublet_rate, clusters);
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &b| pann[b].total_cmp(&pann[a]).then(a.cmp(&b)));
    let mut is_doublet = vec![false; n];
    for &c in order.iter().take(num_expected) {
        is_doublet[c] = true;
    }
    info!("doublets: called {} of {} cells", num_expected, n);

    Ok(DoubletCalls {
        pann,
        is_doublet,
        num_artificial,
        k,
        num_expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Poisson};

    /// Four cell types of 50 cells; type `t` expresses genes `20t..20t+20` highly and
    /// genes 80..100 are shared. The last `injected` columns average two cells of
    /// different types.
    fn four_types(injected: usize) -> ExpressionMatrix {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let high = Poisson::new(12.0).unwrap();
        let low = Poisson::new(0.5).unwrap();
        let shared = Poisson::new(5.0).unwrap();
        let singlets = 200;
        let mut counts = Array2::<u32>::zeros((100, singlets + injected));
        for c in 0..singlets {
            let t = c / 50;
            for g in 0..100 {
                let v: f64 = if g >= 80 {
                    shared.sample(&mut rng)
                } else if g / 20 == t {
                    high.sample(&mut rng)
                } else {
                    low.sample(&mut rng)
                };
                counts[[g, c]] = v as u32;
            }
        }
        for d in 0..injected {
            let a = (d % 4) * 50 + d;
            let b = ((d + 1) % 4) * 50 + d + 1;
            for g in 0..100 {
                counts[[g, singlets + d]] = (counts[[g, a]] + counts[[g, b]] + 1) / 2;
            }
        }
        let genes = (0..100).map(|g| format!("gene{g}")).collect();
        let cells = (0..singlets + injected).map(|c| format!("cell{c}")).collect();
        ExpressionMatrix::new(genes, cells, counts).unwrap()
    }

    fn run(matrix: &ExpressionMatrix, params: &DoubletParams) -> Result<DoubletCalls, PipelineError> {
        detect_doublets(
            matrix,
            None,
            params,
            &NormalizationParams::default(),
            &HvgParams::default(),
            &PcaParams::default(),
        )
    }

    #[test]
    fn test_counts() {
        assert_eq!(num_artificial(210, 0.25), 70);
        assert_eq!(num_artificial(100, 0.25), 33);
        assert_eq!(expected_doublets(210, 0.04, None), 8);
        assert_eq!(expected_doublets(100, 0.04, None), 4);

        let labels = (0..100).map(|c| c / 50).collect::<Vec<_>>();
        assert_eq!(expected_doublets(100, 0.04, Some(labels.as_slice())), 2);
        assert_eq!(expected_doublets(3, 2.0, None), 3);
    }

    #[test]
    fn test_injected_doublets_are_called() {
        let matrix = four_types(10);
        let calls = run(&matrix, &DoubletParams::default()).unwrap();
        assert_eq!(calls.num_artificial, 70);
        assert_eq!(calls.k, 25);
        assert_eq!(calls.num_expected, 8);
        assert_eq!(calls.is_doublet.iter().filter(|&&d| d).count(), 8);
        assert!(calls.is_doublet[..200].iter().all(|&d| !d));

        let lowest_injected = calls.pann[200..].iter().copied().fold(f64::INFINITY, f64::min);
        let highest_singlet = calls.pann[..200].iter().copied().fold(0.0, f64::max);
        assert!(lowest_injected > highest_singlet);

        let again = run(&matrix, &DoubletParams::default()).unwrap();
        assert_eq!(calls, again);
    }

    #[test]
    fn test_exact_number_called() {
        let matrix = four_types(0);
        let params = DoubletParams {
            doublet_rate: 0.1,
            ..DoubletParams::default()
        };
        let calls = run(&matrix, &params).unwrap();
        assert_eq!(calls.is_doublet.iter().filter(|&&d| d).count(), 20);
        assert!(calls.pann.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_insufficient_cells() {
        let counts = Array2::from_shape_fn((5, 3), |(g, c)| (g + c + 1) as u32);
        let matrix = ExpressionMatrix::new(
            (0..5).map(|g| format!("g{g}")).collect(),
            (0..3).map(|c| format!("c{c}")).collect(),
            counts,
        )
        .unwrap();
        let params = DoubletParams {
            pk: 0.9,
            ..DoubletParams::default()
        };
        assert!(matches!(
            run(&matrix, &params),
            Err(PipelineError::InsufficientCells { stage: Stage::Doublets, .. })
        ));
    }
}
