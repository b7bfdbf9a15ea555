//! Variable feature selection by mean-binned, z-scored dispersion.
use crate::config::{HvgParams, HvgSelection};
use crate::error::{PipelineError, Stage};
use crate::matrix::{GeneMetadata, GeneRecord};
use crate::stats::equal_population_bins;
use diff_exp::Statistics;
use log::info;
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Mean and dispersion of one log-normalized row, both on the linear scale
fn mean_dispersion(row: &[f64]) -> (f64, f64) {
    let linear = row.iter().map(|v| v.exp_m1()).collect::<Vec<_>>();
    let mean = linear.mean();
    let var = if linear.len() > 1 { linear.var(1.0) } else { 0.0 };
    let dispersion = if mean > 0.0 && var > 0.0 {
        (var / mean).ln()
    } else {
        0.0
    };
    (mean.ln_1p(), dispersion)
}

/// Z-score the dispersions within each bin. Sums run over genes in `order`, so the result
/// does not depend on row order.
fn scale_within_bins(dispersion: &[f64], bins: &[usize], order: &[usize], num_bins: usize) -> Vec<f64> {
    let mut members = vec![Vec::new(); num_bins];
    for &g in order {
        members[bins[g]].push(dispersion[g]);
    }
    let stats = members
        .iter()
        .map(|m| {
            if m.len() < 2 {
                None
            } else {
                Some((m.mean(), m.var(1.0).sqrt()))
            }
        })
        .collect::<Vec<_>>();

    dispersion
        .iter()
        .zip(bins)
        .map(|(&d, &b)| match stats[b] {
            Some((mean, sd)) if sd > 0.0 && sd.is_finite() => (d - mean) / sd,
            _ => 0.0,
        })
        .collect()
}

/// Compute gene statistics of a log-normalized genes x cells matrix and mark the variable
/// genes. Returns the metadata and the variable gene rows ranked by scaled dispersion
/// (ties by row order).
pub fn find_variable_genes(
    normalized: ArrayView2<f64>,
    gene_ids: &[String],
    params: &HvgParams,
) -> Result<(GeneMetadata, Vec<usize>), PipelineError> {
    let stats = normalized
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| mean_dispersion(&row.to_vec()))
        .collect::<Vec<_>>();

    let mut order = (0..gene_ids.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        stats[a]
            .0
            .partial_cmp(&stats[b].0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| gene_ids[a].cmp(&gene_ids[b]))
    });
    let num_bins = params.num_bins.max(1);
    let bins = equal_population_bins(&order, num_bins);
    let dispersion = stats.iter().map(|s| s.1).collect::<Vec<_>>();
    let scaled = scale_within_bins(&dispersion, &bins, &order, num_bins);

    let mut ranked = (0..gene_ids.len()).collect::<Vec<_>>();
    ranked.sort_by(|&a, &b| scaled[b].partial_cmp(&scaled[a]).unwrap_or(Ordering::Equal).then(a.cmp(&b)));
    match params.selection {
        HvgSelection::TopN(n) => ranked.truncate(n.unwrap_or(gene_ids.len())),
        HvgSelection::Cutoffs {
            mean_min,
            mean_max,
            dispersion_min,
        } => ranked.retain(|&g| stats[g].0 > mean_min && stats[g].0 < mean_max && scaled[g] > dispersion_min),
    }
    if ranked.is_empty() {
        return Err(PipelineError::input_shape(
            Stage::VariableFeatures,
            "no gene passes the variable feature selection",
        ));
    }

    let mut is_variable = vec![false; gene_ids.len()];
    for &g in &ranked {
        is_variable[g] = true;
    }
    let genes = gene_ids
        .iter()
        .enumerate()
        .map(|(g, id)| GeneRecord {
            gene_id: id.clone(),
            mean_expression: stats[g].0,
            dispersion: stats[g].1,
            dispersion_scaled: scaled[g],
            is_variable: is_variable[g],
            pc_loadings: vec![],
        })
        .collect();

    info!("selected {} of {} genes as variable", ranked.len(), gene_ids.len());
    Ok((GeneMetadata { genes }, ranked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use rand_pcg::Pcg64Mcg;

    fn random_log_data(genes: usize, cells: usize) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let mut data = Array2::zeros((genes, cells));
        for (g, mut row) in data.axis_iter_mut(Axis(0)).enumerate() {
            let lambda = 0.2 + (g % 17) as f64 * 0.7;
            let pois = Poisson::new(lambda).unwrap();
            // every fifth gene gets an over-dispersed burst
            for (c, v) in row.iter_mut().enumerate() {
                let mut x: f64 = pois.sample(&mut rng);
                if g % 5 == 0 && c % 7 == 0 {
                    x *= 6.0;
                }
                *v = x.ln_1p();
            }
        }
        data
    }

    #[test]
    fn test_mean_dispersion() {
        let (mean, disp) = mean_dispersion(&[0.0, 0.0]);
        assert_eq!((mean, disp), (0.0, 0.0));

        let row = [1.0f64.ln_1p(), 3.0f64.ln_1p()];
        let (mean, disp) = mean_dispersion(&row);
        assert_relative_eq!(mean, 2.0f64.ln_1p(), epsilon = 1e-12);
        // linear values 1, 3: var 2, mean 2
        assert_relative_eq!(disp, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_dispersion_per_bin() {
        let scaled = scale_within_bins(&[1.0, 3.0, 5.0, 9.0], &[0, 0, 1, 1], &[0, 1, 2, 3], 2);
        let s = 2.0f64.sqrt();
        assert_relative_eq!(scaled[0], -1.0 / s, epsilon = 1e-12);
        assert_relative_eq!(scaled[1], 1.0 / s, epsilon = 1e-12);
        assert_relative_eq!(scaled[3], 2.0 / (8.0f64).sqrt(), epsilon = 1e-12);

        // single-member bins scale to zero
        let scaled = scale_within_bins(&[4.0, 2.0], &[0, 1], &[0, 1], 2);
        assert_eq!(scaled, vec![0.0, 0.0]);
    }

    #[test]
    fn test_selection_rules() {
        let data = random_log_data(60, 80);
        let ids = (0..60).map(|g| format!("g{g:02}")).collect::<Vec<_>>();

        let all = HvgParams::default();
        let (meta, ranked) = find_variable_genes(data.view(), &ids, &all).unwrap();
        assert_eq!(ranked.len(), 60);
        assert!(meta.genes.iter().all(|g| g.is_variable));
        for w in ranked.windows(2) {
            assert!(meta.genes[w[0]].dispersion_scaled >= meta.genes[w[1]].dispersion_scaled);
        }

        let top = HvgParams {
            num_bins: 4,
            selection: HvgSelection::TopN(Some(10)),
        };
        let (meta, ranked) = find_variable_genes(data.view(), &ids, &top).unwrap();
        assert_eq!(meta.variable().len(), 10);
        // the bursty genes dominate the ranking
        assert!(ranked.iter().filter(|&&g| g % 5 == 0).count() >= 8);

        let cut = HvgParams {
            selection: HvgSelection::Cutoffs {
                mean_min: 0.5,
                mean_max: 3.0,
                dispersion_min: 0.5,
            },
            ..HvgParams::default()
        };
        let (meta, _) = find_variable_genes(data.view(), &ids, &cut).unwrap();
        for g in meta.genes.iter().filter(|g| g.is_variable) {
            assert!(g.mean_expression > 0.5 && g.mean_expression < 3.0 && g.dispersion_scaled > 0.5);
        }

        let none = HvgParams {
            selection: HvgSelection::Cutoffs {
                mean_min: 100.0,
                mean_max: 200.0,
                dispersion_min: 0.0,
            },
            ..HvgParams::default()
        };
        assert!(find_variable_genes(data.view(), &ids, &none).is_err());
    }

    #[test]
    fn test_invariant_to_row_order() {
        let data = random_log_data(60, 80);
        let ids = (0..60).map(|g| format!("g{g:02}")).collect::<Vec<_>>();
        let params = HvgParams {
            selection: HvgSelection::TopN(Some(15)),
            ..HvgParams::default()
        };
        let (_, ranked) = find_variable_genes(data.view(), &ids, &params).unwrap();
        let mut selected = ranked.iter().map(|&g| ids[g].clone()).collect::<Vec<_>>();
        selected.sort();

        let perm = (0..60).rev().collect::<Vec<_>>();
        let shuffled = data.select(Axis(0), &perm);
        let shuffled_ids = perm.iter().map(|&g| ids[g].clone()).collect::<Vec<_>>();
        let (_, ranked) = find_variable_genes(shuffled.view(), &shuffled_ids, &params).unwrap();
        let mut reselected = ranked.iter().map(|&g| shuffled_ids[g].clone()).collect::<Vec<_>>();
        reselected.sort();
        assert_eq!(selected, reselected);

        let tiny = array![[0.0, 1.0], [2.0, 0.0]];
        let (meta, _) = find_variable_genes(tiny.view(), &ids[..2], &HvgParams::default()).unwrap();
        assert_eq!(meta.genes.len(), 2);
    }
}
