//! Cluster marker genes: every cluster is contrasted against all remaining cells.
//!
//! Effect size is the difference of log mean expression (computed on the linear
//! scale of log1p-normalized data), the significance score is the AUC of the
//! Mann-Whitney statistic, and each row carries the two-sided Wilcoxon p-value
//! with a Bonferroni adjustment over the genes of the contrast.
use crate::rank_sum::{rank_average, rank_sum_test, Ranks};
use crate::stat::neumaier_sum;
use log::{debug, warn};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Parameters of the marker ranking
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct MarkerParams {
    /// a gene is tested when it is detected in at least this fraction of the in- or out-group
    pub min_pct: f64,
    /// minimum absolute log fold change
    pub logfc_threshold: f64,
    /// only report genes up in the cluster
    pub only_positive: bool,
    /// keep at most this many markers per cluster
    pub max_per_cluster: Option<usize>,
}

impl Default for MarkerParams {
    fn default() -> Self {
        MarkerParams {
            min_pct: 0.25,
            logfc_threshold: 0.25,
            only_positive: true,
            max_per_cluster: None,
        }
    }
}

/// One row of a marker table
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    /// gene (row) index
    pub gene: usize,
    /// cluster label of the contrast
    pub cluster: usize,
    /// `ln(mean(expm1(x_in)) + 1) - ln(mean(expm1(x_out)) + 1)`
    pub avg_log_fc: f64,
    /// Mann-Whitney AUC of in- vs out-group
    pub auc: f64,
    /// fraction of in-group cells with expression > 0
    pub pct_in: f64,
    /// fraction of out-group cells with expression > 0
    pub pct_out: f64,
    /// two-sided Wilcoxon rank-sum p-value
    pub p_value: f64,
    /// Bonferroni adjusted p-value
    pub p_value_adj: f64,
}

#[derive(Clone, Copy, Debug)]
struct GroupSummary {
    pct_in: f64,
    pct_out: f64,
    avg_log_fc: f64,
}

fn summarize(row: ArrayView1<f64>, in_group: &[bool], n_in: usize, n_out: usize) -> GroupSummary {
    let mut detected_in = 0usize;
    let mut detected_out = 0usize;
    let mut lin_in = Vec::with_capacity(n_in);
    let mut lin_out = Vec::with_capacity(n_out);
    for (&x, &is_in) in row.iter().zip(in_group) {
        if is_in {
            detected_in += usize::from(x > 0.0);
            lin_in.push(x.exp_m1());
        } else {
            detected_out += usize::from(x > 0.0);
            lin_out.push(x.exp_m1());
        }
    }
    let mean_in = neumaier_sum(lin_in) / n_in as f64;
    let mean_out = neumaier_sum(lin_out) / n_out as f64;
    GroupSummary {
        pct_in: detected_in as f64 / n_in as f64,
        pct_out: detected_out as f64 / n_out as f64,
        avg_log_fc: mean_in.ln_1p() - mean_out.ln_1p(),
    }
}

/// Mid-ranks of every gene (row of `data`) across all cells.
pub fn rank_genes(data: ArrayView2<f64>) -> Vec<Ranks> {
    data.axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| rank_average(&row.to_vec()))
        .collect()
}

/// Markers of one contrast. `data` is genes x cells of log1p-normalized expression, `ranks`
/// the output of [`rank_genes`] on the same data, `in_group` selects the cells of `cluster`.
/// Rows are sorted by effect size, largest first, ties in gene order.
pub fn find_markers(
    data: ArrayView2<f64>,
    ranks: &[Ranks],
    in_group: &[bool],
    cluster: usize,
    params: &MarkerParams,
) -> Vec<Marker> {
    assert_eq!(data.ncols(), in_group.len());
    assert_eq!(data.nrows(), ranks.len());

    let n_in = in_group.iter().filter(|&&b| b).count();
    let n_out = in_group.len() - n_in;
    if n_in == 0 || n_out == 0 {
        warn!("cluster {} has no cells to contrast against, no markers reported", cluster);
        return vec![];
    }
    let mut markers = Vec::new();
    for (gene, row) in data.axis_iter(Axis(0)).enumerate() {
        let s = summarize(row, in_group, n_in, n_out);
        if s.pct_in < params.min_pct && s.pct_out < params.min_pct {
            continue;
        }
        if s.avg_log_fc.abs() < params.logfc_threshold || (params.only_positive && s.avg_log_fc <= 0.0) {
            continue;
        }
        let t = rank_sum_test(&ranks[gene], in_group);
        markers.push(Marker {
            gene,
            cluster,
            avg_log_fc: s.avg_log_fc,
            auc: t.auc,
            pct_in: s.pct_in,
            pct_out: s.pct_out,
            p_value: t.p_value,
            p_value_adj: t.p_value,
        });
    }

    // Bonferroni over the genes that passed the expression filters
    let tested = markers.len() as f64;
    for m in &mut markers {
        m.p_value_adj = (m.p_value * tested).min(1.0);
    }

    // stable sort keeps gene order among equal effect sizes
    markers.sort_by(|a, b| b.avg_log_fc.total_cmp(&a.avg_log_fc));
    if let Some(max) = params.max_per_cluster {
        markers.truncate(max);
    }
    markers
}

/// Markers for every cluster of `labels` (values `0..C`), one table per cluster in label order.
pub fn find_all_markers(data: ArrayView2<f64>, labels: &[usize], params: &MarkerParams) -> Vec<Vec<Marker>> {
    assert_eq!(data.ncols(), labels.len());
    let num_clusters = labels.iter().max().map_or(0, |m| m + 1);
    if num_clusters < 2 {
        warn!("{} cluster(s): no contrasts to rank markers on", num_clusters);
        return vec![vec![]; num_clusters];
    }

    let ranks = rank_genes(data);
    let tables = (0..num_clusters)
        .into_par_iter()
        .map(|cluster| {
            let in_group = labels.iter().map(|&l| l == cluster).collect::<Vec<_>>();
            find_markers(data, &ranks, &in_group, cluster, params)
        })
        .collect::<Vec<_>>();

    debug!(
        "marker tables: {:?} rows per cluster",
        tables.iter().map(Vec::len).collect::<Vec<_>>()
    );
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_distr::Poisson;
    use rand_pcg::Pcg64Mcg;

    /// 50 genes x 200 cells, two groups of 100; genes 0..5 are up in group 1,
    /// genes 5..8 are up in group 0, and gene 49 is almost never detected.
    fn two_group_data() -> (Array2<f64>, Vec<usize>) {
        let mut rng = Pcg64Mcg::seed_from_u64(17);
        let low = Poisson::new(1.0).unwrap();
        let high = Poisson::new(8.0).unwrap();
        let labels = (0..200).map(|c| usize::from(c >= 100)).collect::<Vec<_>>();
        let data = Array2::from_shape_fn((50, 200), |(g, c)| {
            let counts: f64 = if g == 49 {
                if c == 0 {
                    5.0
                } else {
                    0.0
                }
            } else if (g < 5 && labels[c] == 1) || ((5..8).contains(&g) && labels[c] == 0) {
                rng.sample(high)
            } else {
                rng.sample(low)
            };
            counts.ln_1p()
        });
        (data, labels)
    }

    #[test]
    fn test_signature_genes_rank_first() {
        let (data, labels) = two_group_data();
        let tables = find_all_markers(data.view(), &labels, &MarkerParams::default());
        assert_eq!(tables.len(), 2);

        let top1 = tables[1].iter().take(5).map(|m| m.gene).collect::<Vec<_>>();
        let mut sorted = top1.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);

        let top0 = tables[0].iter().take(3).map(|m| m.gene).collect::<Vec<_>>();
        let mut sorted = top0.clone();
        sorted.sort();
        assert_eq!(sorted, vec![5, 6, 7]);

        for table in &tables {
            for w in table.windows(2) {
                assert!(w[0].avg_log_fc >= w[1].avg_log_fc);
            }
            for m in table {
                assert!(m.avg_log_fc >= 0.25);
                assert!(m.auc > 0.5);
                assert!(m.p_value_adj >= m.p_value);
                assert!(m.p_value_adj <= 1.0);
            }
        }
        assert!(tables[1][0].p_value_adj < 1e-10);
    }

    #[test]
    fn test_adjustment_counts_tested_genes() {
        let (data, labels) = two_group_data();
        let tables = find_all_markers(data.view(), &labels, &MarkerParams::default());
        for table in &tables {
            assert!(!table.is_empty() && table.len() < 50);
            for m in table {
                assert_eq!(m.p_value_adj, (m.p_value * table.len() as f64).min(1.0));
            }
        }
    }

    #[test]
    fn test_min_pct_is_respected() {
        let (data, labels) = two_group_data();
        let params = MarkerParams {
            logfc_threshold: 0.0,
            only_positive: false,
            ..MarkerParams::default()
        };
        let tables = find_all_markers(data.view(), &labels, &params);
        for m in tables.iter().flatten() {
            assert!(m.pct_in >= params.min_pct || m.pct_out >= params.min_pct);
            assert_ne!(m.gene, 49);
        }
        // without the positive-only filter, down-regulated genes show up too
        assert!(tables[1].iter().any(|m| m.avg_log_fc < 0.0));
    }

    #[test]
    fn test_single_cluster_has_no_contrast() {
        let (data, _) = two_group_data();
        let tables = find_all_markers(data.view(), &vec![0; 200], &MarkerParams::default());
        assert_eq!(tables, vec![vec![]]);
    }

    #[test]
    fn test_max_per_cluster() {
        let (data, labels) = two_group_data();
        let params = MarkerParams {
            max_per_cluster: Some(2),
            ..MarkerParams::default()
        };
        let tables = find_all_markers(data.view(), &labels, &params);
        assert!(tables.iter().all(|t| t.len() <= 2));
    }

    #[test]
    fn test_params_from_json() {
        let p: MarkerParams = serde_json::from_str(r#"{"min_pct": 0.1}"#).unwrap();
        assert_eq!(p.min_pct, 0.1);
        assert_eq!(p.logfc_threshold, 0.25);
        assert!(p.only_positive);
    }
}
