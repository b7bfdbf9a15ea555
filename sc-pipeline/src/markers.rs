//! Marker genes of each cluster against the rest of the cells.
use crate::cluster::ClusterAssignment;
use crate::error::{PipelineError, Stage};
use diff_exp::{find_all_markers, MarkerParams};
use itertools::Itertools;
use log::{debug, info};
use ndarray::ArrayView2;
use serde::Serialize;

/// One marker of one cluster
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MarkerRow {
    /// gene id
    pub gene_id: String,
    /// cluster label
    pub cluster: usize,
    /// configured cluster name, or the label
    pub cluster_name: String,
    /// difference of log mean expression, in minus out
    pub avg_log_fc: f64,
    /// Mann-Whitney AUC
    pub auc: f64,
    /// fraction of cluster cells expressing the gene
    pub pct_in: f64,
    /// fraction of other cells expressing the gene
    pub pct_out: f64,
    /// Wilcoxon rank-sum p-value
    pub p_value: f64,
    /// Bonferroni-adjusted p-value
    pub p_value_adj: f64,
}

/// Markers of all clusters, in label order, by effect size within a cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MarkerTable {
    /// rows
    pub rows: Vec<MarkerRow>,
}

impl MarkerTable {
    /// Markers of `cluster`
    pub fn for_cluster(&self, cluster: usize) -> impl Iterator<Item = &MarkerRow> {
        self.rows.iter().filter(move |r| r.cluster == cluster)
    }

    /// Ids of the `n` strongest markers of `cluster`
    pub fn top_genes(&self, cluster: usize, n: usize) -> Vec<&str> {
        self.for_cluster(cluster).take(n).map(|r| r.gene_id.as_str()).collect()
    }
}

/// Rank the markers of every cluster on a log-normalized genes x cells matrix
pub fn rank_markers(
    normalized: ArrayView2<f64>,
    gene_ids: &[String],
    assignment: &ClusterAssignment,
    params: &MarkerParams,
) -> Result<MarkerTable, PipelineError> {
    if normalized.ncols() != assignment.labels.len() || normalized.nrows() != gene_ids.len() {
        return Err(PipelineError::input_shape(
            Stage::Markers,
            format!(
                "{} x {} matrix for {} genes and {} labeled cells",
                normalized.nrows(),
                normalized.ncols(),
                gene_ids.len(),
                assignment.labels.len()
            ),
        ));
    }

    let tables = find_all_markers(normalized, &assignment.labels, params);
    let rows = tables
        .into_iter()
        .flatten()
        .map(|m| MarkerRow {
            gene_id: gene_ids[m.gene].clone(),
            cluster: m.cluster,
            cluster_name: assignment.name(m.cluster),
            avg_log_fc: m.avg_log_fc,
            auc: m.auc,
            pct_in: m.pct_in,
            pct_out: m.pct_out,
            p_value: m.p_value,
            p_value_adj: m.p_value_adj,
        })
        .collect::<Vec<_>>();
    info!("markers: {} rows over {} clusters", rows.len(), assignment.num_clusters());
    let table = MarkerTable { rows };
    for cluster in 0..assignment.num_clusters() {
        debug!(
            "markers: {} leads with {}",
            assignment.name(cluster),
            table.top_genes(cluster, 5).iter().join(", ")
        );
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn assignment(labels: Vec<usize>) -> ClusterAssignment {
        let mut names = BTreeMap::new();
        names.insert(1, "Slow Twitch".to_string());
        ClusterAssignment {
            sizes: vec![labels.iter().filter(|&&l| l == 0).count(), labels.iter().filter(|&&l| l == 1).count()],
            labels,
            modularity: 0.0,
            names,
        }
    }

    /// gene 0 marks cluster 0, gene 1 marks cluster 1 more weakly, gene 2 is flat and
    /// gene 3 is detected in too few cells to be tested
    fn data() -> Array2<f64> {
        Array2::from_shape_fn((4, 40), |(g, c)| {
            let in0 = c < 20;
            match g {
                0 if in0 => 3.0 + (c % 3) as f64 * 0.1,
                0 => 0.0,
                1 if !in0 => 1.0 + (c % 2) as f64 * 0.1,
                1 => 0.0,
                2 => 1.0,
                _ if c == 39 => 2.0,
                _ => 0.0,
            }
        })
    }

    #[test]
    fn test_rank_markers() {
        let genes = (0..4).map(|g| format!("gene{g}")).collect::<Vec<_>>();
        let labels = (0..40).map(|c| usize::from(c >= 20)).collect::<Vec<_>>();
        let table = rank_markers(data().view(), &genes, &assignment(labels), &MarkerParams::default()).unwrap();

        assert_eq!(table.top_genes(0, 5), vec!["gene0"]);
        assert_eq!(table.top_genes(1, 5), vec!["gene1"]);
        assert!(table.rows.iter().all(|r| r.gene_id != "gene3" && r.gene_id != "gene2"));

        let row = table.for_cluster(0).next().unwrap();
        assert_eq!(row.auc, 1.0);
        assert_eq!(row.pct_in, 1.0);
        assert_eq!(row.pct_out, 0.0);
        assert!(row.p_value_adj <= 1.0 && row.p_value_adj >= row.p_value);
        assert_eq!(row.cluster_name, "0");
        assert_eq!(table.for_cluster(1).next().unwrap().cluster_name, "Slow Twitch");

        // clusters in label order
        assert_eq!(table.rows[0].cluster, 0);
    }

    #[test]
    fn test_shape_mismatch() {
        let genes = (0..4).map(|g| format!("gene{g}")).collect::<Vec<_>>();
        let labels = vec![0; 10];
        assert!(rank_markers(data().view(), &genes, &assignment(labels), &MarkerParams::default()).is_err());
    }
}
