//! Louvain clustering of the shared-nearest-neighbor graph.
use crate::config::ClusterParams;
use crate::error::{Diagnostic, Stage};
use crate::nn::NeighborGraph;
use log::{info, warn};
use louvain::{run_louvain_multi_start, Clustering};
use ndarray::ArrayView2;
use serde::Serialize;
use std::collections::BTreeMap;

/// Cluster label of every cell. Labels run `0..num_clusters` from the largest cluster down.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterAssignment {
    /// label per cell
    pub labels: Vec<usize>,
    /// cells per label
    pub sizes: Vec<usize>,
    /// modularity of the partition, 0 when no optimization ran
    pub modularity: f64,
    /// human-readable names of some labels
    pub names: BTreeMap<usize, String>,
}

impl ClusterAssignment {
    fn from_labels(labels: Vec<usize>, modularity: f64, names: &BTreeMap<usize, String>) -> Self {
        let num_clusters = labels.iter().max().map_or(0, |m| m + 1);
        let mut sizes = vec![0; num_clusters];
        for &l in &labels {
            sizes[l] += 1;
        }
        let names = names
            .iter()
            .filter(|(l, _)| **l < num_clusters)
            .map(|(&l, n)| (l, n.clone()))
            .collect();
        ClusterAssignment {
            labels,
            sizes,
            modularity,
            names,
        }
    }

    /// Number of clusters
    pub fn num_clusters(&self) -> usize {
        self.sizes.len()
    }

    /// Name of `label`, or the label itself
    pub fn name(&self, label: usize) -> String {
        self.names.get(&label).cloned().unwrap_or_else(|| label.to_string())
    }
}

/// All rows of `embedding` are the same point
fn is_degenerate(embedding: ArrayView2<f64>) -> bool {
    match embedding.outer_iter().next() {
        Some(first) => embedding.outer_iter().all(|row| row == first),
        None => true,
    }
}

/// Cluster the cells of `graph`; `embedding` is the matrix the graph was built from.
pub fn cluster_cells(
    embedding: ArrayView2<f64>,
    graph: &NeighborGraph,
    params: &ClusterParams,
    names: &BTreeMap<usize, String>,
) -> (ClusterAssignment, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();

    if is_degenerate(embedding) {
        warn!("all {} cells share one embedding point; assigning a single cluster", graph.cells);
        return (ClusterAssignment::from_labels(vec![0; graph.cells], 0.0, names), diagnostics);
    }

    let network = graph.to_network();
    let components = network.connected_components();
    let num_components = components.iter().max().map_or(0, |&c| c + 1);
    info!("snn graph: {} cells in {} connected components", graph.cells, num_components);
    if graph.edges.is_empty() {
        warn!("neighbor graph has no edges; every cell is its own cluster");
        return (ClusterAssignment::from_labels(components, 0.0, names), diagnostics);
    }

    let result = run_louvain_multi_start(
        &network,
        params.resolution,
        params.n_starts,
        params.max_iterations,
        params.seed,
    );
    if result.first_pass_moves == 0 {
        let d = Diagnostic::convergence(
            Stage::Clustering,
            "louvain",
            "the first local-moving pass made no move",
        );
        warn!("{}", d);
        diagnostics.push(d);
    }

    let assignment = ClusterAssignment::from_labels(result.clustering.labels(), result.modularity, names);
    info!(
        "louvain: {} clusters, modularity {:.4}, sizes {:?}",
        assignment.num_clusters(),
        assignment.modularity,
        assignment.sizes
    );
    (assignment, diagnostics)
}
