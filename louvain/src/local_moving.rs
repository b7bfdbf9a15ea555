use crate::{Clustering, Network, ZeroVec};
use log::warn;
use rand::{seq::SliceRandom, Rng};

const MAX_SWEEPS: usize = 1000;

/// Outcome of one local-moving phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MoveStats {
    /// number of sweeps over the node order
    pub sweeps: usize,
    /// total number of node moves
    pub moves: usize,
}

#[derive(Default)]
pub(crate) struct LocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

impl LocalMoving {
    pub fn new(resolution: f64) -> Self {
        LocalMoving {
            resolution,
            ..LocalMoving::default()
        }
    }

    /// Greedily move single nodes to the neighboring cluster with the largest modularity
    /// gain. Sweeps over a random node order drawn from `rng` are repeated until a full
    /// sweep moves nothing.
    pub fn iterate(&mut self, n: &Network, c: &mut impl Clustering, rng: &mut impl Rng) -> MoveStats {
        let mut stats = MoveStats::default();
        let num_nodes = n.nodes();
        let total_edge_weight = n.get_total_edge_weight();
        if num_nodes == 0 || total_edge_weight <= 0.0 {
            return stats;
        }
        let scale = self.resolution / (2.0 * total_edge_weight);

        self.cluster_weights.zero_len(num_nodes);
        self.nodes_per_cluster.zero_len(num_nodes);
        for i in 0..num_nodes {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.nodes_per_cluster[c.get(i)] += 1;
        }

        // stack of unused cluster ids, smallest on top
        self.unused_clusters.clear();
        for i in (0..num_nodes).rev() {
            if self.nodes_per_cluster[i] == 0 {
                self.unused_clusters.push(i);
            }
        }

        self.node_order.clear();
        self.node_order.extend(0..num_nodes);
        self.node_order.shuffle(rng);

        self.edge_weight_per_cluster.zero_len(num_nodes);
        self.neighboring_clusters.clear();

        loop {
            let mut moved_this_sweep = 0;
            stats.sweeps += 1;

            for idx in 0..num_nodes {
                let j = self.node_order[idx];
                let current_cluster = c.get(j);
                let node_weight = n.weight(j);

                // Remove the currently selected node from its current cluster.
                self.cluster_weights[current_cluster] -= node_weight;
                self.nodes_per_cluster[current_cluster] -= 1;
                if self.nodes_per_cluster[current_cluster] == 0 {
                    self.unused_clusters.push(current_cluster);
                }

                // Neighboring clusters, plus one empty cluster so the node can always go alone.
                self.neighboring_clusters.clear();
                if let Some(&empty) = self.unused_clusters.last() {
                    self.neighboring_clusters.push(empty);
                }
                for (target, edge_weight) in n.neighbors(j) {
                    let neighbor_cluster = c.get(target);
                    if self.edge_weight_per_cluster[neighbor_cluster] == 0.0 {
                        self.neighboring_clusters.push(neighbor_cluster);
                    }
                    self.edge_weight_per_cluster[neighbor_cluster] += edge_weight;
                }

                // Staying put wins ties, other ties go to the smaller cluster id, so the
                // result only depends on the node order.
                let mut best_cluster = current_cluster;
                let mut max_qv_increment = self.edge_weight_per_cluster[current_cluster]
                    - node_weight * self.cluster_weights[current_cluster] * scale;

                for &l in &self.neighboring_clusters {
                    let qv_increment =
                        self.edge_weight_per_cluster[l] - node_weight * self.cluster_weights[l] * scale;
                    if qv_increment > max_qv_increment
                        || (qv_increment == max_qv_increment && best_cluster != current_cluster && l < best_cluster)
                    {
                        best_cluster = l;
                        max_qv_increment = qv_increment;
                    }
                }
                for &l in &self.neighboring_clusters {
                    self.edge_weight_per_cluster[l] = 0.0;
                }
                self.edge_weight_per_cluster[current_cluster] = 0.0;

                self.cluster_weights[best_cluster] += node_weight;
                self.nodes_per_cluster[best_cluster] += 1;
                if self.unused_clusters.last() == Some(&best_cluster) {
                    self.unused_clusters.pop();
                }

                if best_cluster != current_cluster {
                    c.set(j, best_cluster);
                    moved_this_sweep += 1;
                }
            }

            stats.moves += moved_this_sweep;
            if moved_this_sweep == 0 {
                break;
            }
            if stats.sweeps == MAX_SWEEPS {
                warn!("local moving stopped after {} sweeps with nodes still moving", MAX_SWEEPS);
                break;
            }
        }

        if stats.moves > 0 {
            c.remove_empty_clusters();
        }
        stats
    }
}
