use crate::{Clustering, Network};

/// Modularity of a network clustering with a resolution parameter:
/// `Q = 1/2m * sum_c (2 * w_c - resolution * K_c^2 / 2m)`, where `w_c` is the
/// edge weight inside cluster `c` (self loops included) and `K_c` the summed
/// weighted degree of its nodes. Returns 0 for a network without edges.
pub fn modularity(resolution: f64, network: &Network, clustering: &impl Clustering) -> f64 {
    let total_edge_weight = network.get_total_edge_weight();
    if total_edge_weight <= 0.0 {
        return 0.0;
    }

    let mut quality = 0.0f64;
    for e in network.graph.edge_references() {
        if clustering.get(e.source.index()) == clustering.get(e.target.index()) {
            quality += 2.0 * e.weight;
        }
    }

    let mut cluster_weights = vec![0.0; clustering.num_clusters()];
    for i in 0..network.nodes() {
        quality += 2.0 * network.self_loop(i);
        cluster_weights[clustering.get(i)] += network.weight(i);
    }

    for cluster_weight in cluster_weights {
        quality -= cluster_weight * cluster_weight * resolution / (2.0 * total_edge_weight);
    }

    quality / (2.0 * total_edge_weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimpleClustering;
    use approx::assert_relative_eq;

    #[test]
    fn test_two_triangles() {
        // two triangles joined by one edge; the textbook split has Q = 5/14
        let n = Network::from_weighted_edges(
            6,
            vec![(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0), (2, 3, 1.0)],
        );
        let split = SimpleClustering::new_from_labels(&[0, 0, 0, 1, 1, 1]);
        assert_relative_eq!(modularity(1.0, &n, &split), 5.0 / 14.0, epsilon = 1e-12);

        let whole = SimpleClustering::init_same_cluster(6);
        assert_relative_eq!(modularity(1.0, &n, &whole), 0.0, epsilon = 1e-12);

        // modularity is invariant to aggregation
        let reduced = n.create_reduced_network(&split);
        let reduced_clusters = SimpleClustering::init_different_clusters(2);
        assert_relative_eq!(
            modularity(1.0, &reduced, &reduced_clusters),
            modularity(1.0, &n, &split),
            epsilon = 1e-12
        );
    }
}
