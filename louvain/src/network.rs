use crate::graph::UnGraph;
use crate::Clustering;
use fxhash::FxHashMap;

/// Undirected graph with f64 node and edge weights, indexed by u32. Used to represent the network being clustered.
pub type Graph = UnGraph<u32>;

/// Container for the network graph.
///
/// Node weights hold the weighted degree of each node, which makes the
/// clustering objective the (resolution-scaled) Newman modularity. Edge weight
/// that has collapsed inside an aggregated node is kept as a self loop so the
/// total edge weight of a reduced network equals that of the original one.
#[derive(Clone, Debug, Default)]
pub struct Network {
    pub(crate) graph: Graph,
    pub(crate) self_loops: Vec<f64>,
}

impl Network {
    /// Build a network over `n_nodes` nodes from `(i, j, weight)` triples.
    /// Repeated pairs accumulate their weight; self pairs and non-positive weights are ignored.
    pub fn from_weighted_edges<I>(n_nodes: usize, edges: I) -> Network
    where
        I: IntoIterator<Item = (u32, u32, f64)>,
    {
        let mut merged: FxHashMap<(u32, u32), f64> = FxHashMap::default();
        for (i, j, w) in edges {
            if i == j || w <= 0.0 {
                continue;
            }
            let key = if i < j { (i, j) } else { (j, i) };
            *merged.entry(key).or_insert(0.0) += w;
        }

        // sort so that adjacency lists do not depend on hash order
        let mut merged = merged.into_iter().collect::<Vec<_>>();
        merged.sort_by(|a, b| a.0.cmp(&b.0));

        let mut graph = Graph::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            graph.add_node(0.0);
        }
        for ((i, j), w) in merged {
            graph.add_edge(i.into(), j.into(), w);
            *graph.node_weight_mut(i as usize) += w;
            *graph.node_weight_mut(j as usize) += w;
        }

        Network {
            graph,
            self_loops: vec![0.0; n_nodes],
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of distinct edges, not counting self loops
    pub fn edges(&self) -> usize {
        self.graph.edge_count()
    }

    /// Weighted degree of `node`.
    pub fn weight(&self, node: usize) -> f64 {
        self.graph.node_weight(node)
    }

    /// Edge weight collapsed inside `node` by aggregation.
    pub fn self_loop(&self, node: usize) -> f64 {
        self.self_loops[node]
    }

    /// Iterator over pairs of (adjacent node id, edge_weight) for all neighbors of `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.graph.edges(node).map(|e| (e.target.index(), e.weight))
    }

    /// Total edge weight, each edge counted once, self loops included.
    pub fn get_total_edge_weight(&self) -> f64 {
        self.graph.edge_references().fold(0.0, |acc, e| acc + e.weight) + self.self_loops.iter().sum::<f64>()
    }

    /// Creates a reduced (or aggregate) network based on a clustering.
    /// Each node in the reduced network corresponds to a cluster of nodes in
    /// the original network. The weight of a node in the reduced network equals
    /// the sum of the weights of the nodes in the corresponding cluster. Edges
    /// between clusters are summed; edges inside a cluster become its self loop.
    pub fn create_reduced_network(&self, clustering: &impl Clustering) -> Network {
        let num_clusters = clustering.num_clusters();
        let mut cluster_g = Graph::with_capacity(num_clusters);
        for _ in 0..num_clusters {
            cluster_g.add_node(0.0);
        }

        let mut self_loops = vec![0.0; num_clusters];
        for n in 0..self.nodes() {
            let cluster = clustering.get(n);
            *cluster_g.node_weight_mut(cluster) += self.weight(n);
            self_loops[cluster] += self.self_loops[n];
        }

        let mut edge_memo: FxHashMap<(u32, u32), f64> = FxHashMap::default();
        for e in self.graph.edge_references() {
            let c1 = clustering.get(e.source.index()) as u32;
            let c2 = clustering.get(e.target.index()) as u32;

            if c1 == c2 {
                self_loops[c1 as usize] += e.weight;
                continue;
            }

            let key = if c1 < c2 { (c1, c2) } else { (c2, c1) };
            *edge_memo.entry(key).or_insert(0.0) += e.weight;
        }

        let mut edges = edge_memo.into_iter().collect::<Vec<_>>();
        edges.sort_by(|a, b| a.0.cmp(&b.0));
        for ((c1, c2), weight) in edges {
            cluster_g.add_edge(c1.into(), c2.into(), weight);
        }

        Network {
            graph: cluster_g,
            self_loops,
        }
    }

    /// Label every node with the id of its connected component, numbered in order of first node.
    pub fn connected_components(&self) -> Vec<usize> {
        let mut labels = vec![usize::MAX; self.nodes()];
        let mut next = 0;
        let mut stack = Vec::new();
        for start in 0..self.nodes() {
            if labels[start] != usize::MAX {
                continue;
            }
            labels[start] = next;
            stack.push(start);
            while let Some(node) = stack.pop() {
                for (neighbor, _) in self.neighbors(node) {
                    if labels[neighbor] == usize::MAX {
                        labels[neighbor] = next;
                        stack.push(neighbor);
                    }
                }
            }
            next += 1;
        }
        labels
    }
}
