/// Trait representing a clustering over a set of items
/// Each item is assigned a single integer label
pub trait Clustering: std::fmt::Debug {
    /// Initialize a fresh clustering with each node in it's own cluster
    fn init_different_clusters(num_nodes: usize) -> Self;

    /// Initialize a fresh clustering with all nodes in a single cluster
    fn init_same_cluster(num_nodes: usize) -> Self;

    /// Initialize the clustering with a known set of labels
    fn new_from_labels(labels: &[usize]) -> Self;

    /// Get the label of node `i`
    fn get(&self, i: usize) -> usize;

    /// Set the label of node 'i'. Note this must update the number of clusters
    fn set(&mut self, i: usize, cluster: usize);

    /// Total number of nodes
    fn nodes(&self) -> usize;

    /// Number of distinct clusters
    fn num_clusters(&self) -> usize;

    /// Reassign node labels, removing unused labels
    fn remove_empty_clusters(&mut self);

    /// Take clustering of the cluster labels, and reassign label to reflect the higher-order clustering
    fn merge_clusters<C: Clustering>(&mut self, cluster_clusterings: &C) {
        for i in 0..self.nodes() {
            self.set(i, cluster_clusterings.get(self.get(i)))
        }

        self.remove_empty_clusters();
    }

    /// Flat label vector
    fn labels(&self) -> Vec<usize> {
        (0..self.nodes()).map(|i| self.get(i)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A basic Vec-backed implementation of `Clustering`
pub struct SimpleClustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl SimpleClustering {
    /// Relabel clusters from largest to smallest. Equal-sized clusters keep the
    /// order in which they first appear, so the result only depends on the partition.
    pub fn relabel_by_size(&mut self) {
        let mut sizes = vec![0usize; self.num_clusters];
        let mut first_seen = vec![usize::MAX; self.num_clusters];
        for (node, &l) in self.labels.iter().enumerate() {
            sizes[l] += 1;
            first_seen[l] = first_seen[l].min(node);
        }
        let mut order = (0..self.num_clusters).filter(|&l| sizes[l] > 0).collect::<Vec<_>>();
        order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(first_seen[a].cmp(&first_seen[b])));

        let mut map = vec![usize::MAX; self.num_clusters];
        for (new, &old) in order.iter().enumerate() {
            map[old] = new;
        }
        for l in self.labels.iter_mut() {
            *l = map[*l];
        }
        self.num_clusters = order.len();
    }

    /// Number of nodes assigned to each cluster
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_clusters];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }
}

impl Clustering for SimpleClustering {
    fn init_different_clusters(num_nodes: usize) -> Self {
        SimpleClustering {
            labels: (0..num_nodes).collect(),
            num_clusters: num_nodes,
        }
    }

    fn init_same_cluster(num_nodes: usize) -> Self {
        SimpleClustering {
            labels: vec![0; num_nodes],
            num_clusters: usize::from(num_nodes > 0),
        }
    }

    fn new_from_labels(input_labels: &[usize]) -> Self {
        let num_clusters = input_labels.iter().max().map_or(0, |m| m + 1);
        let mut r = SimpleClustering {
            labels: input_labels.to_vec(),
            num_clusters,
        };
        r.remove_empty_clusters();
        r
    }

    fn get(&self, node: usize) -> usize {
        self.labels[node]
    }

    fn set(&mut self, node: usize, label: usize) {
        self.labels[node] = label;
        if label >= self.num_clusters {
            self.num_clusters = label + 1;
        }
    }

    fn nodes(&self) -> usize {
        self.labels.len()
    }

    fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    fn remove_empty_clusters(&mut self) {
        let mut counts = vec![0; self.num_clusters];
        for &l in self.labels.iter() {
            counts[l] += 1;
        }

        let mut new_labels = Vec::with_capacity(self.num_clusters);
        let mut new_label = 0;
        for cluster_count in counts {
            if cluster_count == 0 {
                new_labels.push(usize::MAX);
            } else {
                new_labels.push(new_label);
                new_label += 1;
            }
        }

        for l in self.labels.iter_mut() {
            *l = new_labels[*l];
        }
        self.num_clusters = new_label;
    }
}
