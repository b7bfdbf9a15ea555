use crate::local_moving::LocalMoving;
use crate::objective::modularity;
use crate::{Clustering, Network, SimpleClustering};
use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 0.3;

/// Default number of aggregation rounds per start
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Perform the Louvain clustering algorithm
pub struct Louvain {
    rng: ChaCha20Rng,
    local_moving: LocalMoving,
    resolution: f64,
}

/// Partition found by a Louvain run
#[derive(Clone, Debug)]
pub struct LouvainResult {
    /// cluster labels, relabeled from largest to smallest cluster
    pub clustering: SimpleClustering,
    /// modularity of `clustering` at the run's resolution
    pub modularity: f64,
    /// node moves made by the very first local-moving phase
    pub first_pass_moves: usize,
    /// aggregation rounds performed
    pub iterations: usize,
}

impl Louvain {
    /// Initialize the Louvain algorithm with the given resolution.
    /// An optional random seed can be supplied, otherwise a seed of 0 will be used.
    pub fn new(resolution: f64, seed: Option<u64>) -> Louvain {
        Louvain {
            rng: ChaCha20Rng::seed_from_u64(seed.unwrap_or_default()),
            local_moving: LocalMoving::new(resolution),
            resolution,
        }
    }

    /// Iterate the Louvain algorithm one step: local moving, then recursive aggregation.
    /// Returns whether any label changed, and the number of moves on the top level.
    pub fn iterate<C: Clustering>(&mut self, n: &Network, c: &mut C) -> (bool, usize) {
        // Update the clustering by moving individual nodes between clusters.
        let stats = self.local_moving.iterate(n, c, &mut self.rng);
        let mut update = stats.moves > 0;

        if c.num_clusters() == n.nodes() {
            return (update, stats.moves);
        }

        // Aggregate each cluster into a node and cluster the reduced network, starting from singletons.
        let reduced_n = n.create_reduced_network(c);
        let mut reduced_clusters = C::init_different_clusters(reduced_n.nodes());
        let (reduced_update, _) = self.iterate(&reduced_n, &mut reduced_clusters);
        update |= reduced_update;

        c.merge_clusters(&reduced_clusters);
        (update, stats.moves)
    }

    /// Run from singletons until an iteration changes nothing, or `max_iterations` is reached.
    pub fn run(&mut self, n: &Network, max_iterations: usize) -> LouvainResult {
        let mut clustering = SimpleClustering::init_different_clusters(n.nodes());
        let mut first_pass_moves = None;
        let mut iterations = 0;

        for _ in 0..max_iterations.max(1) {
            iterations += 1;
            let (update, moves) = self.iterate(n, &mut clustering);
            first_pass_moves.get_or_insert(moves);
            if !update {
                break;
            }
        }

        clustering.relabel_by_size();
        let q = modularity(self.resolution, n, &clustering);
        debug!(
            "louvain finished after {} iterations: {} clusters, modularity {:.6}",
            iterations,
            clustering.num_clusters(),
            q
        );
        LouvainResult {
            clustering,
            modularity: q,
            first_pass_moves: first_pass_moves.unwrap_or(0),
            iterations,
        }
    }
}

/// Run `n_starts` independent Louvain starts seeded with `seed`, `seed + 1`, ... and keep the
/// partition with the highest modularity. Ties go to the earliest start.
pub fn run_louvain_multi_start(
    n: &Network,
    resolution: f64,
    n_starts: usize,
    max_iterations: usize,
    seed: u64,
) -> LouvainResult {
    let results = (0..n_starts.max(1))
        .into_par_iter()
        .map(|start| Louvain::new(resolution, Some(seed.wrapping_add(start as u64))).run(n, max_iterations))
        .collect::<Vec<_>>();

    let mut best: Option<LouvainResult> = None;
    for result in results {
        match &best {
            Some(b) if b.modularity >= result.modularity => {}
            _ => best = Some(result),
        }
    }
    // n_starts.max(1) guarantees one result
    best.unwrap_or_else(|| Louvain::new(resolution, Some(seed)).run(n, max_iterations))
}
