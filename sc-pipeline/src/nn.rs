//! Nearest-neighbor and shared-nearest-neighbor graphs over cell embeddings.
use crate::error::{PipelineError, Stage};
use log::{info, warn};
use louvain::Network;
use ndarray::{Array2, ArrayView2, Axis};
use noisy_float::types::{n64, N64};
use num_traits::Bounded;
use rayon::prelude::*;
use std::collections::BTreeMap;
use vpsearch::{BestCandidate, MetricSpace, Tree};

/// One embedded cell
#[derive(Clone, Debug)]
struct Sample<'a> {
    data: &'a [f64],
}

/// Euclidean distance
impl MetricSpace for Sample<'_> {
    type UserData = ();
    type Distance = N64;

    fn distance(&self, other: &Self, _: &Self::UserData) -> Self::Distance {
        let d = self
            .data
            .iter()
            .zip(other.data)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>();
        n64(d.sqrt())
    }
}

/// Search that keeps the `max_item_count` nearest points, ordered by `(distance, index)`
struct CountBasedNeighborhood<Item, Impl>
where
    Item: MetricSpace<Impl>,
    Item::Distance: Ord,
{
    // Max amount of items
    max_item_count: usize,
    // The max distance we have observed so far
    max_observed_distance: Item::Distance,
    // A list of indexes no longer than max_item_count sorted by distance
    distance_x_index: Vec<(Item::Distance, usize)>,
}

impl<Item, Impl> CountBasedNeighborhood<Item, Impl>
where
    Item: MetricSpace<Impl>,
    Item::Distance: Ord + Bounded,
{
    fn new(max_item_count: usize) -> Self {
        CountBasedNeighborhood {
            max_item_count,
            max_observed_distance: <Item::Distance as Bounded>::max_value(),
            distance_x_index: Vec::with_capacity(max_item_count + 1),
        }
    }

    fn clear(&mut self) {
        self.max_observed_distance = <Item::Distance as Bounded>::max_value();
        self.distance_x_index.clear();
    }

    /// Insert a single index in the correct position given that the
    /// `distance_x_index` is already sorted.
    fn insert_index(&mut self, index: usize, distance: Item::Distance) {
        let val = (distance, index);
        let idx = self.distance_x_index.binary_search(&val).unwrap_or_else(|x| x);
        self.distance_x_index.insert(idx, val);
        if self.distance_x_index.len() >= self.max_item_count {
            self.distance_x_index.truncate(self.max_item_count);
            if let Some(last) = self.distance_x_index.last() {
                self.max_observed_distance = last.0;
            }
        }
    }
}

impl<'a, Item, Impl> BestCandidate<Item, Impl> for &'a mut CountBasedNeighborhood<Item, Impl>
where
    Item: MetricSpace<Impl> + Clone,
    Item::Distance: Ord + Bounded,
{
    type Output = std::iter::Cloned<std::slice::Iter<'a, (Item::Distance, usize)>>;

    #[inline]
    fn consider(&mut self, _: &Item, distance: Item::Distance, candidate_index: usize, _: &Item::UserData) {
        if self.max_item_count == 0 {
            return;
        }

        // equal distances are kept so that the smaller index can win the tie
        if distance <= self.max_observed_distance || self.distance_x_index.len() < self.max_item_count {
            self.insert_index(candidate_index, distance);
        }
    }

    #[inline]
    fn distance(&self) -> Item::Distance {
        self.max_observed_distance
    }

    fn result(self, _: &Item::UserData) -> Self::Output {
        self.distance_x_index.as_slice().iter().cloned()
    }
}

/// Default neighbor count: 10% of the cells, between 5 and 20
pub fn default_k(cells: usize) -> usize {
    ((0.1 * cells as f64).round() as usize).clamp(5, 20)
}

/// The `k` nearest neighbors of each row of `v` by Euclidean distance, excluding the row
/// itself. Rows of the result are ordered by distance, ties by index.
pub fn knn(v: ArrayView2<f64>, k: usize) -> Result<Array2<usize>, PipelineError> {
    let cells = v.nrows();
    if cells < k + 1 {
        return Err(PipelineError::InsufficientCells {
            stage: Stage::Neighbors,
            cells,
            k,
        });
    }

    let rows = v.axis_iter(Axis(0)).map(|row| row.to_vec()).collect::<Vec<_>>();
    let samples = rows.iter().map(|d| Sample { data: d }).collect::<Vec<_>>();
    let vp = Tree::new_with_user_data_ref(&samples, &());

    let mut indices = Array2::from_elem((cells, k), usize::MAX);
    indices.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each_init(
        || CountBasedNeighborhood::new(k + 1),
        |neighborhood, (cell, mut out)| {
            neighborhood.clear();
            let mut j = 0;
            for (_, idx) in vp.find_nearest_custom(&samples[cell], &(), neighborhood) {
                if idx != cell && j < k {
                    out[j] = idx;
                    j += 1;
                }
            }
        },
    );
    Ok(indices)
}

/// Shared-nearest-neighbor graph over cells
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborGraph {
    /// number of cells
    pub cells: usize,
    /// neighbors per cell, excluding the cell itself
    pub k: usize,
    /// `cells x k` nearest neighbors
    pub neighbors: Array2<usize>,
    /// undirected edges `(i, j, weight)` with `i < j`, sorted
    pub edges: Vec<(usize, usize, f64)>,
}

impl NeighborGraph {
    /// Number of edges touching each cell
    pub fn degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0; self.cells];
        for &(i, j, _) in &self.edges {
            degrees[i] += 1;
            degrees[j] += 1;
        }
        degrees
    }

    /// Weighted network for community detection
    pub fn to_network(&self) -> Network {
        Network::from_weighted_edges(
            self.cells,
            self.edges.iter().map(|&(i, j, w)| (i as u32, j as u32, w)),
        )
    }
}

/// Jaccard overlap of the self-inclusive neighbor sets for every pair of cells sharing at
/// least one neighbor. Row `i` holds the pairs `(j, weight)` with `j > i`.
fn jaccard_candidates(neighbors: ArrayView2<usize>) -> Vec<Vec<(usize, f64)>> {
    let cells = neighbors.nrows();
    let set_size = neighbors.ncols() + 1;
    let sets = (0..cells)
        .map(|i| {
            let mut s = neighbors.row(i).to_vec();
            s.push(i);
            s.sort_unstable();
            s.dedup();
            s
        })
        .collect::<Vec<_>>();

    let mut members = vec![Vec::new(); cells];
    for (i, s) in sets.iter().enumerate() {
        for &m in s {
            members[m].push(i);
        }
    }

    sets.par_iter()
        .enumerate()
        .map(|(i, s)| {
            let mut shared: BTreeMap<usize, usize> = BTreeMap::new();
            for &m in s {
                for &j in members[m].iter().filter(|&&j| j > i) {
                    *shared.entry(j).or_default() += 1;
                }
            }
            shared
                .into_iter()
                .map(|(j, s)| (j, s as f64 / (2 * set_size - s) as f64))
                .collect()
        })
        .collect()
}

/// Build the shared-nearest-neighbor graph of an embedding (cells x dims). Edges below
/// `prune` are dropped, but a cell left without edges keeps its strongest candidate edge.
pub fn build_snn(embedding: ArrayView2<f64>, k: usize, prune: f64) -> Result<NeighborGraph, PipelineError> {
    let cells = embedding.nrows();
    info!("snn: {} cells, {} neighbors, {} dims", cells, k, embedding.ncols());
    let neighbors = knn(embedding, k)?;
    let candidates = jaccard_candidates(neighbors.view());

    let mut edges = Vec::new();
    let mut has_edge = vec![false; cells];
    // strongest candidate per cell, ties to the smaller neighbor index
    let mut best: Vec<Option<(usize, f64)>> = vec![None; cells];
    let better = |cur: Option<(usize, f64)>, other: usize, w: f64| match cur {
        Some((o, bw)) => w > bw || (w == bw && other < o),
        None => true,
    };
    for (i, row) in candidates.iter().enumerate() {
        for &(j, w) in row {
            if w >= prune {
                edges.push((i, j, w));
                has_edge[i] = true;
                has_edge[j] = true;
            }
            if better(best[i], j, w) {
                best[i] = Some((j, w));
            }
            if better(best[j], i, w) {
                best[j] = Some((i, w));
            }
        }
    }

    let mut rescued = 0;
    for i in 0..cells {
        if has_edge[i] {
            continue;
        }
        if let Some((j, w)) = best[i] {
            edges.push((i.min(j), i.max(j), w));
            has_edge[j] = true;
            rescued += 1;
        }
    }
    if rescued > 0 {
        warn!("snn: {} cells kept their strongest edge below the prune threshold", rescued);
    }
    edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    edges.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);

    info!("snn: {} edges", edges.len());
    Ok(NeighborGraph {
        cells,
        k,
        neighbors,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, s};
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    // Basic n^2 knn algorithm, for testing purposes
    fn exhaustive_knn(v: &ArrayView2<f64>, k: usize) -> Array2<usize> {
        let cells = v.nrows();
        let mut output = Array2::zeros((cells, k));
        for cell in 0..cells {
            let mut nns = (0..cells)
                .filter(|&o| o != cell)
                .map(|o| {
                    let d = (&v.row(cell) - &v.row(o)).mapv(|x| x * x).sum().sqrt();
                    (n64(d), o)
                })
                .collect::<Vec<_>>();
            nns.sort();
            for i in 0..k {
                output[(cell, i)] = nns[i].1;
            }
        }
        output
    }

    #[test]
    fn test_knn() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for ncells in [6, 50, 100] {
            for d in [1, 2, 5, 20] {
                let dist = Normal::new(0.0f64, 1.0f64).unwrap();
                let v = Array2::<f64>::random_using((ncells, d), dist, &mut rng);
                let full = exhaustive_knn(&v.view(), 5);
                for k in [1, 3, 5] {
                    let fast = knn(v.view(), k).unwrap();
                    assert_eq!(fast, full.slice(s![.., 0..k]).to_owned());
                }
            }
        }
    }

    #[test]
    fn test_ties_break_by_index() {
        // all cells at the same point
        let v = Array2::<f64>::zeros((6, 3));
        let nn = knn(v.view(), 3).unwrap();
        assert_eq!(nn.row(0).to_vec(), vec![1, 2, 3]);
        assert_eq!(nn.row(4).to_vec(), vec![0, 1, 2]);
    }

    #[test]
    fn test_insufficient_cells() {
        let v = Array2::<f64>::zeros((5, 2));
        let e = knn(v.view(), 5).unwrap_err();
        assert!(matches!(e, PipelineError::InsufficientCells { cells: 5, k: 5, .. }));
    }

    #[test]
    fn test_default_k() {
        assert_eq!(default_k(10), 5);
        assert_eq!(default_k(120), 12);
        assert_eq!(default_k(10_000), 20);
    }

    #[test]
    fn test_jaccard() {
        // 0 -> 1, 1 -> 0, 2 -> 1, 3 -> 2
        let neighbors = array![[1], [0], [1], [2]];
        let cand = jaccard_candidates(neighbors.view());
        // {0,1} and {0,1}: 2 shared of 2
        assert_eq!(cand[0], vec![(1, 1.0), (2, 1.0 / 3.0)]);
        // {0,1} and {1,2}: 1 shared of 3
        assert_eq!(cand[1], vec![(2, 1.0 / 3.0)]);
        assert_eq!(cand[2], vec![(3, 1.0 / 3.0)]);
        assert!(cand[3].is_empty());
    }

    #[test]
    fn test_snn_two_blobs() {
        let mut rng = Pcg64Mcg::seed_from_u64(2);
        let noise = Array2::<f64>::random_using((60, 4), Normal::new(0.0, 0.1).unwrap(), &mut rng);
        let mut v = noise;
        v.slice_mut(s![30.., 0]).mapv_inplace(|x| x + 10.0);

        let graph = build_snn(v.view(), 5, 1.0 / 15.0).unwrap();
        // no edge crosses between the blobs
        assert!(graph.edges.iter().all(|&(i, j, _)| (i < 30) == (j < 30)));
        assert!(graph.degrees().iter().all(|&d| d > 0));
        for &(i, j, w) in &graph.edges {
            assert!(i < j);
            assert!(w > 0.0 && w <= 1.0);
        }
        let net = graph.to_network();
        assert_eq!(net.nodes(), 60);
        assert_eq!(net.edges(), graph.edges.len());
    }

    #[test]
    fn test_isolated_cell_keeps_best_edge() {
        // cell 4 sits far away; with prune 1 only identical neighbor sets survive
        let v = array![[0.0, 0.0], [0.1, 0.0], [0.0, 0.1], [0.1, 0.1], [50.0, 50.0]];
        let graph = build_snn(v.view(), 1, 1.0).unwrap();
        assert!(graph.degrees().iter().all(|&d| d > 0));
        let e4 = graph.edges.iter().filter(|e| e.1 == 4).collect::<Vec<_>>();
        assert_eq!(e4.len(), 1);
        assert_relative_eq!(e4[0].2, 1.0 / 3.0);
    }
}
