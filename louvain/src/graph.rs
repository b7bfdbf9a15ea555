use num_traits::bounds::Bounded;
use num_traits::cast::AsPrimitive;
use num_traits::identities::{One, Zero};
use std::ops::AddAssign;

pub trait IndexTrait: AddAssign + AsPrimitive<usize> + Bounded + Copy + One + PartialEq + PartialOrd + Zero {}

impl IndexTrait for usize {}
impl IndexTrait for u32 {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index<Ix: IndexTrait>(Ix);

impl<Ix: IndexTrait> Index<Ix> {
    pub fn index(&self) -> usize {
        self.0.as_()
    }
}

impl<Ix: IndexTrait> From<Ix> for Index<Ix> {
    fn from(ix: Ix) -> Self {
        Index(ix)
    }
}

/// Half of an undirected edge, stored in the adjacency list of its source.
#[derive(Copy, Clone, Debug)]
pub struct HalfEdge<Ix: IndexTrait> {
    pub target: Index<Ix>,
    pub weight: f64,
}

/// A full edge reference as yielded by [`UnGraph::edge_references`].
#[derive(Copy, Clone, Debug)]
pub struct EdgeRef<Ix: IndexTrait> {
    pub source: Index<Ix>,
    pub target: Index<Ix>,
    pub weight: f64,
}

/// Adjacency-list undirected graph with `f64` node and edge weights.
/// Every edge is stored twice, once per endpoint.
#[derive(Clone, Debug, Default)]
pub struct UnGraph<Ix: IndexTrait = u32> {
    pub(crate) adjacency: Vec<Vec<HalfEdge<Ix>>>,
    node_weights: Vec<f64>,
    total_nodes: Ix,
    total_edges: usize,
}

impl<Ix: IndexTrait> UnGraph<Ix> {
    pub fn with_capacity(nodes: usize) -> Self {
        UnGraph {
            adjacency: Vec::with_capacity(nodes),
            node_weights: Vec::with_capacity(nodes),
            total_nodes: Ix::zero(),
            total_edges: 0,
        }
    }

    pub fn add_node(&mut self, weight: f64) -> Index<Ix> {
        let index = self.total_nodes;
        self.adjacency.push(Vec::new());
        self.node_weights.push(weight);
        self.total_nodes += Ix::one();
        Index(index)
    }

    pub fn add_edge(&mut self, source: Index<Ix>, target: Index<Ix>, weight: f64) {
        debug_assert!(source != target, "self loops are tracked by the network, not the graph");
        self.adjacency[source.index()].push(HalfEdge { target, weight });
        self.adjacency[target.index()].push(HalfEdge { target: source, weight });
        self.total_edges += 1;
    }

    pub fn node_count(&self) -> usize {
        self.node_weights.len()
    }

    pub fn edge_count(&self) -> usize {
        self.total_edges
    }

    pub fn node_weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    pub fn node_weight_mut(&mut self, node: usize) -> &mut f64 {
        &mut self.node_weights[node]
    }

    pub fn edges(&self, node: usize) -> impl Iterator<Item = &HalfEdge<Ix>> {
        self.adjacency[node].iter()
    }

    /// Each undirected edge exactly once, from its lower-indexed endpoint.
    pub fn edge_references(&self) -> impl Iterator<Item = EdgeRef<Ix>> + '_ {
        let indices = std::iter::successors(Some(Ix::zero()), |&ix| {
            let mut next = ix;
            next += Ix::one();
            Some(next)
        });
        self.adjacency.iter().zip(indices).flat_map(|(edges, ix)| {
            let source_ix = Index(ix);
            let source = source_ix.index();
            edges
                .iter()
                .filter(move |e| e.target.index() > source)
                .map(move |e| EdgeRef {
                    source: source_ix,
                    target: e.target,
                    weight: e.weight,
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_are_reported_once() {
        let mut g = UnGraph::<u32>::with_capacity(3);
        let a = g.add_node(1.0);
        let b = g.add_node(1.0);
        let c = g.add_node(1.0);
        g.add_edge(a, b, 0.5);
        g.add_edge(c, b, 0.25);

        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.edges(1).count(), 2);
        let refs = g.edge_references().map(|e| (e.source.index(), e.target.index())).collect::<Vec<_>>();
        assert_eq!(refs, vec![(0, 1), (1, 2)]);
    }
}
