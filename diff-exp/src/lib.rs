//! Rank-based differential expression of cluster marker genes.
#![deny(missing_docs)]

/// cluster-vs-rest marker tables
pub mod markers;
/// Wilcoxon rank-sum test
pub mod rank_sum;
/// statistics extension
pub mod stat;

pub use crate::markers::{find_all_markers, find_markers, rank_genes, Marker, MarkerParams};
pub use crate::rank_sum::{rank_average, rank_sum_test, RankSumTest, Ranks};
pub use crate::stat::Statistics;
