//! # sc-pipeline: single-cell clustering from a count matrix
//!
//! Quality control, normalization, variable genes, regression, PCA with a permutation
//! test, shared-nearest-neighbor graphs, Louvain clusters, doublet calls, cluster markers
//! and a t-SNE layout.

#![deny(missing_docs)]

/// Cell-cycle module scores and phase calls
pub mod cell_cycle;

/// Louvain clusters of the neighbor graph
pub mod cluster;

/// Run configuration
pub mod config;

/// Principal component analysis
pub mod dim_red;

/// Artificial-doublet detection
pub mod doublet;

/// t-SNE layout
pub mod embed;

/// Errors and recovered diagnostics
pub mod error;

/// Variable gene selection
pub mod hvg;

/// Matrix input and table output
pub mod io;

/// Permutation significance of components
pub mod jackstraw;

/// Cluster marker genes
pub mod markers;

/// Count matrix and metadata
pub mod matrix;

/// Nearest-neighbor graphs
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// Stage records and the runner
pub mod pipeline;

/// Gene and cell quality control
pub mod qc;

/// Confound regression and scaling
pub mod scale;

/// Binning and standardization helpers
pub mod stats;

pub use crate::config::PipelineConfig;
pub use crate::error::{Diagnostic, PipelineError, Stage};
pub use crate::matrix::{CellMetadata, ExpressionMatrix};
pub use crate::pipeline::{Annotated, Pipeline};
