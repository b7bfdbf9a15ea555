//! Errors and non-fatal diagnostics of a pipeline run.
//!
//! Fatal conditions are [`PipelineError`] values. Recovered conditions (a singular regression
//! for one gene, a failed JackStraw replicate, a clustering that never moved) are recorded as
//! [`Diagnostic`]s and travel with the stage records; a [`DiagnosticKind::Convergence`]
//! diagnostic marks the whole run as low-confidence.
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an error or diagnostic belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// reading the input matrix
    Input,
    /// gene and cell quality filters
    Qc,
    /// library-size normalization
    Normalization,
    /// variable feature selection
    VariableFeatures,
    /// cell-cycle scoring
    CellCycle,
    /// covariate regression and scaling
    Scaling,
    /// principal components
    Pca,
    /// permutation significance of components
    JackStraw,
    /// k-NN and shared-neighbor graph
    Neighbors,
    /// modularity clustering
    Clustering,
    /// artificial doublet scoring
    Doublets,
    /// cluster marker ranking
    Markers,
    /// t-SNE
    Embedding,
    /// writing results
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Qc => "qc",
            Stage::Normalization => "normalization",
            Stage::VariableFeatures => "variable-features",
            Stage::CellCycle => "cell-cycle",
            Stage::Scaling => "scaling",
            Stage::Pca => "pca",
            Stage::JackStraw => "jackstraw",
            Stage::Neighbors => "neighbors",
            Stage::Clustering => "clustering",
            Stage::Doublets => "doublets",
            Stage::Markers => "markers",
            Stage::Embedding => "embedding",
            Stage::Output => "output",
        };
        f.write_str(name)
    }
}

/// Fatal pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// malformed matrix: duplicate ids, bad entries, or nothing left after filtering
    #[error("[{stage}] input shape error: {message}")]
    InputShape {
        /// stage that detected the problem
        stage: Stage,
        /// what is wrong, naming the offending row / column
        message: String,
    },

    /// a cell with zero total counts reached normalization
    #[error("[{stage}] cell {cell_id} has zero total counts")]
    DegenerateCell {
        /// stage that detected the problem
        stage: Stage,
        /// offending cell
        cell_id: String,
    },

    /// the neighbor count needs more cells than there are
    #[error("[{stage}] {cells} cells available, {k} neighbors need at least {}", k + 1)]
    InsufficientCells {
        /// stage that detected the problem
        stage: Stage,
        /// number of cells
        cells: usize,
        /// requested neighbors
        k: usize,
    },

    /// a numerical routine failed
    #[error("[{stage}] numerical failure: {source}")]
    Numerical {
        /// stage of the failing routine
        stage: Stage,
        /// underlying error
        #[source]
        source: anyhow::Error,
    },

    /// invalid parameter values
    #[error("invalid configuration: {0}")]
    Config(String),

    /// reading or writing a file failed
    #[error("[{stage}] {}: {source}", path.display())]
    Io {
        /// stage doing the i/o
        stage: Stage,
        /// file involved
        path: PathBuf,
        /// underlying error
        #[source]
        source: std::io::Error,
    },

    /// writing a table failed
    #[error("[{stage}] {}: {source}", path.display())]
    Csv {
        /// stage doing the i/o
        stage: Stage,
        /// file involved
        path: PathBuf,
        /// underlying error
        #[source]
        source: csv::Error,
    },
}

impl PipelineError {
    /// Shorthand for an [`PipelineError::InputShape`] error
    pub fn input_shape(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::InputShape {
            stage,
            message: message.into(),
        }
    }

    /// Wrap a numerical failure of `stage`
    pub fn numerical(stage: Stage, source: anyhow::Error) -> Self {
        PipelineError::Numerical { stage, source }
    }

    /// Stage of the error, if it has one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::InputShape { stage, .. }
            | PipelineError::DegenerateCell { stage, .. }
            | PipelineError::InsufficientCells { stage, .. }
            | PipelineError::Numerical { stage, .. }
            | PipelineError::Io { stage, .. }
            | PipelineError::Csv { stage, .. } => Some(*stage),
            PipelineError::Config(_) => None,
        }
    }
}

/// Kind of a recovered condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// a gene's regression was singular; it was scaled from its raw values
    SingularRegression,
    /// a permutation replicate failed and was skipped
    ReplicateFailure,
    /// an optimizer or test did not produce a trustworthy result
    Convergence,
}

/// A recovered, non-fatal condition
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Diagnostic {
    /// stage that recorded it
    pub stage: Stage,
    /// what happened
    pub kind: DiagnosticKind,
    /// smallest offending slice: a gene id, a cell id, or a replicate index
    pub subject: String,
    /// details
    pub message: String,
}

impl Diagnostic {
    /// A singular regression for `gene`
    pub fn singular_regression(gene: &str, message: impl Into<String>) -> Self {
        Diagnostic {
            stage: Stage::Scaling,
            kind: DiagnosticKind::SingularRegression,
            subject: gene.to_string(),
            message: message.into(),
        }
    }

    /// A failed permutation replicate
    pub fn replicate_failure(replicate: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            stage: Stage::JackStraw,
            kind: DiagnosticKind::ReplicateFailure,
            subject: format!("replicate {replicate}"),
            message: message.into(),
        }
    }

    /// A convergence warning
    pub fn convergence(stage: Stage, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Diagnostic {
            stage,
            kind: DiagnosticKind::Convergence,
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Whether this diagnostic makes the run low-confidence
    pub fn is_low_confidence(&self) -> bool {
        self.kind == DiagnosticKind::Convergence
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?} {}: {}", self.stage, self.kind, self.subject, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_stage_and_subject() {
        let e = PipelineError::DegenerateCell {
            stage: Stage::Normalization,
            cell_id: "AAAC_ctrl".into(),
        };
        assert_eq!(e.to_string(), "[normalization] cell AAAC_ctrl has zero total counts");
        assert_eq!(e.stage(), Some(Stage::Normalization));

        let e = PipelineError::InsufficientCells {
            stage: Stage::Neighbors,
            cells: 10,
            k: 20,
        };
        assert_eq!(e.to_string(), "[neighbors] 10 cells available, 20 neighbors need at least 21");

        let d = Diagnostic::replicate_failure(3, "svd failed");
        assert_eq!(d.subject, "replicate 3");
        assert!(!d.is_low_confidence());
        assert!(Diagnostic::convergence(Stage::Clustering, "start 0", "no moves").is_low_confidence());
    }
}
