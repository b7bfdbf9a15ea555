//! Stage records and the runner that produces them.
//!
//! Every stage consumes the record of its predecessor and returns a new record that owns
//! it, so the full history of a run stays readable from the final [`Annotated`] record.
//! Cell metadata is copied forward with more fields populated at each step.

use crate::cell_cycle::{score_cell_cycle, CellCycleScores};
use crate::cluster::{cluster_cells, ClusterAssignment};
use crate::config::{Covariate, PipelineConfig};
use crate::dim_red::{run_pca, PcaEmbedding};
use crate::doublet::{detect_doublets, DoubletCalls};
use crate::embed::run_tsne;
use crate::error::{Diagnostic, PipelineError};
use crate::hvg::find_variable_genes;
use crate::io;
use crate::jackstraw::{jackstraw, JackStrawResult};
use crate::markers::{rank_markers, MarkerTable};
use crate::matrix::{CellMetadata, ExpressionMatrix, GeneMetadata};
use crate::nn::{build_snn, default_k, NeighborGraph};
use crate::normalization::normalize;
use crate::qc::{filter, QcReport};
use crate::scale::{covariate_matrix, regress_and_scale};
use log::{info, warn};
use ndarray::{Array2, Axis};
use std::path::{Path, PathBuf};


/// Quality-filtered counts
#[derive(Clone, Debug)]
pub struct FilteredData {
    /// retained genes x retained cells
    pub matrix: ExpressionMatrix,
    /// QC metrics of the retained cells
    pub cells: CellMetadata,
    /// what was removed
    pub report: QcReport,
}

/// Normalized expression
#[derive(Clone, Debug)]
pub struct NormalizedData {
    /// predecessor
    pub filtered: FilteredData,
    /// normalized genes x cells
    pub data: Array2<f64>,
}

/// Gene statistics, variable genes and cell-cycle phases
#[derive(Clone, Debug)]
pub struct FeatureSelection {
    /// predecessor
    pub normalized: NormalizedData,
    /// statistics of every retained gene
    pub genes: GeneMetadata,
    /// variable gene rows by scaled dispersion
    pub ranked: Vec<usize>,
    /// cell-cycle scores, when both signatures were found
    pub cell_cycle: Option<CellCycleScores>,
    /// cells with phases
    pub cells: CellMetadata,
}

/// Regressed and scaled variable genes
#[derive(Clone, Debug)]
pub struct Scaled {
    /// predecessor
    pub features: FeatureSelection,
    /// variable gene rows, in row order
    pub variable: Vec<usize>,
    /// scaled variable genes x cells
    pub data: Array2<f64>,
    /// covariates regressed out
    pub covariates: Vec<Covariate>,
    /// the same genes scaled without the cell-cycle covariate, when it was regressed
    pub unregressed: Option<Array2<f64>>,
}

/// Principal components and the number of them to use
#[derive(Clone, Debug)]
pub struct Reduced {
    /// predecessor
    pub scaled: Scaled,
    /// components of the scaled data
    pub pca: PcaEmbedding,
    /// components before cell-cycle regression
    pub pre_regression_pca: Option<PcaEmbedding>,
    /// permutation test of the components
    pub jackstraw: Option<JackStrawResult>,
    /// components used downstream
    pub dims: usize,
    /// gene statistics with loadings
    pub genes: GeneMetadata,
}

/// Neighbor graph and clusters
#[derive(Clone, Debug)]
pub struct Clustered {
    /// predecessor
    pub reduced: Reduced,
    /// shared-nearest-neighbor graph
    pub graph: NeighborGraph,
    /// cluster labels
    pub assignment: ClusterAssignment,
    /// cells with cluster labels
    pub cells: CellMetadata,
}

/// Doublets, markers and the display embedding
#[derive(Clone, Debug)]
pub struct Annotated {
    /// predecessor
    pub clustered: Clustered,
    /// doublet calls, when enabled
    pub doublets: Option<DoubletCalls>,
    /// markers of every cluster
    pub markers: MarkerTable,
    /// t-SNE layout, when enabled
    pub tsne: Option<Array2<f64>>,
    /// cells with every field populated
    pub cells: CellMetadata,
    /// recovered failures and warnings of the whole run
    pub diagnostics: Vec<Diagnostic>,
    /// some diagnostic makes the result less reliable
    pub low_confidence: bool,
}

impl Annotated {
    /// Filtered counts
    pub fn filtered(&self) -> &FilteredData {
        &self.reduced().scaled.features.normalized.filtered
    }

    /// Normalized expression
    pub fn normalized(&self) -> &NormalizedData {
        &self.reduced().scaled.features.normalized
    }

    /// Principal components and chosen dimensions
    pub fn reduced(&self) -> &Reduced {
        &self.clustered.reduced
    }

    /// Cluster labels
    pub fn assignment(&self) -> &ClusterAssignment {
        &self.clustered.assignment
    }

    /// Write the result tables to `dir`. Returns the files written.
    pub fn write_outputs(&self, dir: impl AsRef<Path>, groups: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
        let dir = dir.as_ref();
        let cell_ids = self.filtered().matrix.cell_ids();
        let mut written = Vec::new();

        let path = dir.join("clusters.tsv");
        io::write_clusters(&path, &self.cells, self.assignment())?;
        written.push(path);

        let path = dir.join("markers.tsv");
        io::write_markers(&path, &self.markers)?;
        written.push(path);

        let path = dir.join("qc_metrics.tsv");
        io::write_cell_metadata(&path, &self.cells)?;
        written.push(path);

        written.extend(io::write_normalized_by_group(
            dir,
            self.normalized().data.view(),
            self.filtered().matrix.gene_ids(),
            &self.cells,
            groups,
        )?);

        let reduced = self.reduced();
        let path = dir.join("pca.csv.gz");
        io::write_embedding(&path, cell_ids, reduced.pca.embeddings_upto(reduced.dims), "PC")?;
        written.push(path);

        if let Some(tsne) = &self.tsne {
            let path = dir.join("tsne.csv.gz");
            io::write_embedding(&path, cell_ids, tsne.view(), "tSNE")?;
            written.push(path);
        }
        info!("wrote {} files to {}", written.len(), dir.display());
        Ok(written)
    }
}

/// Runs the stages in order, collecting diagnostics
pub struct Pipeline {
    config: PipelineConfig,
    diagnostics: Vec<Diagnostic>,
}

impl Pipeline {
    /// Runner for a validated `config`
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Pipeline {
            config,
            diagnostics: Vec::new(),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Diagnostics collected so far
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// All stages on `matrix`
    pub fn run(mut self, matrix: &ExpressionMatrix) -> Result<Annotated, PipelineError> {
        let filtered = self.filter(matrix)?;
        let normalized = self.normalize(filtered)?;
        let features = self.select_features(normalized)?;
        let scaled = self.scale(features)?;
        let reduced = self.reduce(scaled)?;
        let clustered = self.cluster(reduced)?;
        self.annotate(clustered)
    }

    /// Quality control
    pub fn filter(&mut self, matrix: &ExpressionMatrix) -> Result<FilteredData, PipelineError> {
        let (matrix, cells, report) = filter(matrix, &self.config.qc, self.config.group_delimiter())?;
        Ok(FilteredData { matrix, cells, report })
    }

    /// Library-size normalization
    pub fn normalize(&mut self, filtered: FilteredData) -> Result<NormalizedData, PipelineError> {
        let data = normalize(&filtered.matrix, &self.config.normalization)?;
        Ok(NormalizedData { filtered, data })
    }

    /// Variable genes and cell-cycle scores
    pub fn select_features(&mut self, normalized: NormalizedData) -> Result<FeatureSelection, PipelineError> {
        let gene_ids = normalized.filtered.matrix.gene_ids();
        let (genes, ranked) = find_variable_genes(normalized.data.view(), gene_ids, &self.config.hvg)?;

        let params = &self.config.cell_cycle;
        let cell_cycle = if params.s_genes.is_empty() && params.g2m_genes.is_empty() {
            None
        } else {
            score_cell_cycle(normalized.data.view(), gene_ids, params)
        };
        let cells = match &cell_cycle {
            Some(scores) => {
                let values = scores.s.iter().zip(&scores.g2m).zip(&scores.phase);
                normalized.filtered.cells.with(values, |rec, ((&s, &g2m), &phase)| {
                    rec.s_score = Some(s);
                    rec.g2m_score = Some(g2m);
                    rec.phase = Some(phase);
                })
            }
            None => normalized.filtered.cells.clone(),
        };
        info!("{} variable genes of {}", ranked.len(), gene_ids.len());

        Ok(FeatureSelection {
            normalized,
            genes,
            ranked,
            cell_cycle,
            cells,
        })
    }

    /// Regression and scaling of the variable genes
    pub fn scale(&mut self, features: FeatureSelection) -> Result<Scaled, PipelineError> {
        let variable = features.genes.variable();
        let data = features.normalized.data.select(Axis(0), &variable);
        let ids = variable
            .iter()
            .map(|&g| features.genes.genes[g].gene_id.clone())
            .collect::<Vec<_>>();

        let has_scores = features.cell_cycle.is_some();
        let mut covariates = self.config.scale.covariates.clone();
        if !has_scores && covariates.contains(&Covariate::CellCycle) {
            warn!("no cell-cycle scores; the cell-cycle covariate is dropped");
            covariates.retain(|c| *c != Covariate::CellCycle);
        }
        if has_scores && self.config.cell_cycle.regress && !covariates.contains(&Covariate::CellCycle) {
            covariates.push(Covariate::CellCycle);
        }

        let params = &self.config.scale;
        let design = covariate_matrix(&features.cells, &covariates)?;
        let (scaled, diagnostics) = regress_and_scale(data.view(), &ids, design.view(), params);
        self.diagnostics.extend(diagnostics);

        let unregressed = if covariates.contains(&Covariate::CellCycle) {
            let without = covariates
                .iter()
                .filter(|&c| *c != Covariate::CellCycle)
                .cloned()
                .collect::<Vec<_>>();
            let design = covariate_matrix(&features.cells, &without)?;
            let (unregressed, _) = regress_and_scale(data.view(), &ids, design.view(), params);
            Some(unregressed)
        } else {
            None
        };

        Ok(Scaled {
            features,
            variable,
            data: scaled,
            covariates,
            unregressed,
        })
    }

    /// Principal components and their significance
    pub fn reduce(&mut self, scaled: Scaled) -> Result<Reduced, PipelineError> {
        let pca = run_pca(scaled.data.view(), &self.config.pca)?;
        let pre_regression_pca = match &scaled.unregressed {
            Some(data) => Some(run_pca(data.view(), &self.config.pca)?),
            None => None,
        };

        let jackstraw = if self.config.jackstraw.enabled {
            let (result, diagnostics) = jackstraw(scaled.data.view(), &pca, &self.config.jackstraw, &self.config.pca);
            self.diagnostics.extend(diagnostics);
            Some(result)
        } else {
            None
        };
        let dims = match (self.config.neighbors.dims, &jackstraw) {
            (Some(d), _) => d.min(pca.num_components()),
            (None, Some(js)) => js.dims,
            (None, None) => pca.num_components(),
        };
        info!("using {} of {} components", dims, pca.num_components());

        let mut genes = scaled.features.genes.clone();
        for (row, &g) in scaled.variable.iter().enumerate() {
            genes.genes[g].pc_loadings = pca.loadings.row(row).to_vec();
        }

        Ok(Reduced {
            scaled,
            pca,
            pre_regression_pca,
            jackstraw,
            dims,
            genes,
        })
    }

    /// Neighbor graph and Louvain clusters
    pub fn cluster(&mut self, reduced: Reduced) -> Result<Clustered, PipelineError> {
        let embedding = reduced.pca.embeddings_upto(reduced.dims);
        let k = self.config.neighbors.k.unwrap_or_else(|| default_k(embedding.nrows()));
        let graph = build_snn(embedding, k, self.config.neighbors.prune)?;
        let (assignment, diagnostics) =
            cluster_cells(embedding, &graph, &self.config.clustering, &self.config.cluster_names);
        self.diagnostics.extend(diagnostics);

        let cells = reduced
            .scaled
            .features
            .cells
            .with(&assignment.labels, |rec, &label| rec.cluster = Some(label));
        Ok(Clustered {
            reduced,
            graph,
            assignment,
            cells,
        })
    }

    /// Doublets, markers and t-SNE
    pub fn annotate(&mut self, clustered: Clustered) -> Result<Annotated, PipelineError> {
        let config = &self.config;
        let normalized = &clustered.reduced.scaled.features.normalized;
        let matrix = &normalized.filtered.matrix;

        let doublets = if config.doublets.enabled {
            Some(detect_doublets(
                matrix,
                Some(clustered.assignment.labels.as_slice()),
                &config.doublets,
                &config.normalization,
                &config.hvg,
                &config.pca,
            )?)
        } else {
            None
        };
        let cells = match &doublets {
            Some(calls) => clustered
                .cells
                .with(calls.pann.iter().zip(&calls.is_doublet), |rec, (&score, &call)| {
                    rec.doublet_score = Some(score);
                    rec.is_doublet = Some(call);
                }),
            None => clustered.cells.clone(),
        };

        let markers = rank_markers(
            normalized.data.view(),
            matrix.gene_ids(),
            &clustered.assignment,
            &config.markers,
        )?;

        let tsne = if config.tsne.enabled {
            let reduced = &clustered.reduced;
            Some(run_tsne(reduced.pca.embeddings_upto(reduced.dims), &config.tsne)?)
        } else {
            None
        };

        let diagnostics = std::mem::take(&mut self.diagnostics);
        let low_confidence = diagnostics.iter().any(Diagnostic::is_low_confidence);
        if low_confidence {
            warn!("result is low-confidence: {} diagnostics", diagnostics.len());
        }
        Ok(Annotated {
            clustered,
            doublets,
            markers,
            tsne,
            cells,
            diagnostics,
            low_confidence,
        })
    }
}
