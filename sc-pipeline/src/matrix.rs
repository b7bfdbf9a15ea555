//! Count matrix and the per-cell / per-gene metadata that grows as stages run.
use crate::error::{PipelineError, Stage};
use ndarray::{Array2, ArrayView2, Axis};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Genes x cells matrix of raw counts with unique row and column ids
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionMatrix {
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
    counts: Array2<u32>,
}

fn first_duplicate(ids: &[String]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().find(|id| !seen.insert(id.as_str())).map(String::as_str)
}

impl ExpressionMatrix {
    /// Build a matrix, checking dimensions and id uniqueness
    pub fn new(gene_ids: Vec<String>, cell_ids: Vec<String>, counts: Array2<u32>) -> Result<Self, PipelineError> {
        if counts.dim() != (gene_ids.len(), cell_ids.len()) {
            return Err(PipelineError::input_shape(
                Stage::Input,
                format!(
                    "{} gene ids and {} cell ids for a {}x{} matrix",
                    gene_ids.len(),
                    cell_ids.len(),
                    counts.nrows(),
                    counts.ncols()
                ),
            ));
        }
        if let Some(id) = first_duplicate(&gene_ids) {
            return Err(PipelineError::input_shape(Stage::Input, format!("duplicate gene id {id}")));
        }
        if let Some(id) = first_duplicate(&cell_ids) {
            return Err(PipelineError::input_shape(Stage::Input, format!("duplicate cell id {id}")));
        }
        Ok(ExpressionMatrix {
            gene_ids,
            cell_ids,
            counts,
        })
    }

    /// Gene (row) ids
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    /// Cell (column) ids
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Raw counts, genes x cells
    pub fn counts(&self) -> ArrayView2<'_, u32> {
        self.counts.view()
    }

    /// Counts as `f64`
    pub fn counts_f64(&self) -> Array2<f64> {
        self.counts.mapv(f64::from)
    }

    /// Number of genes
    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Sub-matrix of the given rows and columns, in the given order
    pub fn select(&self, genes: &[usize], cells: &[usize]) -> ExpressionMatrix {
        let counts = self.counts.select(Axis(0), genes).select(Axis(1), cells);
        ExpressionMatrix {
            gene_ids: genes.iter().map(|&g| self.gene_ids[g].clone()).collect(),
            cell_ids: cells.iter().map(|&c| self.cell_ids[c].clone()).collect(),
            counts,
        }
    }
}

/// Cell-cycle phase call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// neither score positive
    G1,
    /// S score highest
    S,
    /// G2M score highest
    G2M,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::G1 => "G1",
            Phase::S => "S",
            Phase::G2M => "G2M",
        };
        f.write_str(s)
    }
}

/// Everything known about one cell. QC fields are set when the record is created; later
/// fields start as `None` and are set once by the stage that computes them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellRecord {
    /// cell id
    pub cell_id: String,
    /// group token of the id
    pub group: String,
    /// total counts on the unfiltered matrix
    pub library_size: f64,
    /// detected features on the unfiltered matrix
    pub detected_features: usize,
    /// percent of counts on mitochondrial genes
    pub percent_mito: f64,
    /// percent of counts on ribosomal genes
    pub percent_ribo: f64,
    /// contamination fraction by filter name
    pub contamination: BTreeMap<String, f64>,
    /// some contamination fraction is above its flag threshold
    pub flagged_contamination: bool,
    /// cell-cycle phase
    pub phase: Option<Phase>,
    /// S module score
    pub s_score: Option<f64>,
    /// G2M module score
    pub g2m_score: Option<f64>,
    /// cluster label
    pub cluster: Option<usize>,
    /// fraction of artificial doublets among the cell's neighbors
    pub doublet_score: Option<f64>,
    /// called a doublet
    pub is_doublet: Option<bool>,
}

impl CellRecord {
    /// Record with the QC fields set
    pub fn new(cell_id: String, group: String) -> Self {
        CellRecord {
            cell_id,
            group,
            library_size: 0.0,
            detected_features: 0,
            percent_mito: 0.0,
            percent_ribo: 0.0,
            contamination: BTreeMap::new(),
            flagged_contamination: false,
            phase: None,
            s_score: None,
            g2m_score: None,
            cluster: None,
            doublet_score: None,
            is_doublet: None,
        }
    }
}

/// Ordered cell records, one per column of the current matrix
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CellMetadata {
    /// records in column order
    pub cells: Vec<CellRecord>,
}

impl CellMetadata {
    /// Number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// No cells
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Records of the given columns, in order
    pub fn select(&self, cells: &[usize]) -> CellMetadata {
        CellMetadata {
            cells: cells.iter().map(|&c| self.cells[c].clone()).collect(),
        }
    }

    /// Copy with `f` applied to every record alongside `values`
    pub fn with<T>(&self, values: impl IntoIterator<Item = T>, f: impl Fn(&mut CellRecord, T)) -> CellMetadata {
        let mut next = self.clone();
        for (rec, v) in next.cells.iter_mut().zip(values) {
            f(rec, v);
        }
        next
    }

    /// Distinct groups in first-seen order
    pub fn groups(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.cells
            .iter()
            .filter(|c| seen.insert(c.group.as_str()))
            .map(|c| c.group.clone())
            .collect()
    }
}

/// Everything known about one gene
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GeneRecord {
    /// gene id
    pub gene_id: String,
    /// `ln(1 + mean(expm1(x)))` of the normalized data
    pub mean_expression: f64,
    /// `ln(var / mean)` on the linear scale
    pub dispersion: f64,
    /// dispersion z-scored within its mean bin
    pub dispersion_scaled: f64,
    /// selected as a variable feature
    pub is_variable: bool,
    /// loadings on the principal components; empty for genes outside the PCA
    pub pc_loadings: Vec<f64>,
}

/// Ordered gene records, one per row of the current matrix
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GeneMetadata {
    /// records in row order
    pub genes: Vec<GeneRecord>,
}

impl GeneMetadata {
    /// Row indices of the variable genes, in row order
    pub fn variable(&self) -> Vec<usize> {
        self.genes
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_variable)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_shape_checks() {
        let m = ExpressionMatrix::new(ids("g", 2), ids("c", 3), Array2::zeros((2, 3))).unwrap();
        assert_eq!((m.n_genes(), m.n_cells()), (2, 3));

        let e = ExpressionMatrix::new(ids("g", 2), ids("c", 2), Array2::zeros((2, 3))).unwrap_err();
        assert!(matches!(e, PipelineError::InputShape { .. }));

        let e = ExpressionMatrix::new(vec!["a".into(), "a".into()], ids("c", 3), Array2::zeros((2, 3))).unwrap_err();
        assert!(e.to_string().contains("duplicate gene id a"));
    }

    #[test]
    fn test_select() {
        let m = ExpressionMatrix::new(ids("g", 3), ids("c", 3), array![[1, 2, 3], [4, 5, 6], [7, 8, 9]]).unwrap();
        let s = m.select(&[2, 0], &[1]);
        assert_eq!(s.gene_ids(), &["g2".to_string(), "g0".to_string()]);
        assert_eq!(s.counts().to_owned(), array![[8u32], [2]]);
    }

    #[test]
    fn test_groups() {
        let md = CellMetadata {
            cells: vec![
                CellRecord::new("a_x".into(), "x".into()),
                CellRecord::new("b_y".into(), "y".into()),
                CellRecord::new("c_x".into(), "x".into()),
            ],
        };
        assert_eq!(md.groups(), vec!["x", "y"]);
        let clustered = md.with(vec![1, 0, 1], |c, l| c.cluster = Some(l));
        assert_eq!(clustered.cells[0].cluster, Some(1));
        assert_eq!(md.cells[0].cluster, None);
    }
}
