//! Gene and cell quality filters.
//!
//! Gene exclusion patterns are evaluated once per call. Gene detection, contamination and
//! per-cell thresholds are then applied in passes until a pass removes nothing, so running
//! the filter on its own output is a no-op.
use crate::config::{GeneSelector, QcParams};
use crate::error::{PipelineError, Stage};
use crate::matrix::{CellMetadata, CellRecord, ExpressionMatrix};
use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// Why a cell was removed
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellRemoval {
    /// contamination fraction above the removal threshold of the named filter
    Contamination(String),
    /// too few detected features
    LowFeatures,
    /// too many detected features
    HighFeatures,
    /// too few counts
    LowLibrarySize,
    /// too many counts
    HighLibrarySize,
}

/// What the filter did
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QcReport {
    /// passes until nothing changed
    pub passes: usize,
    /// genes dropped by an exclusion selector, by selector name
    pub excluded_genes: BTreeMap<String, usize>,
    /// genes dropped for low detection
    pub undetected_genes: usize,
    /// removed cells with the first reason that applied
    pub removed_cells: Vec<(String, CellRemoval)>,
    /// removed cells per group
    pub removed_per_group: BTreeMap<String, usize>,
    /// flagged (kept) cells per group
    pub flagged_per_group: BTreeMap<String, usize>,
}

/// Group token of a cell id: the text after the last `delimiter`, or the whole id
pub fn group_label(cell_id: &str, delimiter: &str) -> String {
    match cell_id.rfind(delimiter) {
        Some(pos) if !delimiter.is_empty() => cell_id[pos + delimiter.len()..].to_string(),
        _ => cell_id.to_string(),
    }
}

fn percent(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        100.0 * part / total
    } else {
        0.0
    }
}

/// Per-cell metadata measured on the unfiltered matrix
pub fn raw_cell_metrics(matrix: &ExpressionMatrix, params: &QcParams, delimiter: &str) -> CellMetadata {
    let mito = matrix
        .gene_ids()
        .iter()
        .map(|g| params.mitochondrial.matches(g))
        .collect::<Vec<_>>();
    let ribo = matrix
        .gene_ids()
        .iter()
        .map(|g| params.ribosomal.matches(g))
        .collect::<Vec<_>>();

    let cells = matrix
        .counts()
        .axis_iter(Axis(1))
        .into_par_iter()
        .zip(matrix.cell_ids().par_iter())
        .map(|(col, id)| {
            let mut rec = CellRecord::new(id.clone(), group_label(id, delimiter));
            let (mut total, mut m, mut r) = (0.0, 0.0, 0.0);
            for (g, &v) in col.iter().enumerate() {
                let v = f64::from(v);
                total += v;
                if mito[g] {
                    m += v;
                }
                if ribo[g] {
                    r += v;
                }
                rec.detected_features += usize::from(v > 0.0);
            }
            rec.library_size = total;
            rec.percent_mito = percent(m, total);
            rec.percent_ribo = percent(r, total);
            rec
        })
        .collect();
    CellMetadata { cells }
}

/// Per-cell totals over the kept genes
struct CellSums {
    library: f64,
    detected: usize,
    /// counts on each contamination signature
    signature: Vec<f64>,
}

fn cell_sums(counts: ArrayView2<u32>, genes: &[usize], cells: &[usize], signatures: &[Vec<bool>]) -> Vec<CellSums> {
    cells
        .par_iter()
        .map(|&c| {
            let mut s = CellSums {
                library: 0.0,
                detected: 0,
                signature: vec![0.0; signatures.len()],
            };
            for &g in genes {
                let v = counts[[g, c]];
                if v == 0 {
                    continue;
                }
                let v = f64::from(v);
                s.library += v;
                s.detected += 1;
                for (acc, sig) in s.signature.iter_mut().zip(signatures) {
                    if sig[g] {
                        *acc += v;
                    }
                }
            }
            s
        })
        .collect()
}

fn removal_reason(s: &CellSums, params: &QcParams) -> Option<CellRemoval> {
    for (f, &sig) in params.contamination.iter().zip(&s.signature) {
        let fraction = if s.library > 0.0 { sig / s.library } else { 0.0 };
        if matches!(f.remove_above, Some(t) if fraction > t) {
            return Some(CellRemoval::Contamination(f.name.clone()));
        }
    }
    if matches!(params.min_features, Some(t) if s.detected < t) {
        return Some(CellRemoval::LowFeatures);
    }
    if matches!(params.max_features, Some(t) if s.detected > t) {
        return Some(CellRemoval::HighFeatures);
    }
    if matches!(params.min_library_size, Some(t) if s.library < t) {
        return Some(CellRemoval::LowLibrarySize);
    }
    if matches!(params.max_library_size, Some(t) if s.library > t) {
        return Some(CellRemoval::HighLibrarySize);
    }
    None
}

fn first_selector<'a>(selectors: &'a [GeneSelector], gene: &str) -> Option<&'a GeneSelector> {
    selectors.iter().find(|s| s.matches(gene))
}

/// Apply the gene and cell filters. Returns the filtered matrix, metadata of the retained
/// cells (raw metrics plus contamination fractions and flags) and a report.
pub fn filter(
    matrix: &ExpressionMatrix,
    params: &QcParams,
    delimiter: &str,
) -> Result<(ExpressionMatrix, CellMetadata, QcReport), PipelineError> {
    info!(
        "qc: {} genes x {} cells before filtering",
        matrix.n_genes(),
        matrix.n_cells()
    );
    let counts = matrix.counts();
    let raw = raw_cell_metrics(matrix, params, delimiter);
    let mut report = QcReport::default();

    let mut genes = Vec::with_capacity(matrix.n_genes());
    for (g, id) in matrix.gene_ids().iter().enumerate() {
        match first_selector(&params.exclude, id) {
            Some(sel) => *report.excluded_genes.entry(sel.name.clone()).or_default() += 1,
            None => genes.push(g),
        }
    }
    let signatures = params
        .contamination
        .iter()
        .map(|f| matrix.gene_ids().iter().map(|g| f.genes.matches(g)).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    let mut cells: Vec<usize> = (0..matrix.n_cells()).collect();
    let mut removed: Vec<Option<CellRemoval>> = vec![None; matrix.n_cells()];
    let mut undetected = vec![false; matrix.n_genes()];

    loop {
        report.passes += 1;

        let detected = genes
            .par_iter()
            .map(|&g| cells.iter().filter(|&&c| counts[[g, c]] > 0).count())
            .collect::<Vec<_>>();
        let kept_genes = genes
            .iter()
            .zip(&detected)
            .filter_map(|(&g, &d)| {
                if d >= params.min_cells_per_gene {
                    Some(g)
                } else {
                    undetected[g] = true;
                    None
                }
            })
            .collect::<Vec<_>>();

        let sums = cell_sums(counts, &kept_genes, &cells, &signatures);
        let mut kept_cells = Vec::with_capacity(cells.len());
        for (&c, s) in cells.iter().zip(&sums) {
            match removal_reason(s, params) {
                Some(reason) => removed[c] = Some(reason),
                None => kept_cells.push(c),
            }
        }

        let changed = kept_genes.len() != genes.len() || kept_cells.len() != cells.len();
        debug!(
            "qc pass {}: {} genes, {} cells",
            report.passes,
            kept_genes.len(),
            kept_cells.len()
        );
        genes = kept_genes;
        cells = kept_cells;
        if !changed {
            break;
        }
        if genes.is_empty() || cells.is_empty() {
            break;
        }
    }

    if cells.is_empty() {
        return Err(PipelineError::input_shape(Stage::Qc, "every cell was removed by the filters"));
    }
    if genes.is_empty() {
        return Err(PipelineError::input_shape(Stage::Qc, "every gene was removed by the filters"));
    }
    report.undetected_genes = undetected.iter().filter(|&&u| u).count();

    for (c, reason) in removed.into_iter().enumerate() {
        if let Some(reason) = reason {
            let rec = &raw.cells[c];
            *report.removed_per_group.entry(rec.group.clone()).or_default() += 1;
            report.removed_cells.push((rec.cell_id.clone(), reason));
        }
    }

    // contamination fractions and flags on the final gene set
    let sums = cell_sums(counts, &genes, &cells, &signatures);
    let mut metadata = raw.select(&cells);
    for (rec, s) in metadata.cells.iter_mut().zip(&sums) {
        for (f, &sig) in params.contamination.iter().zip(&s.signature) {
            let fraction = if s.library > 0.0 { sig / s.library } else { 0.0 };
            rec.contamination.insert(f.name.clone(), fraction);
            if matches!(f.flag_above, Some(t) if fraction > t) {
                rec.flagged_contamination = true;
            }
        }
        if rec.flagged_contamination {
            *report.flagged_per_group.entry(rec.group.clone()).or_default() += 1;
        }
    }

    for group in raw.groups() {
        let removed = report.removed_per_group.get(&group).copied().unwrap_or(0);
        let flagged = report.flagged_per_group.get(&group).copied().unwrap_or(0);
        let total = raw.cells.iter().filter(|c| c.group == group).count();
        if removed == total {
            warn!("qc: every cell of group {} was removed", group);
        }
        info!(
            "qc: group {}: {} of {} cells removed, {} flagged",
            group, removed, total, flagged
        );
    }
    info!(
        "qc: {} genes x {} cells after {} passes",
        genes.len(),
        cells.len(),
        report.passes
    );
    debug!(
        "qc: excluded genes [{}], {} undetected",
        report.excluded_genes.iter().map(|(name, n)| format!("{name}: {n}")).join(", "),
        report.undetected_genes
    );

    Ok((matrix.select(&genes, &cells), metadata, report))
}
