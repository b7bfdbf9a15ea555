//! Reading the count matrix and writing the result tables.
//!
//! The input is one tab-delimited genes x cells table, gzip-compressed when the file name
//! ends in `.gz`. The header holds the cell ids, optionally after a corner field; every
//! other line is a gene id followed by one count per cell.
use crate::cluster::ClusterAssignment;
use crate::error::{PipelineError, Stage};
use crate::markers::MarkerTable;
use crate::matrix::{CellMetadata, ExpressionMatrix, Phase};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use ndarray::{Array2, ArrayView2, Axis};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

fn io_error(stage: Stage, path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        stage,
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> PipelineError + '_ {
    move |source| PipelineError::Csv {
        stage: Stage::Output,
        path: path.to_path_buf(),
        source,
    }
}

/// Parse one count. Integral floating point values (`3.0`, `1e2`) are accepted.
fn parse_count(field: &str) -> Option<u32> {
    if let Ok(v) = field.parse::<u32>() {
        return Some(v);
    }
    let v = field.parse::<f64>().ok()?;
    (v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64).then_some(v as u32)
}

/// Read a genes x cells count table from `reader`
pub fn parse_matrix(reader: impl BufRead) -> Result<ExpressionMatrix, PipelineError> {
    let mut lines = reader.lines().enumerate().filter_map(|(line_no, line)| match line {
        Ok(line) => {
            let line = line.trim_end_matches('\r').to_string();
            (!line.trim().is_empty()).then_some(Ok((line_no + 1, line)))
        }
        Err(e) => Some(Err(PipelineError::input_shape(
            Stage::Input,
            format!("line {}: {}", line_no + 1, e),
        ))),
    });

    let Some(header) = lines.next() else {
        return Err(PipelineError::input_shape(Stage::Input, "empty input"));
    };
    let mut cell_ids = header?.1.split('\t').map(str::to_string).collect::<Vec<_>>();
    let cells = cell_ids.clone();
    let mut has_corner = None;
    let mut gene_ids = Vec::new();
    let mut values = Vec::new();

    for line in lines {
        let (line_no, line) = line?;
        let fields = line.split('\t').collect::<Vec<_>>();
        let corner = *has_corner.get_or_insert(fields.len() == cells.len());
        let expected = if corner { cells.len() } else { cells.len() + 1 };
        if fields.len() != expected {
            return Err(PipelineError::input_shape(
                Stage::Input,
                format!("line {}: {} fields, expected {}", line_no, fields.len(), expected),
            ));
        }
        let gene = fields[0].to_string();
        let offset = if corner { 1 } else { 0 };
        for (c, field) in fields[1..].iter().enumerate() {
            let v = parse_count(field.trim()).ok_or_else(|| {
                PipelineError::input_shape(
                    Stage::Input,
                    format!("gene {} cell {}: '{}' is not a count", gene, cells[c + offset], field),
                )
            })?;
            values.push(v);
        }
        gene_ids.push(gene);
    }

    if has_corner.unwrap_or(true) && !cell_ids.is_empty() {
        cell_ids.remove(0);
    }
    let counts = Array2::from_shape_vec((gene_ids.len(), cell_ids.len()), values)
        .map_err(|e| PipelineError::input_shape(Stage::Input, e.to_string()))?;
    ExpressionMatrix::new(gene_ids, cell_ids, counts)
}

/// Read a count table, decompressing `.gz` files
pub fn read_matrix(path: impl AsRef<Path>) -> Result<ExpressionMatrix, PipelineError> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).map_err(io_error(Stage::Input, path))?);
    let matrix = if path.extension().is_some_and(|e| e == "gz") {
        parse_matrix(BufReader::new(MultiGzDecoder::new(file)))?
    } else {
        parse_matrix(file)?
    };
    info!(
        "read {} genes x {} cells from {}",
        matrix.n_genes(),
        matrix.n_cells(),
        path.display()
    );
    Ok(matrix)
}

fn tsv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer)
}

fn create(path: &Path) -> Result<File, PipelineError> {
    File::create(path).map_err(io_error(Stage::Output, path))
}

#[derive(Serialize)]
struct ClusterRow<'a> {
    cell_id: &'a str,
    group: &'a str,
    cluster: usize,
    cluster_name: String,
    phase: Option<Phase>,
    doublet_score: Option<f64>,
    is_doublet: Option<bool>,
}

/// Write `cell_id, group, cluster, cluster_name, phase, doublet_score, is_doublet` per cell
pub fn write_clusters(
    path: impl AsRef<Path>,
    cells: &CellMetadata,
    assignment: &ClusterAssignment,
) -> Result<(), PipelineError> {
    let path = path.as_ref();
    let mut writer = tsv_writer(create(path)?);
    for (cell, &cluster) in cells.cells.iter().zip(&assignment.labels) {
        writer
            .serialize(ClusterRow {
                cell_id: &cell.cell_id,
                group: &cell.group,
                cluster,
                cluster_name: assignment.name(cluster),
                phase: cell.phase,
                doublet_score: cell.doublet_score,
                is_doublet: cell.is_doublet,
            })
            .map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(Stage::Output, path))
}

/// Write the marker table, one row per (cluster, gene)
pub fn write_markers(path: impl AsRef<Path>, markers: &MarkerTable) -> Result<(), PipelineError> {
    let path = path.as_ref();
    let mut writer = tsv_writer(create(path)?);
    if markers.rows.is_empty() {
        writer
            .write_record([
                "gene_id",
                "cluster",
                "cluster_name",
                "avg_log_fc",
                "auc",
                "pct_in",
                "pct_out",
                "p_value",
                "p_value_adj",
            ])
            .map_err(csv_error(path))?;
    }
    for row in &markers.rows {
        writer.serialize(row).map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(Stage::Output, path))
}

fn optional<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map_or_else(String::new, T::to_string)
}

/// Write every metadata field of every cell. Contamination fractions get one column per
/// filter.
pub fn write_cell_metadata(path: impl AsRef<Path>, cells: &CellMetadata) -> Result<(), PipelineError> {
    let path = path.as_ref();
    let filters = cells
        .cells
        .first()
        .map(|c| c.contamination.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    let mut writer = tsv_writer(create(path)?);
    let mut header = ["cell_id", "group", "library_size", "detected_features", "percent_mito", "percent_ribo"]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    header.extend(filters.iter().map(|f| format!("contamination_{f}")));
    header.extend(
        [
            "flagged_contamination",
            "phase",
            "s_score",
            "g2m_score",
            "cluster",
            "doublet_score",
            "is_doublet",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    writer.write_record(&header).map_err(csv_error(path))?;

    for cell in &cells.cells {
        let mut record = vec![
            cell.cell_id.clone(),
            cell.group.clone(),
            cell.library_size.to_string(),
            cell.detected_features.to_string(),
            cell.percent_mito.to_string(),
            cell.percent_ribo.to_string(),
        ];
        record.extend(filters.iter().map(|f| optional(&cell.contamination.get(f))));
        record.push(cell.flagged_contamination.to_string());
        record.push(optional(&cell.phase));
        record.push(optional(&cell.s_score));
        record.push(optional(&cell.g2m_score));
        record.push(optional(&cell.cluster));
        record.push(optional(&cell.doublet_score));
        record.push(optional(&cell.is_doublet));
        writer.write_record(&record).map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(Stage::Output, path))
}

/// Write a genes x cells matrix as a gzipped table with gene and cell ids
fn write_matrix_gz(path: &Path, data: ArrayView2<f64>, gene_ids: &[String], cell_ids: &[&str]) -> Result<(), PipelineError> {
    let mut writer = tsv_writer(GzEncoder::new(create(path)?, Compression::default()));
    let header = std::iter::once("gene_id").chain(cell_ids.iter().copied());
    writer.write_record(header).map_err(csv_error(path))?;
    for (gene, row) in gene_ids.iter().zip(data.axis_iter(Axis(0))) {
        let record = std::iter::once(gene.clone()).chain(row.iter().map(|v| v.to_string()));
        writer.write_record(record).map_err(csv_error(path))?;
    }
    let encoder = writer
        .into_inner()
        .map_err(|e| io_error(Stage::Output, path)(e.into_error()))?;
    encoder.finish().map_err(io_error(Stage::Output, path))?;
    Ok(())
}

/// Write the normalized matrix of each of `groups` to `normalized_<group>.tsv.gz` under
/// `dir`, or of every group when `groups` is empty. Returns the files written.
pub fn write_normalized_by_group(
    dir: impl AsRef<Path>,
    normalized: ArrayView2<f64>,
    gene_ids: &[String],
    cells: &CellMetadata,
    groups: &[String],
) -> Result<Vec<PathBuf>, PipelineError> {
    let groups = if groups.is_empty() { cells.groups() } else { groups.to_vec() };
    let mut written = Vec::new();
    for group in groups {
        let columns = cells
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.group == group)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if columns.is_empty() {
            warn!("no retained cells in group {}; nothing written", group);
            continue;
        }
        let ids = columns.iter().map(|&i| cells.cells[i].cell_id.as_str()).collect::<Vec<_>>();
        let path = dir.as_ref().join(format!("normalized_{}.tsv.gz", file_token(&group)));
        write_matrix_gz(&path, normalized.select(Axis(1), &columns).view(), gene_ids, &ids)?;
        written.push(path);
    }
    Ok(written)
}

/// `group` with every character outside `[A-Za-z0-9_-]` replaced by `_`, so it can not
/// name a path outside the output directory
fn file_token(group: &str) -> String {
    group
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Write a cells x dims embedding as gzipped CSV with a `cell_id` column and columns
/// `<prefix>_1..`
pub fn write_embedding(
    path: impl AsRef<Path>,
    cell_ids: &[String],
    embedding: ArrayView2<f64>,
    prefix: &str,
) -> Result<(), PipelineError> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_writer(GzEncoder::new(create(path)?, Compression::default()));
    let header = std::iter::once("cell_id".to_string()).chain((1..=embedding.ncols()).map(|i| format!("{prefix}_{i}")));
    writer.write_record(header).map_err(csv_error(path))?;
    for (id, row) in cell_ids.iter().zip(embedding.axis_iter(Axis(0))) {
        let record = std::iter::once(id.clone()).chain(row.iter().map(|v| v.to_string()));
        writer.write_record(record).map_err(csv_error(path))?;
    }
    let encoder = writer
        .into_inner()
        .map_err(|e| io_error(Stage::Output, path)(e.into_error()))?;
    encoder.finish().map_err(io_error(Stage::Output, path))?;
    Ok(())
}
