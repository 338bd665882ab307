// Assembling chunked count and cell lookup tables into a single cell x gene
// expression matrix with row-aligned spatial and statistics annotations.

use clap::ValueEnum;
use log::{info, warn};
use ndarray::{s, Array1, Array2};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::chunks::{
    list_chunk_files, read_bin_assign_chunk, read_cell_lookup_chunk, BinAssignChunk,
    CellLookupChunk,
};
use crate::error::{CellAssignError, Result};

const STAGE: &str = "count matrix assembly";

pub const SPATIAL_COLUMNS: [&str; 2] = ["cell_x", "cell_y"];
pub const STAT_COLUMNS: [&str; 3] = ["num_shared_bins", "num_unique_bins", "num_transcripts"];

/// How rows of the count tables are matched to rows of the lookup tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum AlignmentPolicy {
    /// Rows are matched by position within each pair of chunks.
    Positional,

    /// As `Positional`, but paired chunk files must share a file name and
    /// every count row's index label must equal the lookup id at the same
    /// position. Requires count tables whose index column carries cell ids
    /// rather than a 0..n row counter.
    Keyed,
}

impl AlignmentPolicy {
    pub fn parse(value: &str) -> Option<AlignmentPolicy> {
        match value {
            "positional" => Some(AlignmentPolicy::Positional),
            "keyed" => Some(AlignmentPolicy::Keyed),
            _ => None,
        }
    }
}

pub struct ExpressionObject {
    pub cell_ids: Vec<String>,
    pub gene_names: Vec<String>,

    // [ncells, ngenes]
    pub counts: Array2<u32>,

    // [ncells, 2]: cell_x, cell_y
    pub spatial: Array2<f32>,

    // [ncells, 3]: num_shared_bins, num_unique_bins, num_transcripts
    pub stats: Array2<u32>,

    pub chunk_names: Vec<String>,

    // set by normalization
    pub lib_size: Option<Array1<u64>>,
    pub size_factor: Option<Array1<f32>>,
}

impl ExpressionObject {
    pub fn ncells(&self) -> usize {
        self.counts.nrows()
    }

    pub fn ngenes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn size_factor(&self) -> Result<&Array1<f32>> {
        self.size_factor.as_ref().ok_or_else(|| {
            CellAssignError::numeric(
                "size factor normalization",
                "size factors requested before they were computed",
            )
        })
    }

    pub fn lib_size(&self) -> Result<&Array1<u64>> {
        self.lib_size.as_ref().ok_or_else(|| {
            CellAssignError::numeric(
                "size factor normalization",
                "library sizes requested before they were computed",
            )
        })
    }
}

/// Read every chunk from the two directories and assemble them.
pub fn read_expression_chunks(
    bin_assign_dir: &Path,
    cell_lookup_dir: &Path,
    policy: AlignmentPolicy,
) -> Result<ExpressionObject> {
    let bin_chunks = list_chunk_files(bin_assign_dir)?
        .iter()
        .map(|path| read_bin_assign_chunk(path))
        .collect::<Result<Vec<_>>>()?;

    let lookup_chunks = list_chunk_files(cell_lookup_dir)?
        .iter()
        .map(|path| read_cell_lookup_chunk(path))
        .collect::<Result<Vec<_>>>()?;

    assemble_expression(&bin_chunks, &lookup_chunks, policy)
}

// Check that each pair of chunks describes the same cells in the same order.
fn check_alignment(
    bin_chunk: &BinAssignChunk,
    lookup_chunk: &CellLookupChunk,
    policy: AlignmentPolicy,
) -> Result<()> {
    if bin_chunk.nrows() != lookup_chunk.nrows() {
        return Err(CellAssignError::format(
            STAGE,
            format!(
                "bin assignment chunk '{}' has {} rows but cell lookup chunk '{}' has {} rows",
                bin_chunk.name,
                bin_chunk.nrows(),
                lookup_chunk.name,
                lookup_chunk.nrows()
            ),
        ));
    }

    if policy == AlignmentPolicy::Keyed {
        if bin_chunk.name != lookup_chunk.name {
            return Err(CellAssignError::format(
                STAGE,
                format!(
                    "keyed alignment paired bin assignment chunk '{}' with cell lookup chunk '{}'",
                    bin_chunk.name, lookup_chunk.name
                ),
            ));
        }

        let labels = bin_chunk.row_labels.as_ref().ok_or_else(|| {
            CellAssignError::format(
                STAGE,
                format!(
                    "keyed alignment requires an index column in bin assignment chunk '{}'",
                    bin_chunk.name
                ),
            )
        })?;

        for (i, (label, record)) in labels.iter().zip(&lookup_chunk.records).enumerate() {
            if label.trim() != record.id.trim() {
                return Err(CellAssignError::format(
                    STAGE,
                    format!(
                        "row {} of '{}' is labeled '{}' but row {} of '{}' has id '{}'",
                        i, bin_chunk.name, label, i, lookup_chunk.name, record.id
                    ),
                ));
            }
        }
    }

    Ok(())
}

/// Concatenate chunks row-wise, in the order given, into one expression object.
///
/// Count rows are associated with lookup rows by position, so each pair of
/// chunks must list the same cells in the same order. Pairs with differing row
/// counts are rejected, and under `AlignmentPolicy::Keyed` so is any row whose
/// index label disagrees with the lookup id. Genes missing from a chunk count
/// as zero for its cells. Repeated cell ids are reported but kept.
pub fn assemble_expression(
    bin_chunks: &[BinAssignChunk],
    lookup_chunks: &[CellLookupChunk],
    policy: AlignmentPolicy,
) -> Result<ExpressionObject> {
    if bin_chunks.len() != lookup_chunks.len() {
        return Err(CellAssignError::format(
            STAGE,
            format!(
                "found {} bin assignment chunks but {} cell lookup chunks",
                bin_chunks.len(),
                lookup_chunks.len()
            ),
        ));
    }

    for (bin_chunk, lookup_chunk) in bin_chunks.iter().zip(lookup_chunks) {
        check_alignment(bin_chunk, lookup_chunk, policy)?;
    }

    let mut gene_names: Vec<String> = Vec::new();
    let mut gene_index: HashMap<&str, usize> = HashMap::new();
    for bin_chunk in bin_chunks {
        for gene in &bin_chunk.genes {
            if !gene_index.contains_key(gene.as_str()) {
                gene_index.insert(gene.as_str(), gene_names.len());
                gene_names.push(gene.clone());
            }
        }
    }

    let ncells: usize = bin_chunks.iter().map(|chunk| chunk.nrows()).sum();
    let nlookup: usize = lookup_chunks.iter().map(|chunk| chunk.nrows()).sum();
    if ncells != nlookup {
        return Err(CellAssignError::format(
            STAGE,
            format!(
                "count matrix has {} rows but cell lookup table has {} rows",
                ncells, nlookup
            ),
        ));
    }

    let mut counts = Array2::<u32>::zeros((ncells, gene_names.len()));
    let mut row = 0;
    for bin_chunk in bin_chunks {
        let rows = row..row + bin_chunk.nrows();
        for (j, gene) in bin_chunk.genes.iter().enumerate() {
            let k = gene_index[gene.as_str()];
            // repeated gene columns within a chunk accumulate
            let mut dest = counts.slice_mut(s![rows.clone(), k]);
            dest += &bin_chunk.counts.column(j);
        }
        row = rows.end;
    }

    let mut cell_ids = Vec::with_capacity(ncells);
    let mut chunk_names = Vec::with_capacity(ncells);
    let mut spatial = Array2::<f32>::zeros((ncells, SPATIAL_COLUMNS.len()));
    let mut stats = Array2::<u32>::zeros((ncells, STAT_COLUMNS.len()));
    let records = lookup_chunks.iter().flat_map(|chunk| chunk.records.iter());
    for (i, record) in records.enumerate() {
        cell_ids.push(record.id.clone());
        chunk_names.push(record.chunk_name.clone());
        spatial[[i, 0]] = record.cell_x;
        spatial[[i, 1]] = record.cell_y;
        stats[[i, 0]] = record.num_shared_bins;
        stats[[i, 1]] = record.num_unique_bins;
        stats[[i, 2]] = record.num_transcripts;
    }

    let mut seen = HashSet::with_capacity(ncells);
    let nduplicates = cell_ids.iter().filter(|id| !seen.insert(id.as_str())).count();
    if nduplicates > 0 {
        warn!(
            "{} cell ids occur more than once across chunks; rows are kept as given",
            nduplicates
        );
    }

    info!(
        "Assembled {} cells x {} genes from {} chunks",
        ncells,
        gene_names.len(),
        bin_chunks.len()
    );

    Ok(ExpressionObject {
        cell_ids,
        gene_names,
        counts,
        spatial,
        stats,
        chunk_names,
        lib_size: None,
        size_factor: None,
    })
}

// Small expression object with generated cell metadata.
#[cfg(test)]
pub fn test_expression<const N: usize>(genes: &[&str], counts: &[[u32; N]]) -> ExpressionObject {
    let ncells = counts.len();
    ExpressionObject {
        cell_ids: (0..ncells).map(|i| format!("cell_{}", i)).collect(),
        gene_names: genes.iter().map(|g| g.to_string()).collect(),
        counts: Array2::from_shape_fn((ncells, N), |(i, j)| counts[i][j]),
        spatial: Array2::from_shape_fn((ncells, 2), |(i, j)| (10 * i + j) as f32),
        stats: Array2::from_shape_fn((ncells, 3), |(i, j)| (i + j) as u32),
        chunk_names: vec!["chunk_0".to_string(); ncells],
        lib_size: None,
        size_factor: None,
    }
}
