// Reading the per-chunk tables produced by bin-to-cell assignment: one table of
// gene counts per cell, and one table of cell metadata.

use csv;
use flate2::read::GzDecoder;
use log::{debug, trace};
use ndarray::Array2;
use regex::Regex;
use std::fs::{read_dir, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{CellAssignError, Result};

const STAGE: &str = "chunk input";

/// Counts for the cells of one chunk.
#[derive(Clone, Debug)]
pub struct BinAssignChunk {
    pub name: String,

    // values of the leading index column, when the table has one
    pub row_labels: Option<Vec<String>>,

    pub genes: Vec<String>,

    // [ncells, ngenes]
    pub counts: Array2<u32>,
}

impl BinAssignChunk {
    pub fn nrows(&self) -> usize {
        self.counts.nrows()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CellLookupRecord {
    pub id: String,
    pub cell_x: f32,
    pub cell_y: f32,
    pub num_shared_bins: u32,
    pub num_unique_bins: u32,
    pub num_transcripts: u32,
    pub chunk_name: String,
}

#[derive(Clone, Debug)]
pub struct CellLookupChunk {
    pub name: String,
    pub records: Vec<CellLookupRecord>,
}

impl CellLookupChunk {
    pub fn nrows(&self) -> usize {
        self.records.len()
    }
}

pub const LOOKUP_COLUMNS: [&str; 7] = [
    "id",
    "cell_x",
    "cell_y",
    "num_shared_bins",
    "num_unique_bins",
    "num_transcripts",
    "chunk_name",
];

fn is_chunk_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".csv") || name.ends_with(".csv.gz"))
        .unwrap_or(false)
}

fn chunk_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Chunk tables in a directory, sorted by file name. The sort is lexical, so
/// `patch_10.csv` precedes `patch_2.csv`; pairing across directories relies
/// only on both being sorted the same way.
pub fn list_chunk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_chunk_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(CellAssignError::format(
            STAGE,
            format!("no .csv or .csv.gz chunk files found in {}", dir.display()),
        ));
    }

    debug!("Found {} chunk files in {}", paths.len(), dir.display());
    Ok(paths)
}

fn open_table(path: &Path) -> Result<csv::Reader<Box<dyn Read>>> {
    let file = File::open(path)?;
    let input: Box<dyn Read> = if chunk_name(path).ends_with(".gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(table_reader(input))
}

// Ragged rows are let through so the parsers can report them as format errors.
fn table_reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new().flexible(true).from_reader(input)
}

fn is_missing(value: &str) -> bool {
    matches!(value.trim(), "" | "NA" | "nan" | "NaN")
}

// Parse a numeric field as a non-negative integer, truncating floats like "3.0".
fn parse_count(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Ok(count) = value.parse::<u32>() {
        return Some(count);
    }
    let x = value.parse::<f64>().ok()?;
    if x.is_finite() && x >= 0.0 && x <= u32::MAX as f64 {
        Some(x as u32)
    } else {
        None
    }
}

fn find_column(headers: &csv::StringRecord, column: &str, name: &str) -> Result<usize> {
    headers.iter().position(|x| x == column).ok_or_else(|| {
        CellAssignError::format(
            STAGE,
            format!("column '{}' not found in chunk '{}'", column, name),
        )
    })
}

pub fn read_bin_assign_chunk(path: &Path) -> Result<BinAssignChunk> {
    let mut rdr = open_table(path)?;
    parse_bin_assign(&chunk_name(path), &mut rdr)
}

pub fn read_cell_lookup_chunk(path: &Path) -> Result<CellLookupChunk> {
    let mut rdr = open_table(path)?;
    parse_cell_lookup(&chunk_name(path), &mut rdr)
}

fn parse_bin_assign<T>(name: &str, rdr: &mut csv::Reader<T>) -> Result<BinAssignChunk>
where
    T: std::io::Read,
{
    // Leftover index column from a dataframe writer, e.g. "" or "Unnamed: 0".
    let index_column = Regex::new(r"^(Unnamed: \d+)?$").unwrap();

    let headers = rdr.headers()?.clone();
    let has_index = headers
        .get(0)
        .map(|h| index_column.is_match(h.trim()))
        .unwrap_or(false);
    let first_gene = if has_index { 1 } else { 0 };
    let genes: Vec<String> = headers.iter().skip(first_gene).map(|h| h.to_string()).collect();

    let mut data: Vec<u32> = Vec::new();
    let mut row_labels = Vec::new();
    let mut nrows = 0;

    for (i, result) in rdr.records().enumerate() {
        let row = result?;
        if row.len() != headers.len() {
            return Err(CellAssignError::format(
                STAGE,
                format!(
                    "row {} of chunk '{}' has {} fields, expected {}",
                    i,
                    name,
                    row.len(),
                    headers.len()
                ),
            ));
        }

        if has_index {
            row_labels.push(row[0].to_string());
        }

        for (gene, value) in genes.iter().zip(row.iter().skip(first_gene)) {
            let count = if is_missing(value) {
                0
            } else {
                parse_count(value).ok_or_else(|| {
                    CellAssignError::format(
                        STAGE,
                        format!(
                            "invalid count '{}' for gene '{}' in row {} of chunk '{}'",
                            value, gene, i, name
                        ),
                    )
                })?
            };
            data.push(count);
        }
        nrows += 1;
    }

    let counts = Array2::from_shape_vec((nrows, genes.len()), data).map_err(|err| {
        CellAssignError::format(STAGE, format!("chunk '{}': {}", name, err))
    })?;

    trace!(
        "Read bin assignment chunk '{}': {} cells x {} genes",
        name,
        nrows,
        genes.len()
    );

    Ok(BinAssignChunk {
        name: name.to_string(),
        row_labels: if has_index { Some(row_labels) } else { None },
        genes,
        counts,
    })
}

fn parse_cell_lookup<T>(name: &str, rdr: &mut csv::Reader<T>) -> Result<CellLookupChunk>
where
    T: std::io::Read,
{
    let headers = rdr.headers()?.clone();
    let mut cols = [0; LOOKUP_COLUMNS.len()];
    for (col, column) in cols.iter_mut().zip(LOOKUP_COLUMNS) {
        *col = find_column(&headers, column, name)?;
    }
    let [id_col, x_col, y_col, shared_col, unique_col, transcripts_col, chunk_col] = cols;

    let mut records = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let row = result?;
        if row.len() != headers.len() {
            return Err(CellAssignError::format(
                STAGE,
                format!(
                    "row {} of chunk '{}' has {} fields, expected {}",
                    i,
                    name,
                    row.len(),
                    headers.len()
                ),
            ));
        }

        let field = |col: usize| {
            row.get(col).ok_or_else(|| {
                CellAssignError::format(
                    STAGE,
                    format!("row {} of chunk '{}' is missing field {}", i, name, col),
                )
            })
        };

        let invalid = |col: usize, value: &str| {
            CellAssignError::format(
                STAGE,
                format!(
                    "invalid value '{}' in column '{}', row {} of chunk '{}'",
                    value, &headers[col], i, name
                ),
            )
        };

        let coordinate = |col: usize| -> Result<f32> {
            let value = field(col)?;
            value
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|x| x.is_finite())
                .ok_or_else(|| invalid(col, value))
        };

        let stat = |col: usize| -> Result<u32> {
            let value = field(col)?;
            parse_count(value).ok_or_else(|| invalid(col, value))
        };

        let num_transcripts = if is_missing(field(transcripts_col)?) {
            0
        } else {
            stat(transcripts_col)?
        };

        records.push(CellLookupRecord {
            id: field(id_col)?.to_string(),
            cell_x: coordinate(x_col)?,
            cell_y: coordinate(y_col)?,
            num_shared_bins: stat(shared_col)?,
            num_unique_bins: stat(unique_col)?,
            num_transcripts,
            chunk_name: field(chunk_col)?.to_string(),
        });
    }

    trace!("Read cell lookup chunk '{}': {} cells", name, records.len());

    Ok(CellLookupChunk {
        name: name.to_string(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn reader(text: &str) -> csv::Reader<&[u8]> {
        table_reader(text.as_bytes())
    }

    #[test]
    fn test_bin_assign_drops_index_column() {
        let mut rdr = reader(",CD3,CD19,ACTB\n0,5,,2\n1,0,7.0,1\n");
        let chunk = parse_bin_assign("chunk_0.csv", &mut rdr).unwrap();

        assert_eq!(chunk.genes, vec!["CD3", "CD19", "ACTB"]);
        assert_eq!(chunk.row_labels, Some(vec!["0".to_string(), "1".to_string()]));
        assert_eq!(chunk.counts, ndarray::arr2(&[[5, 0, 2], [0, 7, 1]]));
    }

    #[test]
    fn test_bin_assign_unnamed_index_column() {
        let mut rdr = reader("Unnamed: 0,CD3\n17,4\n");
        let chunk = parse_bin_assign("chunk_0.csv", &mut rdr).unwrap();
        assert_eq!(chunk.genes, vec!["CD3"]);
        assert_eq!(chunk.row_labels, Some(vec!["17".to_string()]));

        let mut rdr = reader("CD3,CD19\n4,NA\n");
        let chunk = parse_bin_assign("chunk_0.csv", &mut rdr).unwrap();
        assert_eq!(chunk.genes, vec!["CD3", "CD19"]);
        assert_eq!(chunk.row_labels, None);
        assert_eq!(chunk.counts, ndarray::arr2(&[[4, 0]]));
    }

    #[test]
    fn test_bin_assign_rejects_negative_counts() {
        let mut rdr = reader(",CD3\n0,-2\n");
        assert!(matches!(
            parse_bin_assign("chunk_0.csv", &mut rdr),
            Err(CellAssignError::Format { .. })
        ));

        let mut rdr = reader(",CD3\n0,many\n");
        assert!(matches!(
            parse_bin_assign("chunk_0.csv", &mut rdr),
            Err(CellAssignError::Format { .. })
        ));
    }

    #[test]
    fn test_bin_assign_rejects_ragged_rows() {
        let mut rdr = reader(",CD3\n0,1,2\n");
        assert!(matches!(
            parse_bin_assign("chunk_0.csv", &mut rdr),
            Err(CellAssignError::Format { .. })
        ));

        let mut rdr = reader(",CD3,CD19\n0,1,2\n1,4\n");
        assert!(matches!(
            parse_bin_assign("chunk_0.csv", &mut rdr),
            Err(CellAssignError::Format { .. })
        ));
    }

    #[test]
    fn test_cell_lookup_rejects_ragged_rows() {
        let mut rdr = reader(
            "id,cell_x,cell_y,num_shared_bins,num_unique_bins,num_transcripts,chunk_name\n\
             12,10.5,20\n",
        );
        assert!(matches!(
            parse_cell_lookup("lookup_0.csv", &mut rdr),
            Err(CellAssignError::Format { .. })
        ));
    }

    #[test]
    fn test_cell_lookup_missing_transcripts_is_zero() {
        let mut rdr = reader(
            "id,cell_x,cell_y,num_shared_bins,num_unique_bins,num_transcripts,chunk_name\n\
             12,10.5,20,3,4,,patch_0\n\
             13,11,21.0,0,2.0,9,patch_0\n",
        );
        let chunk = parse_cell_lookup("lookup_0.csv", &mut rdr).unwrap();

        assert_eq!(chunk.nrows(), 2);
        assert_eq!(
            chunk.records[0],
            CellLookupRecord {
                id: "12".to_string(),
                cell_x: 10.5,
                cell_y: 20.0,
                num_shared_bins: 3,
                num_unique_bins: 4,
                num_transcripts: 0,
                chunk_name: "patch_0".to_string(),
            }
        );
        assert_eq!(chunk.records[1].num_unique_bins, 2);
        assert_eq!(chunk.records[1].num_transcripts, 9);
    }

    #[test]
    fn test_cell_lookup_missing_column() {
        let mut rdr = reader("id,cell_x,cell_y,num_shared_bins,num_unique_bins,chunk_name\n");
        assert!(matches!(
            parse_cell_lookup("lookup_0.csv", &mut rdr),
            Err(CellAssignError::Format { .. })
        ));
    }

    #[test]
    fn test_list_and_read_gzipped_chunks() {
        let dir = tempfile::tempdir().unwrap();

        let mut encoder = GzEncoder::new(
            File::create(dir.path().join("chunk_1.csv.gz")).unwrap(),
            Compression::default(),
        );
        encoder.write_all(b",CD3\n0,1\n").unwrap();
        encoder.finish().unwrap();

        std::fs::write(dir.path().join("chunk_0.csv"), ",CD3\n0,2\n1,3\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let paths = list_chunk_files(dir.path()).unwrap();
        let names: Vec<String> = paths.iter().map(|p| chunk_name(p)).collect();
        assert_eq!(names, vec!["chunk_0.csv", "chunk_1.csv.gz"]);

        let chunk = read_bin_assign_chunk(&paths[1]).unwrap();
        assert_eq!(chunk.counts, ndarray::arr2(&[[1]]));
    }

    #[test]
    fn test_empty_chunk_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_chunk_files(dir.path()),
            Err(CellAssignError::Format { .. })
        ));
    }
}
