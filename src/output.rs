use arrow::array::RecordBatch;
use arrow::csv;
use flate2::write::GzEncoder;
use flate2::Compression;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::{create_dir_all, File};
use std::path::Path;

use crate::error::{CellAssignError, Result};
use crate::schemas::OutputFormat;

pub fn determine_format(filename: &Path, fmt: OutputFormat) -> Result<OutputFormat> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    let name = filename.to_string_lossy();
    if name.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if name.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if name.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(CellAssignError::Configuration(format!(
            "unknown file format for: {}",
            name
        )))
    }
}

/// Write a record batch to `filename`, creating parent directories as needed.
pub fn write_table(filename: &Path, fmt: OutputFormat, batch: &RecordBatch) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    if let Some(parent) = filename.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let file = File::create(filename)?;

    match fmt {
        OutputFormat::Csv => {
            write_table_csv(file, batch)?;
        }
        OutputFormat::CsvGz => {
            let encoder = write_table_csv(GzEncoder::new(file, Compression::default()), batch)?;
            encoder.finish()?;
        }
        OutputFormat::Parquet => {
            write_table_parquet(file, batch)?;
        }
        OutputFormat::Infer => unreachable!("format was inferred above"),
    }

    Ok(())
}

fn write_table_csv<W>(output: W, batch: &RecordBatch) -> Result<W>
where
    W: std::io::Write,
{
    let mut writer = csv::WriterBuilder::new().with_header(true).build(output);
    writer.write(batch)?;
    Ok(writer.into_inner())
}

fn write_table_parquet<W>(output: W, batch: &RecordBatch) -> Result<()>
where
    W: std::io::Write + Send,
{
    let props = WriterProperties::builder()
        .set_compression(ZSTD(ZstdLevel::try_new(3)?))
        .build();

    let mut writer = ArrowWriter::try_new(output, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_determine_format() {
        let infer = |name: &str| determine_format(&PathBuf::from(name), OutputFormat::Infer);

        assert_eq!(infer("merged_results.csv").unwrap(), OutputFormat::Csv);
        assert_eq!(infer("merged_results.csv.gz").unwrap(), OutputFormat::CsvGz);
        assert_eq!(infer("merged_results.parquet").unwrap(), OutputFormat::Parquet);
        assert!(infer("merged_results.tsv").is_err());

        assert_eq!(
            determine_format(&PathBuf::from("results.txt"), OutputFormat::Csv).unwrap(),
            OutputFormat::Csv
        );
    }
}
