// Schemas of the tables written by output.rs.

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn large_utf8_if_parquet(fmt: OutputFormat) -> DataType {
    match fmt {
        OutputFormat::Parquet => DataType::LargeUtf8,
        _ => DataType::Utf8,
    }
}

pub fn annotated_result_schema(fmt: OutputFormat) -> Schema {
    Schema::new(vec![
        Field::new("id", large_utf8_if_parquet(fmt), false),
        Field::new("cell_type", large_utf8_if_parquet(fmt), false),
        Field::new("cell_x", DataType::Float32, false),
        Field::new("cell_y", DataType::Float32, false),
        Field::new("num_shared_bins", DataType::UInt32, false),
        Field::new("num_unique_bins", DataType::UInt32, false),
        Field::new("num_transcripts", DataType::UInt32, false),
        Field::new("chunk_name", large_utf8_if_parquet(fmt), false),
        Field::new("size_factor", DataType::Float32, false),
        Field::new("lib_size", DataType::UInt64, false),
    ])
}

pub fn probabilities_schema(cell_types: &[String], fmt: OutputFormat) -> Schema {
    let mut fields = vec![Field::new("id", large_utf8_if_parquet(fmt), false)];
    for cell_type in cell_types {
        fields.push(Field::new(cell_type, DataType::Float32, false));
    }
    Schema::new(fields)
}
