// Error taxonomy shared by every pipeline stage. Any error terminates the run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CellAssignError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("format error in {stage}: {message}")]
    Format { stage: &'static str, message: String },

    #[error("data error in {stage}: {message}")]
    Data { stage: &'static str, message: String },

    #[error("numeric error in {stage}: {message}")]
    Numeric { stage: &'static str, message: String },

    #[error("inference error: {0}")]
    Inference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] json::Error),
}

impl CellAssignError {
    pub fn format(stage: &'static str, message: impl Into<String>) -> Self {
        CellAssignError::Format {
            stage,
            message: message.into(),
        }
    }

    pub fn data(stage: &'static str, message: impl Into<String>) -> Self {
        CellAssignError::Data {
            stage,
            message: message.into(),
        }
    }

    pub fn numeric(stage: &'static str, message: impl Into<String>) -> Self {
        CellAssignError::Numeric {
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CellAssignError>;
