use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Unrecognized or corrupt input encoding. Fatal.
    #[error("Input format error: {0}")]
    Format(String),

    /// A single raw record could not be normalized. The row is skipped.
    #[error("Record {position} rejected: {reason}")]
    Record { position: usize, reason: String },

    /// Image download or checksum failure. Recorded in the manifest, never fatal.
    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// I/O failure while writing an artifact. Fatal.
    #[error("Failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid keyword pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl PipelineError {
    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
