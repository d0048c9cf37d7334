use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CutoutError {
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("invalid catalog name: {0}")]
    InvalidCatalogName(String),

    #[error("missing config file zoo-cutouts.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("TAP request failed: {0}")]
    CatalogHttp(String),

    #[error("TAP service returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("failed to parse catalog table: {0}")]
    CatalogParse(String),

    #[error("catalog is missing required column: {0}")]
    MissingColumn(String),

    #[error("catalog column {column} is not numeric (row {row}: {value:?})")]
    NonNumericColumn {
        column: String,
        row: usize,
        value: String,
    },

    #[error("catalog not found locally: {0}")]
    CatalogNotFound(String),

    #[error("failed to build cutout client: {0}")]
    CutoutClient(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("training data error: {0}")]
    TrainingData(String),
}

/// Why a single cutout request did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("server returned status {status}")]
    Status { status: u16 },

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("gave up after {attempts} attempts (last error: {last})")]
    Exhausted {
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Connection(_) | FetchError::Body(_)
        )
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FetchError::Exhausted { .. })
    }
}
