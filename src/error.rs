// =====================================================
// TRANSFER ERROR TYPES
// =====================================================

use std::io;
use thiserror::Error;

/// Errors raised by the transfer engine.
///
/// The variants follow the failure classes the engine distinguishes:
/// configuration and template problems stop a job before any task starts,
/// connectivity and query problems fail the owning task only, unsupported
/// types fail the exporting task immediately.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Malformed job or settings document, missing attribute
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown variable or malformed `${...}` reference
    #[error("Template error: {0}")]
    Template(String),

    /// Invalid column/row metadata (duplicate or sparse ordinals)
    #[error("Invalid row metadata: {0}")]
    Metadata(String),

    /// Cannot reach or open a datasource
    #[error("Connection to datasource '{datasource}' failed: {message}")]
    Connection { datasource: String, message: String },

    /// Statement or cursor failure on an open connection
    #[error("Query failed: {0}")]
    Query(String),

    /// Column type the export sink refuses to convert
    #[error("Unsupported type {type_name} for column '{column}' in {sink} export")]
    UnsupportedType {
        column: String,
        type_name: String,
        sink: &'static str,
    },

    /// Worker pool failure (rejected submission, panicked unit)
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),
}

impl TransferError {
    pub fn connection(datasource: &str, message: impl Into<String>) -> Self {
        TransferError::Connection {
            datasource: datasource.to_string(),
            message: message.into(),
        }
    }

    /// Configuration and template errors are detected before any task runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TransferError::Config(_) | TransferError::Template(_) | TransferError::Settings(_)
        )
    }
}

impl From<figment::Error> for TransferError {
    fn from(err: figment::Error) -> Self {
        TransferError::Settings(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
