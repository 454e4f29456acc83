//! Error types for the CSV-to-BigQuery loader.
//!
//! Every failure the loader can hit is a variant of [`LoaderError`]. The
//! orchestrator decides the process exit code from the variant together with
//! the stage that produced it (see [`crate::loader::StageFailure`]).
//!
//! Errors are serializable so that `--json` runs can emit them as
//! `{"code": ..., "message": ...}`.

use serde::Serialize;
use serde::ser::SerializeStruct;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the loader.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The locator is empty, has an empty segment, or has more than three segments.
    #[error("Invalid table-id format: '{0}' (expected [project.]dataset.table)")]
    InvalidLocatorFormat(String),

    /// A `dataset.table` locator was given without a project.
    #[error("When using 'dataset.table', provide --project-id")]
    MissingProject,

    /// A bare `table` locator was given without both a project and a dataset.
    #[error("When using only 'table', provide --project-id and --dataset")]
    MissingDefaults,

    /// The CSV file could not be opened, decoded or parsed.
    #[error("Failed to read CSV '{}': {reason}", path.display())]
    CsvRead { path: PathBuf, reason: String },

    /// The warehouse rejected the submitted statement or load job.
    #[error("Statement rejected by the warehouse: {0}")]
    StatementSyntax(String),

    /// Transport, authentication, quota or any other warehouse failure.
    #[error("Warehouse API error: {0}")]
    WarehouseApi(String),

    /// The destination table does not exist.
    #[error("Table `{0}` does not exist")]
    TableNotFound(String),

    /// Command-line flags do not form a valid combination.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The warehouse client could not be built.
    #[error("Failed to create BigQuery client: {0}")]
    ClientConstruction(String),

    /// Credentials could not be loaded or exchanged for an access token.
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LoaderError>,
    },
}

impl LoaderError {
    /// Build a [`LoaderError::CsvRead`] from any displayable cause.
    pub fn csv_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        LoaderError::CsvRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LoaderError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with every context layer removed.
    pub fn root(&self) -> &LoaderError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidLocatorFormat(_) => "INVALID_LOCATOR_FORMAT",
            Self::MissingProject => "MISSING_PROJECT",
            Self::MissingDefaults => "MISSING_DEFAULTS",
            Self::CsvRead { .. } => "CSV_READ_ERROR",
            Self::StatementSyntax(_) => "STATEMENT_SYNTAX_ERROR",
            Self::WarehouseApi(_) => "WAREHOUSE_API_ERROR",
            Self::TableNotFound(_) => "TABLE_NOT_FOUND",
            Self::InvalidArguments(_) => "INVALID_ARGUMENTS",
            Self::ClientConstruction(_) => "CLIENT_CONSTRUCTION_ERROR",
            Self::Credentials(_) => "CREDENTIALS_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Whether this error came from resolving the table locator.
    pub fn is_locator_error(&self) -> bool {
        matches!(
            self.root(),
            Self::InvalidLocatorFormat(_) | Self::MissingProject | Self::MissingDefaults
        )
    }

    /// Whether the warehouse refused the statement or load itself, as opposed
    /// to failing to process it.
    pub fn is_rejection(&self) -> bool {
        matches!(self.root(), Self::StatementSyntax(_))
    }
}

/// Errors are serialized as a struct with `code` and `message` fields.
impl Serialize for LoaderError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("LoaderError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| LoaderError::Polars(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(LoaderError::MissingProject.error_code(), "MISSING_PROJECT");
        assert_eq!(
            LoaderError::TableNotFound("p.d.t".to_string()).error_code(),
            "TABLE_NOT_FOUND"
        );
        assert_eq!(
            LoaderError::csv_read("a.csv", "boom").error_code(),
            "CSV_READ_ERROR"
        );
    }

    #[test]
    fn test_csv_read_message_carries_cause() {
        let error = LoaderError::csv_read("data/in.csv", "No such file or directory");
        let message = error.to_string();
        assert!(message.contains("data/in.csv"));
        assert!(message.contains("No such file or directory"));
    }

    #[test]
    fn test_is_locator_error() {
        assert!(LoaderError::MissingDefaults.is_locator_error());
        assert!(LoaderError::InvalidLocatorFormat("a.b.c.d".into()).is_locator_error());
        assert!(!LoaderError::WarehouseApi("quota".into()).is_locator_error());
    }

    #[test]
    fn test_is_rejection_sees_through_context() {
        let error = LoaderError::StatementSyntax("Syntax error at [1:8]".into())
            .with_context("Executing CREATE TABLE");
        assert!(error.is_rejection());
        assert!(!LoaderError::WarehouseApi("503".into()).is_rejection());
    }

    #[test]
    fn test_error_serialization() {
        let error = LoaderError::TableNotFound("proj.ds.tbl".to_string());
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("TABLE_NOT_FOUND"));
        assert!(json.contains("proj.ds.tbl"));
    }

    #[test]
    fn test_with_context() {
        let error = LoaderError::MissingProject.with_context("Resolving table-id");
        assert!(error.to_string().contains("Resolving table-id"));
        assert_eq!(error.error_code(), "MISSING_PROJECT");
    }
}
