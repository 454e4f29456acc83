//! Serializable run summaries for `--json` output.

use crate::config::RunMode;
use crate::error::LoaderError;
use crate::loader::{Stage, StageFailure};
use crate::locator::TableLocator;
use serde::Serialize;

/// What the create stage did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateOutcome {
    /// The generated statement.
    pub sql: String,
    /// Columns taken from the CSV header, in order.
    pub columns: Vec<String>,
    /// `false` when the statement was only printed.
    pub executed: bool,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Fully-qualified destination table.
    pub table: String,
    pub mode: RunMode,
    /// Present when the mode includes the create stage.
    pub create: Option<CreateOutcome>,
    /// Present when the mode includes the upload stage.
    pub rows_loaded: Option<u64>,
}

impl RunReport {
    pub fn new(locator: &TableLocator, mode: RunMode) -> Self {
        Self {
            table: locator.to_string(),
            mode,
            create: None,
            rows_loaded: None,
        }
    }
}

/// A failed run, as printed under `--json`.
#[derive(Debug, Serialize)]
pub struct FailureReport<'a> {
    pub stage: Stage,
    pub exit_code: u8,
    pub error: &'a LoaderError,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'a str>,
}

impl<'a> From<&'a StageFailure> for FailureReport<'a> {
    fn from(failure: &'a StageFailure) -> Self {
        Self {
            stage: failure.stage(),
            exit_code: failure.exit_code(),
            error: failure.error(),
            hint: failure.hint(),
        }
    }
}
