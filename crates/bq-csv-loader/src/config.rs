//! Run configuration.
//!
//! [`LoadConfig`] gathers everything one invocation needs: the CSV source,
//! the destination table, the run mode and the credential source. Build it
//! with [`LoadConfig::builder()`]; the builder validates before returning.

use crate::auth::CredentialSource;
use crate::error::{LoaderError, Result};
use crate::locator::{self, TableLocator};
use crate::source::{self, CsvSource, DEFAULT_ENCODING};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which stages a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Only create the table from the CSV header.
    Create,
    /// Only append rows to an existing table.
    Upload,
    /// Create, then upload.
    #[default]
    Both,
}

impl RunMode {
    pub fn includes_create(self) -> bool {
        matches!(self, Self::Create | Self::Both)
    }

    pub fn includes_upload(self) -> bool {
        matches!(self, Self::Upload | Self::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Upload => "upload",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the destination table was named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableTarget {
    /// A `[project.]dataset.table` locator.
    Id(String),
    /// An explicit dataset and table name; the project comes from defaults.
    Named { dataset: String, table: String },
}

/// Configuration for one load run.
///
/// # Example
///
/// ```rust,ignore
/// use bq_csv_loader::config::{LoadConfig, RunMode};
///
/// let config = LoadConfig::builder()
///     .csv_path("data.csv")
///     .table_id("analytics.events")
///     .project_id("my-project")
///     .mode(RunMode::Upload)
///     .separator(",")
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Source file.
    pub csv_path: PathBuf,

    /// Destination table.
    pub target: TableTarget,

    /// Project override; also the default project for short locators.
    pub project_id: Option<String>,

    /// Default dataset for a one-segment locator.
    pub dataset: Option<String>,

    /// Default: [`RunMode::Both`]
    pub mode: RunMode,

    /// Field delimiter as given by the user (one byte, or `\t`).
    /// Default: ";"
    pub separator: String,

    /// Encoding label.
    /// Default: "utf-8-sig"
    pub encoding: String,

    /// Default: [`CredentialSource::Ambient`]
    pub credentials: CredentialSource,

    /// Use `CREATE OR REPLACE TABLE`.
    pub replace: bool,

    /// Print the CREATE statement without executing it.
    pub print_sql: bool,
}

impl LoadConfig {
    /// Create a new configuration builder.
    pub fn builder() -> LoadConfigBuilder {
        LoadConfigBuilder::default()
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if self.csv_path.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingCsvPath);
        }

        match &self.target {
            TableTarget::Id(id) if id.trim().is_empty() => {
                return Err(ConfigValidationError::MissingTarget);
            }
            TableTarget::Named { dataset, table } if dataset.is_empty() || table.is_empty() => {
                return Err(ConfigValidationError::MissingTarget);
            }
            _ => {}
        }

        if source::parse_delimiter(&self.separator).is_none() {
            return Err(ConfigValidationError::InvalidSeparator(
                self.separator.clone(),
            ));
        }

        if source::resolve_encoding(&self.encoding).is_none() {
            return Err(ConfigValidationError::UnknownEncoding(
                self.encoding.clone(),
            ));
        }

        Ok(())
    }

    /// The CSV file as a readable source.
    pub fn csv_source(&self) -> std::result::Result<CsvSource, ConfigValidationError> {
        let delimiter = source::parse_delimiter(&self.separator)
            .ok_or_else(|| ConfigValidationError::InvalidSeparator(self.separator.clone()))?;
        let encoding = source::resolve_encoding(&self.encoding)
            .ok_or_else(|| ConfigValidationError::UnknownEncoding(self.encoding.clone()))?;

        Ok(CsvSource::new(&self.csv_path)
            .delimiter(delimiter)
            .encoding(encoding))
    }

    /// Resolve the destination table.
    ///
    /// `--project-id` wins over `client_project` as the default project.
    pub fn resolve_table(&self, client_project: Option<&str>) -> Result<TableLocator> {
        let default_project = self
            .project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(client_project);

        match &self.target {
            TableTarget::Id(id) => locator::resolve(id, default_project, self.dataset.as_deref()),
            TableTarget::Named { dataset, table } => {
                let project = default_project.ok_or(LoaderError::MissingProject)?;
                TableLocator::new(project, dataset.as_str(), table.as_str())
            }
        }
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("--csv is required")]
    MissingCsvPath,

    #[error("provide --table-id OR (--dataset and --table-name)")]
    MissingTarget,

    #[error("Invalid separator: '{0}' (must be a single ASCII character or \\t)")]
    InvalidSeparator(String),

    #[error("Unknown encoding: '{0}'")]
    UnknownEncoding(String),
}

impl From<ConfigValidationError> for LoaderError {
    fn from(err: ConfigValidationError) -> Self {
        LoaderError::InvalidArguments(err.to_string())
    }
}

/// Builder for [`LoadConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct LoadConfigBuilder {
    csv_path: Option<PathBuf>,
    table_id: Option<String>,
    dataset: Option<String>,
    table_name: Option<String>,
    project_id: Option<String>,
    mode: Option<RunMode>,
    separator: Option<String>,
    encoding: Option<String>,
    credentials: Option<CredentialSource>,
    replace: bool,
    print_sql: bool,
}

impl LoadConfigBuilder {
    /// Set the source CSV file.
    pub fn csv_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.csv_path = Some(path.into());
        self
    }

    /// Set the destination as a `[project.]dataset.table` locator.
    ///
    /// Takes precedence over [`table_name`](Self::table_name).
    pub fn table_id(mut self, table_id: impl Into<String>) -> Self {
        self.table_id = Some(table_id.into());
        self
    }

    /// Set the dataset: the destination dataset together with
    /// [`table_name`](Self::table_name), otherwise the default dataset for a
    /// one-segment locator.
    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    /// Set the destination table name (used with [`dataset`](Self::dataset)).
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    /// Set the project override.
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the field delimiter (one ASCII character, or `\t`).
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    /// Set the encoding label.
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn credentials(mut self, credentials: CredentialSource) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn print_sql(mut self, print_sql: bool) -> Self {
        self.print_sql = print_sql;
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `LoadConfig` or an error if validation fails.
    pub fn build(self) -> std::result::Result<LoadConfig, ConfigValidationError> {
        let csv_path = self.csv_path.ok_or(ConfigValidationError::MissingCsvPath)?;

        let target = match (self.table_id, &self.dataset, self.table_name) {
            (Some(id), _, _) => TableTarget::Id(id),
            (None, Some(dataset), Some(table)) => TableTarget::Named {
                dataset: dataset.clone(),
                table,
            },
            _ => return Err(ConfigValidationError::MissingTarget),
        };

        let config = LoadConfig {
            csv_path,
            target,
            project_id: self.project_id,
            dataset: self.dataset,
            mode: self.mode.unwrap_or_default(),
            separator: self
                .separator
                .unwrap_or_else(|| (source::DEFAULT_DELIMITER as char).to_string()),
            encoding: self.encoding.unwrap_or_else(|| DEFAULT_ENCODING.to_string()),
            credentials: self.credentials.unwrap_or_default(),
            replace: self.replace,
            print_sql: self.print_sql,
        };

        config.validate()?;
        Ok(config)
    }
}
