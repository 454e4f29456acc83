//! Resolution of user-supplied table locators.
//!
//! A locator is `[project.]dataset.table`. Missing leading segments are filled
//! from defaults; the result is always a fully-qualified [`TableLocator`].

use crate::error::{LoaderError, Result};
use serde::Serialize;
use std::fmt;

/// Fully-qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableLocator {
    project: String,
    dataset: String,
    table: String,
}

impl TableLocator {
    /// Build a locator from its three parts.
    ///
    /// Fails with [`LoaderError::InvalidLocatorFormat`] if any part is empty.
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self> {
        let locator = Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        };

        if locator.project.is_empty() || locator.dataset.is_empty() || locator.table.is_empty() {
            return Err(LoaderError::InvalidLocatorFormat(locator.to_string()));
        }

        Ok(locator)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Resolve a dotted locator against optional default project and dataset.
///
/// - `project.dataset.table` is used verbatim, defaults are ignored.
/// - `dataset.table` needs `default_project`.
/// - `table` needs both `default_project` and `default_dataset`.
///
/// Empty defaults count as absent.
///
/// # Example
///
/// ```rust
/// use bq_csv_loader::locator::resolve;
///
/// let locator = resolve("ds.tbl", Some("p"), None).unwrap();
/// assert_eq!(locator.to_string(), "p.ds.tbl");
/// ```
pub fn resolve(
    locator: &str,
    default_project: Option<&str>,
    default_dataset: Option<&str>,
) -> Result<TableLocator> {
    let default_project = default_project.filter(|p| !p.is_empty());
    let default_dataset = default_dataset.filter(|d| !d.is_empty());

    let parts: Vec<&str> = locator.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(LoaderError::InvalidLocatorFormat(locator.to_string()));
    }

    match parts.as_slice() {
        [project, dataset, table] => TableLocator::new(*project, *dataset, *table),
        [dataset, table] => {
            let project = default_project.ok_or(LoaderError::MissingProject)?;
            TableLocator::new(project, *dataset, *table)
        }
        [table] => match (default_project, default_dataset) {
            (Some(project), Some(dataset)) => TableLocator::new(project, dataset, *table),
            _ => Err(LoaderError::MissingDefaults),
        },
        _ => Err(LoaderError::InvalidLocatorFormat(locator.to_string())),
    }
}
