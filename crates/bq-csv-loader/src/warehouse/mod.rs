//! Warehouse access for the loader.
//!
//! The loader only talks to the warehouse through the [`Warehouse`] trait, so
//! the orchestration logic can run against any backend:
//!
//! - [`BigQueryClient`] - Google BigQuery over its v2 REST API
//! - [`MemoryWarehouse`] - in-process tables, the test backend
//!
//! # Example
//!
//! ```rust,ignore
//! use bq_csv_loader::auth::CredentialSource;
//! use bq_csv_loader::warehouse::{BigQueryClient, Warehouse};
//!
//! let client = BigQueryClient::new("my-project", &CredentialSource::Ambient)?;
//! if !client.table_exists(&locator)? {
//!     client.execute_statement(&sql)?;
//! }
//! ```

use crate::error::Result;
use crate::locator::TableLocator;
use crate::normalize::NormalizedFrame;

mod bigquery;
mod memory;

pub use bigquery::{BigQueryClient, BigQueryConfig, BigQueryConfigBuilder};
pub use memory::MemoryWarehouse;

/// Operations the loader needs from a data warehouse.
///
/// Every call blocks until the warehouse has finished the operation.
/// Implementations must be `Send + Sync`.
pub trait Warehouse: Send + Sync {
    /// Whether the table exists.
    ///
    /// A "not found" answer is `Ok(false)`; any other failure is an error.
    fn table_exists(&self, locator: &TableLocator) -> Result<bool>;

    /// Top-level column names of the live table, in schema order.
    ///
    /// # Errors
    ///
    /// [`LoaderError::TableNotFound`](crate::error::LoaderError::TableNotFound)
    /// if the table does not exist.
    fn table_columns(&self, locator: &TableLocator) -> Result<Vec<String>>;

    /// Run a SQL statement to completion.
    ///
    /// # Errors
    ///
    /// - `StatementSyntax` if the warehouse rejects the statement text
    /// - `WarehouseApi` for transport, authentication or quota failures
    fn execute_statement(&self, sql: &str) -> Result<()>;

    /// Append rows to an existing table and wait for the load to finish.
    ///
    /// Returns the number of rows the warehouse reports as loaded, or the
    /// number of rows submitted when it reports none. Never overwrites and
    /// never creates the table.
    fn load_rows(&self, locator: &TableLocator, rows: &NormalizedFrame) -> Result<u64>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}
