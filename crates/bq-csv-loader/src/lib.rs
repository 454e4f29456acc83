//! CSV to BigQuery loader library
//!
//! Creates all-`STRING` BigQuery tables from CSV headers and appends CSV rows
//! to them, built with Rust and Polars.
//!
//! # Overview
//!
//! - **Locator resolution**: `[project.]dataset.table` plus defaults becomes a
//!   fully-qualified [`TableLocator`]
//! - **Header reading**: column names straight from the first CSV record, in
//!   any encoding `encoding_rs` knows
//! - **DDL generation**: deterministic `CREATE [OR REPLACE] TABLE` with every
//!   column typed `STRING`
//! - **Normalization**: CSV rows are aligned with the live table's columns,
//!   cast to text, and `NaN` / `None` markers become null
//! - **Loading**: append-only load jobs through the [`Warehouse`] trait
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bq_csv_loader::{BigQueryClient, CredentialSource, LoadConfig, Loader, RunMode};
//! use std::sync::Arc;
//!
//! let config = LoadConfig::builder()
//!     .csv_path("sales.csv")
//!     .table_id("analytics.sales")
//!     .mode(RunMode::Both)
//!     .build()?;
//!
//! let client = BigQueryClient::new("my-project", &CredentialSource::Ambient)?;
//! let project = client.project().to_string();
//!
//! let report = Loader::new(Arc::new(client), config)
//!     .run(Some(&project), &mut std::io::stdout())?;
//!
//! println!("Loaded {:?} rows into {}", report.rows_loaded, report.table);
//! ```
//!
//! # Warehouses
//!
//! The loader talks to the warehouse only through [`warehouse::Warehouse`].
//! [`warehouse::BigQueryClient`] is the production backend and
//! [`warehouse::MemoryWarehouse`] keeps tables in process for tests.

pub mod auth;
pub mod config;
pub mod ddl;
pub mod error;
pub mod loader;
pub mod locator;
pub mod normalize;
pub mod report;
pub mod source;
pub mod warehouse;

// Re-exports for convenient access
pub use auth::{AccessTokenProvider, CredentialSource, Credentials};
pub use config::{ConfigValidationError, LoadConfig, LoadConfigBuilder, RunMode, TableTarget};
pub use ddl::generate_create_statement;
pub use error::{LoaderError, Result, ResultExt};
pub use loader::{Loader, Stage, StageFailure};
pub use locator::{TableLocator, resolve};
pub use normalize::{NormalizedFrame, NormalizedRow, normalize};
pub use report::{CreateOutcome, FailureReport, RunReport};
pub use source::{CsvSource, read_header, read_rows};
pub use warehouse::{BigQueryClient, BigQueryConfig, MemoryWarehouse, Warehouse};
