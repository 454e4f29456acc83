//! Run orchestration.
//!
//! [`Loader::run`] sequences one invocation:
//!
//! 1. resolve the destination table,
//! 2. create stage (modes `create` / `both`): read the CSV header, print the
//!    CREATE statement and execute it unless `print_sql` is set,
//! 3. upload stage (modes `upload` / `both`): check that the table exists,
//!    read the whole CSV, align it with the live columns and append it.
//!
//! The first failure ends the run. It comes back as a [`StageFailure`],
//! whose [`exit_code`](StageFailure::exit_code) is the process exit status.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::config::{LoadConfig, RunMode};
use crate::ddl;
use crate::error::LoaderError;
use crate::normalize::normalize;
use crate::report::{CreateOutcome, RunReport};
use crate::source;
use crate::warehouse::Warehouse;
use serde::Serialize;
use tracing::{info, warn};

/// Hint for a missing table when the run was supposed to create it.
pub const HINT_CREATE_EXPECTED: &str = "expected the create stage to have made the table before upload";

/// Hint for a missing table in upload-only runs.
pub const HINT_RUN_BOTH: &str = "run with --mode both to create and upload in one go";

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Flag validation.
    Arguments,
    /// Warehouse client construction.
    Client,
    /// Table locator resolution.
    Resolve,
    /// CSV header read.
    ReadHeader,
    /// CREATE statement execution.
    CreateTable,
    /// Table existence check before upload.
    CheckTable,
    /// Full CSV read.
    ReadCsv,
    /// Schema fetch, normalization and load job.
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Arguments => "arguments",
            Self::Client => "client",
            Self::Resolve => "resolve",
            Self::ReadHeader => "read header",
            Self::CreateTable => "create table",
            Self::CheckTable => "check table",
            Self::ReadCsv => "read csv",
            Self::Load => "load",
        };
        f.write_str(name)
    }
}

/// A run failure tagged with the stage that produced it.
#[derive(Debug)]
pub struct StageFailure {
    stage: Stage,
    error: LoaderError,
    hint: Option<&'static str>,
}

impl StageFailure {
    pub fn new(stage: Stage, error: LoaderError) -> Self {
        Self {
            stage,
            error,
            hint: None,
        }
    }

    /// Attach a user-facing hint.
    pub fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn error(&self) -> &LoaderError {
        &self.error
    }

    pub fn hint(&self) -> Option<&'static str> {
        self.hint
    }

    /// Process exit status for this failure.
    ///
    /// | code | meaning |
    /// |---|---|
    /// | 1 | invalid flags or client construction |
    /// | 2 | table locator resolution |
    /// | 3 | CSV header read |
    /// | 4 | CREATE statement rejected |
    /// | 5 | other create-stage failure |
    /// | 6 | upload against a table that does not exist |
    /// | 7 | full CSV read |
    /// | 8 | load rejected |
    /// | 9 | other upload-stage failure |
    pub fn exit_code(&self) -> u8 {
        match self.stage {
            Stage::Arguments | Stage::Client => 1,
            Stage::Resolve => 2,
            Stage::ReadHeader => 3,
            Stage::CreateTable if self.error.is_rejection() => 4,
            Stage::CreateTable => 5,
            Stage::CheckTable
                if matches!(self.error.root(), LoaderError::TableNotFound(_)) =>
            {
                6
            }
            Stage::CheckTable => 9,
            Stage::ReadCsv => 7,
            Stage::Load if self.error.is_rejection() => 8,
            Stage::Load => 9,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for StageFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Tag a result's error with a stage.
trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<LoaderError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|e| StageFailure::new(stage, e.into()))
    }
}

/// Runs the create and upload stages against a [`Warehouse`].
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    config: LoadConfig,
}

impl Loader {
    pub fn new(warehouse: Arc<dyn Warehouse>, config: LoadConfig) -> Self {
        Self { warehouse, config }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Execute the run.
    ///
    /// `client_project` is the warehouse client's project, used as the
    /// default project when `--project-id` is absent. User-facing output (the
    /// CREATE statement and stage results) is written to `out`.
    pub fn run<W: Write>(
        &self,
        client_project: Option<&str>,
        out: &mut W,
    ) -> Result<RunReport, StageFailure> {
        let csv = self.config.csv_source().at(Stage::Arguments)?;
        let locator = self.config.resolve_table(client_project).at(Stage::Resolve)?;
        let mode = self.config.mode;

        info!(
            "Target table {} (mode: {}, warehouse: {})",
            locator,
            mode,
            self.warehouse.name()
        );
        let mut report = RunReport::new(&locator, mode);

        if mode.includes_create() {
            let columns = source::read_header(&csv).at(Stage::ReadHeader)?;
            info!("CSV header has {} columns", columns.len());

            let sql = ddl::generate_create_statement(&locator, &columns, self.config.replace);
            writeln!(out, "Table creation SQL:\n{}\n", sql).at(Stage::CreateTable)?;

            let executed = if self.config.print_sql {
                info!("Print-only run, statement not executed");
                false
            } else {
                self.warehouse
                    .execute_statement(&sql)
                    .at(Stage::CreateTable)?;
                writeln!(out, "Table `{}` created.", locator).at(Stage::CreateTable)?;
                true
            };

            report.create = Some(CreateOutcome {
                sql,
                columns,
                executed,
            });
        }

        if mode.includes_upload() {
            if !self.warehouse.table_exists(&locator).at(Stage::CheckTable)? {
                let hint = match mode {
                    RunMode::Both => HINT_CREATE_EXPECTED,
                    _ => HINT_RUN_BOTH,
                };
                return Err(StageFailure::new(
                    Stage::CheckTable,
                    LoaderError::TableNotFound(locator.to_string()),
                )
                .with_hint(hint));
            }

            let raw = source::read_rows(&csv).at(Stage::ReadCsv)?;
            info!("Read {} rows from {}", raw.height(), csv.path().display());

            let columns = self.warehouse.table_columns(&locator).at(Stage::Load)?;
            let rows = normalize(&raw, &columns).at(Stage::Load)?;

            let loaded = if rows.is_empty() {
                warn!("CSV has no data rows, skipping load");
                0
            } else {
                self.warehouse.load_rows(&locator, &rows).at(Stage::Load)?
            };

            writeln!(out, "{} rows loaded into `{}`.", loaded, locator).at(Stage::Load)?;
            report.rows_loaded = Some(loaded);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::TableLocator;
    use crate::warehouse::MemoryWarehouse;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    // -------------------------------------------------------------------------
    // Helper functions
    // -------------------------------------------------------------------------

    fn fixture(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bq-csv-loader-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn locator() -> TableLocator {
        TableLocator::new("proj", "ds", "tbl").unwrap()
    }

    fn run(
        warehouse: &Arc<MemoryWarehouse>,
        config: LoadConfig,
    ) -> (Result<RunReport, StageFailure>, String) {
        let loader = Loader::new(warehouse.clone(), config);
        let mut out = Vec::new();
        let result = loader.run(Some("proj"), &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    // -------------------------------------------------------------------------
    // Exit codes
    // -------------------------------------------------------------------------

    #[test]
    fn test_exit_codes() {
        let api = || LoaderError::WarehouseApi("x".into());
        let syntax = || LoaderError::StatementSyntax("x".into());

        let cases = [
            (Stage::Arguments, LoaderError::InvalidArguments("x".into()), 1),
            (Stage::Client, LoaderError::ClientConstruction("x".into()), 1),
            (Stage::Client, LoaderError::Credentials("x".into()), 1),
            (Stage::Resolve, LoaderError::MissingProject, 2),
            (Stage::ReadHeader, LoaderError::csv_read("f", "x"), 3),
            (Stage::CreateTable, syntax(), 4),
            (Stage::CreateTable, api(), 5),
            (Stage::CheckTable, LoaderError::TableNotFound("t".into()), 6),
            (Stage::CheckTable, api(), 9),
            (Stage::ReadCsv, LoaderError::csv_read("f", "x"), 7),
            (Stage::Load, syntax(), 8),
            (Stage::Load, api(), 9),
        ];

        for (stage, error, expected) in cases {
            let failure = StageFailure::new(stage, error);
            assert_eq!(failure.exit_code(), expected, "stage {stage}");
        }
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let error = LoaderError::StatementSyntax("bad".into()).with_context("Creating table");
        assert_eq!(StageFailure::new(Stage::CreateTable, error).exit_code(), 4);
    }

    // -------------------------------------------------------------------------
    // Create stage
    // -------------------------------------------------------------------------

    #[test]
    fn test_create_only_prints_and_executes() {
        let csv = fixture("create.csv", "a;b\n1;2\n");
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .mode(RunMode::Create)
            .build()
            .unwrap();

        let (result, out) = run(&warehouse, config);
        let report = result.unwrap();

        let sql = "CREATE TABLE `proj.ds.tbl` (\n  `a` STRING,\n  `b` STRING\n);";
        assert!(out.contains(sql));
        assert!(out.contains("Table `proj.ds.tbl` created."));
        assert_eq!(warehouse.statements(), vec![sql.to_string()]);
        assert_eq!(report.rows_loaded, None);
        assert!(report.create.unwrap().executed);
    }

    #[test]
    fn test_print_sql_skips_execution() {
        let csv = fixture("print.csv", "a;b\n");
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("proj.ds.tbl")
            .mode(RunMode::Create)
            .print_sql(true)
            .build()
            .unwrap();

        let (result, out) = run(&warehouse, config);

        assert!(out.contains("CREATE TABLE `proj.ds.tbl`"));
        assert!(warehouse.statements().is_empty());
        assert!(!result.unwrap().create.unwrap().executed);
    }

    #[test]
    fn test_rejected_create_exits_4() {
        let csv = fixture("reject.csv", "a\n");
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.reject_statements("Syntax error");
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .build()
            .unwrap();

        let failure = run(&warehouse, config).0.unwrap_err();
        assert_eq!(failure.stage(), Stage::CreateTable);
        assert_eq!(failure.exit_code(), 4);
        assert_eq!(warehouse.load_count(), 0);
    }

    #[test]
    fn test_missing_header_file_exits_3() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path("/no/such/file.csv")
            .table_id("ds.tbl")
            .build()
            .unwrap();

        assert_eq!(run(&warehouse, config).0.unwrap_err().exit_code(), 3);
    }

    // -------------------------------------------------------------------------
    // Upload stage
    // -------------------------------------------------------------------------

    #[test]
    fn test_upload_to_missing_table_never_reads_csv() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path("/no/such/file.csv")
            .table_id("ds.tbl")
            .mode(RunMode::Upload)
            .build()
            .unwrap();

        let failure = run(&warehouse, config).0.unwrap_err();
        assert_eq!(failure.exit_code(), 6);
        assert_eq!(failure.hint(), Some(HINT_RUN_BOTH));
    }

    #[test]
    fn test_upload_fills_missing_columns() {
        let csv = fixture("upload.csv", "a;b\n1;x\n2;None\n");
        let warehouse = Arc::new(MemoryWarehouse::new().with_table(&locator(), &["a", "b", "c"]));
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .mode(RunMode::Upload)
            .build()
            .unwrap();

        let (result, out) = run(&warehouse, config);

        assert_eq!(result.unwrap().rows_loaded, Some(2));
        assert!(out.contains("2 rows loaded into `proj.ds.tbl`."));
        assert_eq!(
            warehouse.rows(&locator()).unwrap(),
            vec![
                vec![Some("1".to_string()), Some("x".to_string()), None],
                vec![Some("2".to_string()), None, None],
            ]
        );
    }

    #[test]
    fn test_existence_check_failure_exits_9() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_lookups("permission denied");
        let config = LoadConfig::builder()
            .csv_path("unused.csv")
            .table_id("ds.tbl")
            .mode(RunMode::Upload)
            .build()
            .unwrap();

        let failure = run(&warehouse, config).0.unwrap_err();
        assert_eq!(failure.stage(), Stage::CheckTable);
        assert_eq!(failure.exit_code(), 9);
    }

    #[test]
    fn test_rejected_load_exits_8() {
        let csv = fixture("rejected_load.csv", "a\n1\n");
        let warehouse = Arc::new(MemoryWarehouse::new().with_table(&locator(), &["a"]));
        warehouse.reject_loads("invalid");
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .mode(RunMode::Upload)
            .build()
            .unwrap();

        assert_eq!(run(&warehouse, config).0.unwrap_err().exit_code(), 8);
    }

    #[test]
    fn test_header_only_csv_skips_load() {
        let csv = fixture("header_only.csv", "a;b\n");
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .build()
            .unwrap();

        let report = run(&warehouse, config).0.unwrap();
        assert_eq!(report.rows_loaded, Some(0));
        assert_eq!(warehouse.load_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Both
    // -------------------------------------------------------------------------

    #[test]
    fn test_both_creates_then_loads() {
        let csv = fixture("both.csv", "name;age\nAna;NaN\nBia;30\n");
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .build()
            .unwrap();

        let report = run(&warehouse, config).0.unwrap();

        assert_eq!(report.table, "proj.ds.tbl");
        assert_eq!(report.rows_loaded, Some(2));
        assert_eq!(
            warehouse.columns(&locator()),
            Some(vec!["name".to_string(), "age".to_string()])
        );
        assert_eq!(warehouse.rows(&locator()).unwrap()[0][1], None);
    }

    #[test]
    fn test_both_with_print_sql_hints_create() {
        let csv = fixture("both_print.csv", "a\n1\n");
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path(&csv)
            .table_id("ds.tbl")
            .print_sql(true)
            .build()
            .unwrap();

        let failure = run(&warehouse, config).0.unwrap_err();
        assert_eq!(failure.exit_code(), 6);
        assert_eq!(failure.hint(), Some(HINT_CREATE_EXPECTED));
    }

    #[test]
    fn test_resolution_failure_exits_2() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = LoadConfig::builder()
            .csv_path("unused.csv")
            .table_id("a.b.c.d")
            .build()
            .unwrap();

        let failure = run(&warehouse, config).0.unwrap_err();
        assert_eq!(failure.stage(), Stage::Resolve);
        assert_eq!(failure.exit_code(), 2);
        assert!(warehouse.statements().is_empty());
    }
}
