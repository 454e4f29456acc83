//! Integration tests for the CSV loader.
//!
//! These tests run whole create/upload cycles against the in-memory warehouse
//! using the CSV files in `tests/fixtures`.

use bq_csv_loader::{
    CsvSource, FailureReport, LoadConfig, Loader, LoaderError, MemoryWarehouse, RunMode,
    RunReport, Stage, StageFailure, TableLocator, Warehouse, generate_create_statement,
    read_header, read_rows, resolve,
};
use bq_csv_loader::source::resolve_encoding;
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Helper Functions
// ============================================================================

fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(filename: &str) -> PathBuf {
    fixtures_path().join(filename)
}

fn table() -> TableLocator {
    TableLocator::new("proj", "ds", "tbl").unwrap()
}

fn names(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|s| s.to_string()).collect()
}

fn text(values: &[Option<&str>]) -> Vec<Option<String>> {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

/// Run a loader with "proj" as the client project, capturing its output.
fn run(
    warehouse: &Arc<MemoryWarehouse>,
    config: LoadConfig,
) -> (Result<RunReport, StageFailure>, String) {
    let loader = Loader::new(warehouse.clone(), config);
    let mut out = Vec::new();
    let result = loader.run(Some("proj"), &mut out);
    (result, String::from_utf8(out).expect("output is UTF-8"))
}

// ============================================================================
// Locator Resolution
// ============================================================================

#[test]
fn test_fully_qualified_locator_ignores_defaults() {
    let locator = resolve("proj.ds.tbl", Some("other"), Some("other_ds")).unwrap();
    assert_eq!(locator, table());
}

#[test]
fn test_two_segment_locator_uses_default_project() {
    let locator = resolve("ds.tbl", Some("p"), None).unwrap();
    assert_eq!(locator.to_string(), "p.ds.tbl");
}

#[test]
fn test_short_locators_without_defaults() {
    assert!(matches!(
        resolve("ds.tbl", None, Some("ds")),
        Err(LoaderError::MissingProject)
    ));
    assert!(matches!(
        resolve("tbl", Some("p"), None),
        Err(LoaderError::MissingDefaults)
    ));
    assert!(matches!(
        resolve("a.b.c.d", Some("p"), Some("d")),
        Err(LoaderError::InvalidLocatorFormat(_))
    ));
}

// ============================================================================
// CSV Reading
// ============================================================================

#[test]
fn test_header_with_bom() {
    let columns = read_header(&CsvSource::new(fixture("sales.csv"))).unwrap();
    assert_eq!(columns, names(&["id", "name", "amount", "note"]));
}

#[test]
fn test_header_with_quoted_delimiter() {
    let source = CsvSource::new(fixture("quoted_header.csv")).delimiter(b',');
    let columns = read_header(&source).unwrap();
    assert_eq!(columns, names(&["id", "full, name", "city"]));
}

#[test]
fn test_latin1_file() {
    let latin1 = resolve_encoding("latin1").unwrap();
    let source = CsvSource::new(fixture("latin1.csv")).encoding(latin1);

    assert_eq!(read_header(&source).unwrap(), names(&["código", "descrição"]));
    let df = read_rows(&source).unwrap();
    assert_eq!(df.height(), 2);
}

// ============================================================================
// Full Runs
// ============================================================================

#[test]
fn test_both_mode_creates_and_loads() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("sales.csv"))
        .table_id("ds.tbl")
        .build()
        .unwrap();

    let (result, out) = run(&warehouse, config);
    let report = result.unwrap();

    let sql = "CREATE TABLE `proj.ds.tbl` (\n  `id` STRING,\n  `name` STRING,\n  `amount` STRING,\n  `note` STRING\n);";
    assert_eq!(warehouse.statements(), vec![sql.to_string()]);
    assert!(out.contains(sql));
    assert!(out.contains("3 rows loaded into `proj.ds.tbl`."));

    assert_eq!(report.table, "proj.ds.tbl");
    assert_eq!(report.mode, RunMode::Both);
    assert_eq!(report.rows_loaded, Some(3));

    assert_eq!(
        warehouse.rows(&table()).unwrap(),
        vec![
            text(&[Some("1"), Some("Ana"), Some("10.50"), Some("first")]),
            text(&[Some("2"), Some("Bia"), None, None]),
            text(&[Some("3"), Some("Caio"), Some("7"), None]),
        ]
    );
}

#[test]
fn test_upload_fills_columns_missing_from_csv() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(&table(), &["a", "b", "c"]));
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("proj.ds.tbl")
        .mode(RunMode::Upload)
        .build()
        .unwrap();

    let report = run(&warehouse, config).0.unwrap();
    assert_eq!(report.rows_loaded, Some(3));
    assert!(report.create.is_none());

    let rows = warehouse.rows(&table()).unwrap();
    for row in &rows {
        assert_eq!(row.len(), 3);
        assert_eq!(row[2], None);
    }
    assert_eq!(rows[2], text(&[Some("3"), None, None]));
}

#[test]
fn test_upload_to_missing_table_exits_6_without_reading_csv() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("does_not_exist.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Upload)
        .build()
        .unwrap();

    let failure = run(&warehouse, config).0.unwrap_err();
    assert_eq!(failure.stage(), Stage::CheckTable);
    assert_eq!(failure.exit_code(), 6);
    assert!(failure.hint().unwrap().contains("--mode both"));
    assert_eq!(warehouse.load_count(), 0);
}

#[test]
fn test_named_target_with_project_override() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .dataset("ds")
        .table_name("tbl")
        .project_id("override")
        .mode(RunMode::Create)
        .build()
        .unwrap();

    let report = run(&warehouse, config).0.unwrap();
    assert_eq!(report.table, "override.ds.tbl");

    let created = TableLocator::new("override", "ds", "tbl").unwrap();
    assert!(warehouse.table_exists(&created).unwrap());
}

#[test]
fn test_print_sql_only_prints() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Create)
        .replace(true)
        .print_sql(true)
        .build()
        .unwrap();

    let (result, out) = run(&warehouse, config);
    let expected = generate_create_statement(&table(), &names(&["a", "b"]), true);

    assert!(out.contains(&expected));
    assert!(expected.starts_with("CREATE OR REPLACE TABLE"));
    assert!(warehouse.statements().is_empty());
    assert!(!result.unwrap().create.unwrap().executed);
}

#[test]
fn test_replace_recreates_existing_table() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(&table(), &["old"]));
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("ds.tbl")
        .replace(true)
        .build()
        .unwrap();

    run(&warehouse, config).0.unwrap();
    assert_eq!(warehouse.columns(&table()), Some(names(&["a", "b"])));
    assert_eq!(warehouse.rows(&table()).unwrap().len(), 3);
}

#[test]
fn test_header_only_file_loads_nothing() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("header_only.csv"))
        .table_id("ds.tbl")
        .build()
        .unwrap();

    let report = run(&warehouse, config).0.unwrap();
    assert_eq!(report.rows_loaded, Some(0));
    assert!(warehouse.table_exists(&table()).unwrap());
}

#[test]
fn test_create_only_reads_header_of_file_with_bad_rows() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("bad_row.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Create)
        .build()
        .unwrap();

    let report = run(&warehouse, config).0.unwrap();
    assert!(report.create.unwrap().executed);
    assert_eq!(warehouse.columns(&table()), Some(names(&["a", "b"])));
}

// ============================================================================
// Failures and Exit Codes
// ============================================================================

#[test]
fn test_statement_syntax_error_exits_4() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.reject_statements("Syntax error: Unexpected identifier");
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("ds.tbl")
        .build()
        .unwrap();

    let failure = run(&warehouse, config).0.unwrap_err();
    assert_eq!(failure.exit_code(), 4);
    assert_eq!(warehouse.load_count(), 0);
}

#[test]
fn test_create_api_error_exits_5() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.fail_statements("Access Denied");
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Create)
        .build()
        .unwrap();

    assert_eq!(run(&warehouse, config).0.unwrap_err().exit_code(), 5);
}

#[test]
fn test_load_rejection_exits_8() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(&table(), &["a", "b"]));
    warehouse.reject_loads("Error while reading data");
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Upload)
        .build()
        .unwrap();

    assert_eq!(run(&warehouse, config).0.unwrap_err().exit_code(), 8);
}

#[test]
fn test_load_api_error_exits_9() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(&table(), &["a", "b"]));
    warehouse.fail_loads("backendError");
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Upload)
        .build()
        .unwrap();

    assert_eq!(run(&warehouse, config).0.unwrap_err().exit_code(), 9);
}

#[test]
fn test_invalid_encoding_in_csv_exits_7() {
    let warehouse = Arc::new(MemoryWarehouse::new().with_table(&table(), &["x"]));
    // latin1 bytes are not valid UTF-8
    let config = LoadConfig::builder()
        .csv_path(fixture("latin1.csv"))
        .table_id("ds.tbl")
        .mode(RunMode::Upload)
        .build()
        .unwrap();

    let failure = run(&warehouse, config).0.unwrap_err();
    assert_eq!(failure.stage(), Stage::ReadCsv);
    assert_eq!(failure.exit_code(), 7);
}

#[test]
fn test_failure_report_json() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let config = LoadConfig::builder()
        .csv_path(fixture("header_ab.csv"))
        .table_id("tbl")
        .build()
        .unwrap();

    let failure = run(&warehouse, config).0.unwrap_err();
    assert_eq!(failure.exit_code(), 2);

    let value = serde_json::to_value(FailureReport::from(&failure)).unwrap();
    assert_eq!(value["stage"], "resolve");
    assert_eq!(value["exit_code"], 2);
    assert_eq!(value["error"]["code"], "MISSING_DEFAULTS");
}
