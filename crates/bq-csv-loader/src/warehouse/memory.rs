//! In-process warehouse.
//!
//! [`MemoryWarehouse`] keeps tables in a map and understands the `CREATE
//! [OR REPLACE] TABLE` statements produced by [`crate::ddl`]. Every statement
//! is recorded and failures can be injected per operation.

use std::collections::HashMap;

use crate::ddl::TEXT_TYPE;
use crate::error::{LoaderError, Result};
use crate::locator::TableLocator;
use crate::normalize::NormalizedFrame;

use super::Warehouse;
use parking_lot::Mutex;
use tracing::debug;

/// A stored row: one optional text value per table column.
pub type StoredRow = Vec<Option<String>>;

/// Failure to return from an operation instead of performing it.
#[derive(Debug, Clone)]
enum Injected {
    Rejected(String),
    Api(String),
}

impl Injected {
    fn to_error(&self) -> LoaderError {
        match self {
            Self::Rejected(message) => LoaderError::StatementSyntax(message.clone()),
            Self::Api(message) => LoaderError::WarehouseApi(message.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    statements: Vec<String>,
    loads: usize,
    lookup_failure: Option<Injected>,
    statement_failure: Option<Injected>,
    load_failure: Option<Injected>,
}

/// In-memory [`Warehouse`].
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

static_assertions::assert_impl_all!(MemoryWarehouse: Send, Sync);

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`add_table`](Self::add_table).
    pub fn with_table(self, locator: &TableLocator, columns: &[&str]) -> Self {
        self.add_table(locator, columns);
        self
    }

    /// Create (or replace) an empty table.
    pub fn add_table(&self, locator: &TableLocator, columns: &[&str]) {
        let table = MemoryTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        };
        self.state.lock().tables.insert(locator.to_string(), table);
    }

    /// Make `table_exists` and `table_columns` fail with an API error.
    pub fn fail_lookups(&self, message: impl Into<String>) {
        self.state.lock().lookup_failure = Some(Injected::Api(message.into()));
    }

    /// Make `execute_statement` reject every statement.
    pub fn reject_statements(&self, message: impl Into<String>) {
        self.state.lock().statement_failure = Some(Injected::Rejected(message.into()));
    }

    /// Make `execute_statement` fail with an API error.
    pub fn fail_statements(&self, message: impl Into<String>) {
        self.state.lock().statement_failure = Some(Injected::Api(message.into()));
    }

    /// Make `load_rows` reject every load.
    pub fn reject_loads(&self, message: impl Into<String>) {
        self.state.lock().load_failure = Some(Injected::Rejected(message.into()));
    }

    /// Make `load_rows` fail with an API error.
    pub fn fail_loads(&self, message: impl Into<String>) {
        self.state.lock().load_failure = Some(Injected::Api(message.into()));
    }

    /// Every statement submitted so far, including failed ones.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Number of `load_rows` calls so far, including failed ones.
    pub fn load_count(&self) -> usize {
        self.state.lock().loads
    }

    /// Column names of a table, if it exists.
    pub fn columns(&self, locator: &TableLocator) -> Option<Vec<String>> {
        self.state
            .lock()
            .tables
            .get(&locator.to_string())
            .map(|t| t.columns.clone())
    }

    /// Stored rows of a table, if it exists.
    pub fn rows(&self, locator: &TableLocator) -> Option<Vec<StoredRow>> {
        self.state
            .lock()
            .tables
            .get(&locator.to_string())
            .map(|t| t.rows.clone())
    }
}

impl Warehouse for MemoryWarehouse {
    fn table_exists(&self, locator: &TableLocator) -> Result<bool> {
        let state = self.state.lock();
        if let Some(failure) = &state.lookup_failure {
            return Err(failure.to_error());
        }
        Ok(state.tables.contains_key(&locator.to_string()))
    }

    fn table_columns(&self, locator: &TableLocator) -> Result<Vec<String>> {
        let state = self.state.lock();
        if let Some(failure) = &state.lookup_failure {
            return Err(failure.to_error());
        }
        state
            .tables
            .get(&locator.to_string())
            .map(|t| t.columns.clone())
            .ok_or_else(|| LoaderError::TableNotFound(locator.to_string()))
    }

    fn execute_statement(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());
        if let Some(failure) = &state.statement_failure {
            return Err(failure.to_error());
        }

        let create = parse_create(sql).ok_or_else(|| {
            LoaderError::StatementSyntax(format!("unsupported statement: {}", first_line(sql)))
        })?;

        if !create.replace && state.tables.contains_key(&create.table) {
            return Err(LoaderError::WarehouseApi(format!(
                "Already Exists: Table {}",
                create.table
            )));
        }

        debug!(
            "Memory warehouse: created {} with {} columns",
            create.table,
            create.columns.len()
        );
        state.tables.insert(
            create.table,
            MemoryTable {
                columns: create.columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn load_rows(&self, locator: &TableLocator, rows: &NormalizedFrame) -> Result<u64> {
        let mut state = self.state.lock();
        state.loads += 1;
        if let Some(failure) = &state.load_failure {
            return Err(failure.to_error());
        }

        let table = state
            .tables
            .get_mut(&locator.to_string())
            .ok_or_else(|| LoaderError::TableNotFound(locator.to_string()))?;

        if let Some(unknown) = rows.columns().iter().find(|c| !table.columns.contains(c)) {
            return Err(LoaderError::StatementSyntax(format!(
                "no such field: {}",
                unknown
            )));
        }

        let mut loaded = 0u64;
        for row in rows.rows()? {
            let stored = table
                .columns
                .iter()
                .map(|c| row.get(c).flatten().map(str::to_string))
                .collect();
            table.rows.push(stored);
            loaded += 1;
        }

        Ok(loaded)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug, PartialEq)]
struct ParsedCreate {
    replace: bool,
    table: String,
    columns: Vec<String>,
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or_default()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &text[prefix.len()..])
}

/// Read a backtick-quoted identifier from the start of `text`.
fn take_quoted(text: &str) -> Option<(String, &str)> {
    let mut chars = text.strip_prefix('`')?.char_indices();
    let mut name = String::new();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\\' => name.push(chars.next()?.1),
            // +1 for the opening backtick, +1 to skip the closing one
            '`' => return Some((name, &text[idx + 2..])),
            other => name.push(other),
        }
    }
    None
}

/// Parse a `CREATE [OR REPLACE] TABLE` statement with text-only columns.
fn parse_create(sql: &str) -> Option<ParsedCreate> {
    let sql = sql.trim();
    let (replace, rest) = match strip_prefix_ignore_case(sql, "CREATE OR REPLACE TABLE") {
        Some(rest) => (true, rest),
        None => (false, strip_prefix_ignore_case(sql, "CREATE TABLE")?),
    };

    let (table, rest) = take_quoted(rest.trim_start())?;
    let body = rest.trim_start().strip_prefix('(')?;
    let body = body.trim_end();
    let body = body.strip_suffix(';').unwrap_or(body).trim_end();
    let mut rest = body.strip_suffix(')')?;

    let mut columns = Vec::new();
    loop {
        let (name, after) = take_quoted(rest.trim_start())?;
        let (column_type, next) = match after.find(',') {
            Some(idx) => (&after[..idx], Some(&after[idx + 1..])),
            None => (after, None),
        };
        if !column_type.trim().eq_ignore_ascii_case(TEXT_TYPE) {
            return None;
        }
        columns.push(name);

        match next {
            Some(next) => rest = next,
            None => break,
        }
    }

    Some(ParsedCreate {
        replace,
        table,
        columns,
    })
}
