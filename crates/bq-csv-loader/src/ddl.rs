//! CREATE TABLE statement generation.

use crate::locator::TableLocator;

/// Column type used for every generated column.
pub const TEXT_TYPE: &str = "STRING";

/// Render a `CREATE [OR REPLACE] TABLE` statement with every column typed
/// [`TEXT_TYPE`], in the given column order.
///
/// # Example
///
/// ```rust
/// use bq_csv_loader::ddl::generate_create_statement;
/// use bq_csv_loader::locator::TableLocator;
///
/// let locator = TableLocator::new("p", "d", "t").unwrap();
/// let sql = generate_create_statement(&locator, &["a".to_string()], false);
/// assert_eq!(sql, "CREATE TABLE `p.d.t` (\n  `a` STRING\n);");
/// ```
pub fn generate_create_statement(locator: &TableLocator, columns: &[String], replace: bool) -> String {
    let verb = if replace {
        "CREATE OR REPLACE TABLE"
    } else {
        "CREATE TABLE"
    };

    let fields = columns
        .iter()
        .map(|c| format!("{} {}", quote_identifier(c), TEXT_TYPE))
        .collect::<Vec<_>>()
        .join(",\n  ");

    format!(
        "{} {} (\n  {}\n);",
        verb,
        quote_identifier(&locator.to_string()),
        fields
    )
}

/// Wrap an identifier in backticks, escaping backslashes and backticks.
pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{}`", escaped)
}
