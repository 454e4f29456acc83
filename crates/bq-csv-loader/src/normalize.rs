//! Reconciliation of CSV rows with the live table's column set.
//!
//! The destination schema is all text, so there is no type checking here:
//! normalization is column presence and order plus null-sentinel folding.

use crate::error::{Result, ResultExt};
use polars::prelude::*;
use serde_json::{Map, Value};
use std::io::Write;
use tracing::debug;

/// Text values that mean "no value" once cast to text, compared ignoring ASCII case.
pub const NULL_SENTINELS: [&str; 2] = ["nan", "none"];

/// Check whether a text value is a null sentinel.
#[inline]
pub fn is_null_sentinel(value: &str) -> bool {
    NULL_SENTINELS.iter().any(|s| value.eq_ignore_ascii_case(s))
}

/// Rows shaped exactly like the destination table: one `String` column per
/// warehouse column, in warehouse order.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    columns: Vec<String>,
    frame: DataFrame,
}

impl NormalizedFrame {
    /// Warehouse column names, in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    /// The underlying frame.
    pub fn as_frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    /// Iterate over the rows.
    pub fn rows(&self) -> Result<Vec<NormalizedRow<'_>>> {
        let series: Vec<&StringChunked> = self
            .frame
            .get_columns()
            .iter()
            .map(|c| c.as_materialized_series().str())
            .collect::<PolarsResult<_>>()
            .context("Reading normalized columns")?;

        let rows = (0..self.frame.height())
            .map(|idx| NormalizedRow {
                columns: &self.columns,
                values: series.iter().map(|s| s.get(idx)).collect(),
            })
            .collect();

        Ok(rows)
    }

    /// Write the rows as newline-delimited JSON objects keyed by column name,
    /// nulls as JSON `null`. Key order is not significant.
    pub fn write_json_lines<W: Write>(&self, writer: &mut W) -> Result<()> {
        for row in self.rows()? {
            serde_json::to_writer(&mut *writer, &row.to_json())?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// One normalized row: every warehouse column mapped to text or null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow<'a> {
    columns: &'a [String],
    values: Vec<Option<&'a str>>,
}

impl<'a> NormalizedRow<'a> {
    /// Value of a column; `None` if the column is not part of the row,
    /// `Some(None)` if the value is null.
    pub fn get(&self, column: &str) -> Option<Option<&'a str>> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| self.values[idx])
    }

    /// Column/value pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, Option<&'a str>)> + '_ {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn to_json(&self) -> Map<String, Value> {
        // BigQuery matches JSON keys by name.
        self.iter()
            .map(|(column, value)| {
                let value = value.map_or(Value::Null, |v| Value::String(v.to_string()));
                (column.to_string(), value)
            })
            .collect()
    }
}

/// Project `raw` onto `target_columns`.
///
/// 1. Target columns missing from `raw` are added as all-null.
/// 2. Columns are reordered to `target_columns`; others are dropped.
/// 3. Every value is cast to text.
/// 4. Values matching a [`NULL_SENTINELS`] entry become null.
pub fn normalize(raw: &DataFrame, target_columns: &[String]) -> Result<NormalizedFrame> {
    let height = raw.height();
    let mut columns: Vec<Column> = Vec::with_capacity(target_columns.len());

    let dropped: Vec<String> = raw
        .get_column_names()
        .into_iter()
        .filter(|name| !target_columns.iter().any(|t| t.as_str() == name.as_str()))
        .map(|name| name.to_string())
        .collect();
    if !dropped.is_empty() {
        debug!("Dropping columns not in destination table: {:?}", dropped);
    }

    for name in target_columns {
        let series = match raw.column(name) {
            Ok(col) => col
                .as_materialized_series()
                .cast(&DataType::String)
                .context(format!("Casting column '{}' to text", name))?,
            Err(_) => {
                debug!("Column '{}' missing from CSV, filling with nulls", name);
                Series::full_null(name.as_str().into(), height, &DataType::String)
            }
        };

        columns.push(fold_null_sentinels(&series)?.into_column());
    }

    let frame = DataFrame::new(columns).context("Building normalized frame")?;

    Ok(NormalizedFrame {
        columns: target_columns.to_vec(),
        frame,
    })
}

/// Replace null-sentinel strings in a text series with null.
fn fold_null_sentinels(series: &Series) -> Result<Series> {
    let str_series = series.str().context("Reading text column")?;
    let mut folded: Vec<Option<&str>> = Vec::with_capacity(str_series.len());

    for opt_val in str_series.into_iter() {
        match opt_val {
            Some(val) if is_null_sentinel(val) => folded.push(None),
            other => folded.push(other),
        }
    }

    Ok(Series::new(series.name().clone(), folded))
}
