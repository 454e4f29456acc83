//! CSV source reading.
//!
//! Two entry points share one [`CsvSource`] description:
//!
//! - [`read_header`] streams only the bytes that make up the header record.
//! - [`read_rows`] reads the whole file with every column kept as text.
//!
//! Input is decoded with `encoding_rs` before it reaches the polars CSV
//! reader, so any WHATWG encoding label works. A byte-order mark matching the
//! encoding is always stripped.

use crate::error::{LoaderError, Result};
use encoding_rs::{DecoderResult, Encoding, UTF_8};
use polars::io::csv::read::{CsvParseOptions, CsvReadOptions};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default field delimiter.
pub const DEFAULT_DELIMITER: u8 = b';';

/// Default encoding label (UTF-8, BOM stripped).
pub const DEFAULT_ENCODING: &str = "utf-8-sig";

/// Bytes read per step while looking for the end of the header record.
const HEADER_CHUNK_SIZE: usize = 8 * 1024;

/// Where and how to read a delimited text file.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
    encoding: &'static Encoding,
}

impl CsvSource {
    /// Describe a file with the default delimiter and encoding.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: DEFAULT_DELIMITER,
            encoding: UTF_8,
        }
    }

    /// Set the field delimiter.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set the text encoding.
    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    fn read_error(&self, reason: impl ToString) -> LoaderError {
        LoaderError::csv_read(&self.path, reason)
    }

    /// Parse decoded text whose first record is the header.
    ///
    /// The header is read as a data row so blank and repeated names can be
    /// fixed up the same way for [`read_header`] and [`read_rows`].
    fn parse(&self, text: String) -> Result<DataFrame> {
        let raw = CsvReadOptions::default()
            .with_has_header(false)
            .with_infer_schema_length(Some(0))
            .with_parse_options(
                CsvParseOptions::default()
                    .with_separator(self.delimiter)
                    .with_quote_char(Some(b'"'))
                    .with_missing_is_null(true),
            )
            .into_reader_with_file_handle(Cursor::new(text.into_bytes()))
            .finish()
            .map_err(|e| self.read_error(e))?;

        let names = header_names(&raw).map_err(|e| self.read_error(e))?;
        let mut df = raw.slice(1, usize::MAX);
        df.set_column_names(names).map_err(|e| self.read_error(e))?;
        Ok(df)
    }
}

/// Look up an encoding by label.
///
/// Accepts every WHATWG label known to `encoding_rs` plus `utf-8-sig` /
/// `utf8-sig`, which name UTF-8 with BOM removal.
pub fn resolve_encoding(label: &str) -> Option<&'static Encoding> {
    let label = label.trim().to_ascii_lowercase();
    match label.as_str() {
        "utf-8-sig" | "utf8-sig" | "utf_8_sig" => Some(UTF_8),
        other => Encoding::for_label(other.as_bytes())
            .or_else(|| Encoding::for_label(other.replace('_', "-").as_bytes())),
    }
}

/// Parse a delimiter argument into a single byte.
///
/// The two-character escape `\t` is accepted for tab.
pub fn parse_delimiter(value: &str) -> Option<u8> {
    match value {
        "\\t" => Some(b'\t'),
        _ => match value.as_bytes() {
            [byte] if byte.is_ascii() && *byte != b'"' && *byte != b'\n' && *byte != b'\r' => {
                Some(*byte)
            }
            _ => None,
        },
    }
}

/// Read the ordered column names of a CSV file without loading its rows.
pub fn read_header(source: &CsvSource) -> Result<Vec<String>> {
    let mut file = File::open(&source.path).map_err(|e| source.read_error(e))?;

    let mut decoder = source.encoding.new_decoder_with_bom_removal();
    let mut text = String::new();
    let mut chunk = vec![0u8; HEADER_CHUNK_SIZE];

    loop {
        let read = file.read(&mut chunk).map_err(|e| source.read_error(e))?;
        let last = read == 0;
        let mut input = &chunk[..read];
        let mut malformed = false;

        // Decoding stops at the first malformed sequence; it only matters if
        // the header record has not ended before it.
        loop {
            if let Some(needed) =
                decoder.max_utf8_buffer_length_without_replacement(input.len())
            {
                text.reserve(needed);
            }
            let (result, consumed) =
                decoder.decode_to_string_without_replacement(input, &mut text, last);
            input = &input[consumed..];
            match result {
                DecoderResult::InputEmpty => break,
                DecoderResult::OutputFull => continue,
                DecoderResult::Malformed(..) => {
                    malformed = true;
                    break;
                }
            }
        }

        if let Some(end) = header_record_end(&text) {
            text.truncate(end);
            break;
        }
        if malformed {
            return Err(source.read_error(format!(
                "header is not valid {}",
                source.encoding.name()
            )));
        }
        if last {
            break;
        }
    }

    let header = text.trim_end_matches(['\r', '\n']).to_string();
    if header.trim().is_empty() {
        return Err(source.read_error("file has no header row"));
    }
    debug!("Header record: {:?}", header);

    let df = source.parse(header)?;
    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    if columns.is_empty() {
        return Err(source.read_error("header row has no columns"));
    }

    Ok(columns)
}

/// Read every data row of a CSV file, keeping all columns as text.
///
/// Empty fields become null.
pub fn read_rows(source: &CsvSource) -> Result<DataFrame> {
    let bytes = std::fs::read(&source.path).map_err(|e| source.read_error(e))?;

    let (text, had_errors) = source.encoding.decode_with_bom_removal(&bytes);
    if had_errors {
        return Err(source.read_error(format!(
            "content is not valid {}",
            source.encoding.name()
        )));
    }

    let df = source.parse(text.into_owned())?;
    debug!("Read {} rows x {} columns", df.height(), df.width());
    Ok(df)
}

/// Column names from the first row of a header-less parse.
///
/// A blank name becomes `Unnamed: <index>` and a repeated one gets a `.<n>`
/// suffix, so the result is always non-empty and distinct.
fn header_names(raw: &DataFrame) -> PolarsResult<Vec<String>> {
    let mut taken = HashSet::with_capacity(raw.width());
    let mut names = Vec::with_capacity(raw.width());

    for (idx, column) in raw.get_columns().iter().enumerate() {
        let name = column
            .as_materialized_series()
            .str()?
            .get(0)
            .filter(|name| !name.is_empty())
            .map_or_else(|| format!("Unnamed: {idx}"), str::to_string);
        names.push(unique_name(name, &mut taken));
    }

    Ok(names)
}

fn unique_name(name: String, taken: &mut HashSet<String>) -> String {
    let mut candidate = name.clone();
    let mut n = 1;
    while taken.contains(&candidate) {
        candidate = format!("{name}.{n}");
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

/// Byte offset of the newline that ends the first record, ignoring newlines
/// inside quoted fields.
fn header_record_end(text: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, ch) in text.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\n' if !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}
