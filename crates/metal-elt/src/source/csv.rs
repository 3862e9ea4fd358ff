//! CSV decoding and column typing
//!
//! With an explicit schema, listed columns are converted to their declared
//! type and a value that does not convert is an extraction error. Without
//! one, each column is typed by what all of its non-empty cells parse as:
//! integer, then float, then text. Empty cells are always null.

use globset::GlobBuilder;
use serde_json::{Number, Value};

use crate::data::{Column, TableData};
use crate::error::{PipelineError, Result};
use crate::tables::{ColumnDef, DataType};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Keys matching `pattern`, sorted so multi-file tables load deterministically
pub fn matching_keys(table: &str, keys: &[String], pattern: &str) -> Result<Vec<String>> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| PipelineError::extraction(table, format!("Invalid glob '{}': {}", pattern, e)))?
        .compile_matcher();

    let mut matched: Vec<String> = keys
        .iter()
        .filter(|key| matcher.is_match(key.as_str()))
        .cloned()
        .collect();
    matched.sort();
    matched.dedup();

    Ok(matched)
}

/// Accumulates raw cells from one or more files of the same table
pub struct CsvTableReader {
    table: String,
    headers: Option<Vec<String>>,
    first_file: Option<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl CsvTableReader {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            headers: None,
            first_file: None,
            rows: Vec::new(),
        }
    }

    /// Append one file; its header must match earlier files
    pub fn add_file(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(());
        }

        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| self.error(format!("Failed to read header of {}: {}", key, e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        if let Some(existing) = &self.headers {
            if *existing != headers {
                return Err(self.error(format!(
                    "Header of {} ({}) differs from {} ({})",
                    key,
                    headers.join(","),
                    self.first_file.as_deref().unwrap_or("the first file"),
                    existing.join(",")
                )));
            }
        } else {
            self.headers = Some(headers);
            self.first_file = Some(key.to_string());
        }

        for record in reader.records() {
            let record = record.map_err(|e| self.error(format!("Malformed row in {}: {}", key, e)))?;
            let row = record
                .iter()
                .map(|cell| {
                    let cell = cell.trim();
                    (!cell.is_empty()).then(|| cell.to_string())
                })
                .collect();
            self.rows.push(row);
        }

        Ok(())
    }

    /// Whether any file so far carried a header row
    pub fn has_header(&self) -> bool {
        self.headers.is_some()
    }

    /// Type the collected cells
    ///
    /// Header columns keep their order; schema columns absent from the files
    /// are appended and filled with nulls.
    pub fn finish(self, schema: Option<&[ColumnDef]>) -> Result<TableData> {
        let headers = self.headers.clone().unwrap_or_default();
        let mut columns: Vec<Column> = Vec::with_capacity(headers.len());

        for (idx, name) in headers.iter().enumerate() {
            let declared = schema.and_then(|s| s.iter().find(|c| c.name == name.as_str()));
            let data_type = match declared {
                Some(def) => def.data_type,
                None => infer_type(self.rows.iter().map(|row| row[idx].as_deref())),
            };
            columns.push(Column::new(name.clone(), data_type));
        }

        let missing: Vec<&ColumnDef> = schema
            .unwrap_or_default()
            .iter()
            .filter(|def| !headers.iter().any(|h| h == def.name))
            .collect();
        for def in &missing {
            columns.push(Column::new(def.name, def.data_type));
        }

        let mut data = TableData::new(columns);
        for (row_idx, raw) in self.rows.iter().enumerate() {
            let mut row = Vec::with_capacity(data.columns.len());
            for (idx, cell) in raw.iter().enumerate() {
                let column = &data.columns[idx];
                row.push(self.convert(cell.as_deref(), column, row_idx + 1)?);
            }
            row.extend(missing.iter().map(|_| Value::Null));
            data.rows.push(row);
        }

        Ok(data)
    }

    fn convert(&self, cell: Option<&str>, column: &Column, row: usize) -> Result<Value> {
        let Some(cell) = cell else {
            return Ok(Value::Null);
        };

        match column.data_type {
            DataType::Text => Ok(Value::String(cell.to_string())),
            DataType::Integer => cell.parse::<i64>().map(Value::from).map_err(|_| {
                self.error(format!(
                    "Row {}: '{}' in column '{}' is not an integer",
                    row, cell, column.name
                ))
            }),
            DataType::Float => cell
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| {
                    self.error(format!(
                        "Row {}: '{}' in column '{}' is not a finite number",
                        row, cell, column.name
                    ))
                }),
        }
    }

    fn error(&self, msg: String) -> PipelineError {
        PipelineError::extraction(self.table.clone(), msg)
    }
}

/// Empty table with the declared columns, for sources without a header
pub fn declared_table(schema: &[ColumnDef]) -> TableData {
    TableData::new(
        schema
            .iter()
            .map(|def| Column::new(def.name, def.data_type))
            .collect(),
    )
}

fn infer_type<'a>(cells: impl Iterator<Item = Option<&'a str>>) -> DataType {
    let mut present = cells.flatten().peekable();
    if present.peek().is_none() {
        return DataType::Text;
    }

    let values: Vec<&str> = present.collect();
    if values.iter().all(|v| v.parse::<i64>().is_ok()) {
        DataType::Integer
    } else if values
        .iter()
        .all(|v| v.parse::<f64>().map(f64::is_finite).unwrap_or(false))
    {
        DataType::Float
    } else {
        DataType::Text
    }
}
