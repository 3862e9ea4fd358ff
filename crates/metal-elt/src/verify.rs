//! Post-load duplicate key check
//!
//! Advisory only: duplicates turn the table's result into a warning and are
//! logged, but never fail, retry or roll back the run.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::data::TableData;
use crate::report::{LoadResult, LoadStatus};
use crate::store::Destination;
use crate::tables::TableDescriptor;

/// How many of the most repeated keys to keep for the log
const TOP_DUPLICATES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateReport {
    pub table: String,
    pub row_count: u64,
    /// Distinct non-null key values
    pub distinct_key_count: u64,
    /// `row_count - distinct_key_count`; rows without a key count as duplicates
    pub duplicate_primary_key_count: u64,
    pub missing_key_count: u64,
    /// Most repeated keys with their occurrence count
    pub duplicated_keys: Vec<(String, u64)>,
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Count rows and distinct primary keys in already loaded data
pub fn check_duplicates(table: &str, data: &TableData, primary_key: &str) -> DuplicateReport {
    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut missing = 0u64;

    match data.column_values(primary_key) {
        Some(values) => {
            for value in values {
                match key_of(value) {
                    Some(key) => *counts.entry(key).or_default() += 1,
                    None => missing += 1,
                }
            }
        },
        None => missing = data.row_count(),
    }

    let row_count = data.row_count();
    let distinct = counts.len() as u64;

    let mut duplicated: Vec<(String, u64)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
    duplicated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    duplicated.truncate(TOP_DUPLICATES);

    DuplicateReport {
        table: table.to_string(),
        row_count,
        distinct_key_count: distinct,
        duplicate_primary_key_count: row_count.saturating_sub(distinct),
        missing_key_count: missing,
        duplicated_keys: duplicated,
    }
}

/// Read a table back and check it; read failures are logged and yield `None`
pub async fn verify(destination: &dyn Destination, table: &TableDescriptor) -> Option<DuplicateReport> {
    let data = match destination.read_table(table.logical_name).await {
        Ok(data) => data,
        Err(e) => {
            warn!(table = table.logical_name, error = %e, "Could not read table back for verification");
            return None;
        },
    };

    let report = check_duplicates(table.logical_name, &data, table.primary_key);
    info!(
        table = table.logical_name,
        rows = report.row_count,
        distinct = report.distinct_key_count,
        "Verified primary key uniqueness"
    );

    if report.duplicate_primary_key_count > 0 {
        warn!(
            table = table.logical_name,
            duplicates = report.duplicate_primary_key_count,
            missing_keys = report.missing_key_count,
            "Duplicate primary keys found: {:?}",
            report.duplicated_keys
        );
    }

    Some(report)
}

/// Record a report on the matching result
pub fn apply(results: &mut [LoadResult], report: &DuplicateReport) {
    if let Some(result) = results.iter_mut().find(|r| r.logical_name == report.table) {
        result.duplicate_primary_key_count = report.duplicate_primary_key_count;
        if report.duplicate_primary_key_count > 0 && result.status == LoadStatus::Success {
            result.status = LoadStatus::Warning;
        }
    }
}
