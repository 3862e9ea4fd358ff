//! Per-table results and the run summary printed after a load

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::verify::DuplicateReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Success,
    /// Loaded, but verification found a data-quality problem
    Warning,
    Failed,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStatus::Success => f.write_str("success"),
            LoadStatus::Warning => f.write_str("warning"),
            LoadStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub logical_name: String,
    pub row_count: u64,
    pub duplicate_primary_key_count: u64,
    pub status: LoadStatus,
}

impl LoadResult {
    pub fn success(logical_name: impl Into<String>, row_count: u64) -> Self {
        Self {
            logical_name: logical_name.into(),
            row_count,
            duplicate_primary_key_count: 0,
            status: LoadStatus::Success,
        }
    }

    pub fn failed(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            row_count: 0,
            duplicate_primary_key_count: 0,
            status: LoadStatus::Failed,
        }
    }
}

/// Summary of one completed load run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline_name: String,
    pub destination: String,
    pub dataset_name: String,
    pub results: Vec<LoadResult>,
    pub verification: Option<DuplicateReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn result(&self, logical_name: &str) -> Option<&LoadResult> {
        self.results.iter().find(|r| r.logical_name == logical_name)
    }

    pub fn total_rows(&self) -> u64 {
        self.results.iter().map(|r| r.row_count).sum()
    }

    pub fn has_warnings(&self) -> bool {
        self.results.iter().any(|r| r.status == LoadStatus::Warning)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.finished_at - self.started_at;

        writeln!(
            f,
            "Pipeline {} loaded {} rows into {} dataset '{}' in {:.2}s",
            self.pipeline_name,
            self.total_rows(),
            self.destination,
            self.dataset_name,
            elapsed.num_milliseconds() as f64 / 1000.0
        )?;
        writeln!(f, "{:<10} {:>10} {:>11}  status", "table", "rows", "duplicates")?;

        for result in &self.results {
            writeln!(
                f,
                "{:<10} {:>10} {:>11}  {}",
                result.logical_name,
                result.row_count,
                result.duplicate_primary_key_count,
                result.status
            )?;
        }

        match &self.verification {
            Some(report) if report.duplicate_primary_key_count > 0 => write!(
                f,
                "Verification: {} duplicate primary keys in '{}' ({} rows, {} distinct)",
                report.duplicate_primary_key_count,
                report.table,
                report.row_count,
                report.distinct_key_count
            ),
            Some(report) => write!(
                f,
                "Verification: no duplicates in '{}' ({} rows)",
                report.table, report.row_count
            ),
            None => write!(f, "Verification: skipped"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn report(verification: Option<DuplicateReport>) -> RunReport {
        let now = Utc::now();
        RunReport {
            pipeline_name: "death_metal_pipeline".to_string(),
            destination: "duckdb".to_string(),
            dataset_name: "metal_data".to_string(),
            results: vec![
                LoadResult {
                    duplicate_primary_key_count: 1,
                    status: LoadStatus::Warning,
                    ..LoadResult::success("bands", 4)
                },
                LoadResult::success("albums", 2),
                LoadResult::success("reviews", 0),
            ],
            verification,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_totals_and_lookup() {
        let report = report(None);
        assert_eq!(report.total_rows(), 6);
        assert!(report.has_warnings());
        assert_eq!(report.result("albums").unwrap().row_count, 2);
        assert!(report.result("labels").is_none());
    }

    #[test]
    fn test_display_lists_tables_in_order() {
        let text = report(Some(DuplicateReport {
            table: "bands".to_string(),
            row_count: 4,
            distinct_key_count: 3,
            duplicate_primary_key_count: 1,
            missing_key_count: 0,
            duplicated_keys: vec![("2".to_string(), 2)],
        }))
        .to_string();

        let bands = text.find("bands").unwrap();
        let albums = text.find("albums").unwrap();
        let reviews = text.find("reviews").unwrap();
        assert!(bands < albums && albums < reviews);
        assert!(text.contains("warning"));
        assert!(text.contains("1 duplicate primary keys in 'bands'"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(LoadResult::failed("albums")).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["row_count"], 0);
    }
}
