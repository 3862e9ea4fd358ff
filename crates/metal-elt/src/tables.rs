//! Table extraction descriptors
//!
//! The three logical tables, their source locations relative to the bucket
//! root, primary keys and explicit column types. Extraction itself lives in
//! [`crate::source`]; this module only supplies the parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Column type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Text,
    Float,
}

impl DataType {
    pub fn duckdb_type(self) -> &'static str {
        match self {
            DataType::Integer => "BIGINT",
            DataType::Text => "VARCHAR",
            DataType::Float => "DOUBLE",
        }
    }

    pub fn bigquery_type(self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Text => "STRING",
            DataType::Float => "FLOAT",
        }
    }

    /// Map a type name reported by either destination back to a tag
    pub fn from_sql_type(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        match upper.as_str() {
            "BIGINT" | "INTEGER" | "INT" | "INT64" | "SMALLINT" | "TINYINT" | "HUGEINT"
            | "UBIGINT" | "UINTEGER" => DataType::Integer,
            "DOUBLE" | "FLOAT" | "FLOAT64" | "REAL" | "NUMERIC" => DataType::Float,
            other if other.starts_with("DECIMAL") => DataType::Float,
            _ => DataType::Text,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "integer",
            DataType::Text => "text",
            DataType::Float => "float",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub data_type: DataType,
}

const fn col(name: &'static str, data_type: DataType) -> ColumnDef {
    ColumnDef { name, data_type }
}

/// How a table's CSV files are laid out under the bucket root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayout {
    /// `<root>/<table>.csv`
    #[default]
    SingleFile,
    /// `<root>/<table>/*.csv`
    Directory,
}

impl FromStr for SourceLayout {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" | "single_file" | "file" => Ok(SourceLayout::SingleFile),
            "directory" | "dir" => Ok(SourceLayout::Directory),
            other => Err(PipelineError::configuration(format!(
                "Invalid source layout '{}', expected 'single' or 'directory'",
                other
            ))),
        }
    }
}

impl fmt::Display for SourceLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLayout::SingleFile => f.write_str("single"),
            SourceLayout::Directory => f.write_str("directory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub logical_name: &'static str,
    pub primary_key: &'static str,
    pub column_schema: Option<&'static [ColumnDef]>,
}

impl TableDescriptor {
    /// Glob relative to the bucket root
    pub fn source_pattern(&self, layout: SourceLayout) -> String {
        match layout {
            SourceLayout::SingleFile => format!("{}.csv", self.logical_name),
            SourceLayout::Directory => format!("{}/*.csv", self.logical_name),
        }
    }

    /// Fully resolved source location, for logs and error messages
    pub fn source_path(&self, bucket_root: &str, layout: SourceLayout) -> String {
        format!(
            "{}/{}",
            bucket_root.trim_end_matches('/'),
            self.source_pattern(layout)
        )
    }

    /// Column types to enforce, or `None` to let extraction infer them
    pub fn schema_for(&self, explicit: bool) -> Option<&'static [ColumnDef]> {
        if explicit {
            self.column_schema
        } else {
            None
        }
    }
}

const BANDS_SCHEMA: &[ColumnDef] = &[
    col("id", DataType::Integer),
    col("name", DataType::Text),
    col("country", DataType::Text),
    col("status", DataType::Text),
    col("formed_in", DataType::Integer),
    col("genre", DataType::Text),
    col("theme", DataType::Text),
    col("active", DataType::Text),
];

const ALBUMS_SCHEMA: &[ColumnDef] = &[
    col("id", DataType::Integer),
    col("band", DataType::Integer),
    col("title", DataType::Text),
    col("year", DataType::Integer),
];

const REVIEWS_SCHEMA: &[ColumnDef] = &[
    col("id", DataType::Integer),
    col("album", DataType::Integer),
    col("title", DataType::Text),
    col("score", DataType::Float),
    col("content", DataType::Text),
];

pub const BANDS: TableDescriptor = TableDescriptor {
    logical_name: "bands",
    primary_key: "id",
    column_schema: Some(BANDS_SCHEMA),
};

pub const ALBUMS: TableDescriptor = TableDescriptor {
    logical_name: "albums",
    primary_key: "id",
    column_schema: Some(ALBUMS_SCHEMA),
};

pub const REVIEWS: TableDescriptor = TableDescriptor {
    logical_name: "reviews",
    primary_key: "id",
    column_schema: Some(REVIEWS_SCHEMA),
};

/// Load order; the verifier depends on `bands` coming first
pub const TABLES: [TableDescriptor; 3] = [BANDS, ALBUMS, REVIEWS];

/// Table read back after a run to check for duplicate keys
pub const PRIMARY_TABLE: TableDescriptor = BANDS;
