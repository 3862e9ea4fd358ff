//! Error types for the load and transform stages
//!
//! Every failure carries the stage it happened in and, where it applies, the
//! table being processed, so the flow driver can log it with context before
//! reducing it to `ERROR`.

use thiserror::Error;

use crate::report::LoadResult;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required setting is missing or a setting has an invalid value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// dbt project or profile files are absent
    #[error("Not found: {0}")]
    SourceNotFound(String),

    /// Source files for a table are missing, unreadable or malformed
    #[error("Extraction failed for table '{table}': {message}")]
    Extraction { table: String, message: String },

    /// The destination rejected a table write
    #[error("Write failed for table '{table}': {message}")]
    DestinationWrite { table: String, message: String },

    /// Destination-level failure outside a table write (connect, reset, read)
    #[error("Destination error: {0}")]
    Destination(String),

    /// Object storage request failed
    #[error("Object storage error: {0}")]
    Storage(String),

    /// dbt invocation failed
    #[error("Transform step '{step}' failed: {message}")]
    Transform { step: String, message: String },

    /// A table failed and the rest of the run was skipped
    ///
    /// `results` holds one entry per table attempted, the failed one last.
    #[error("Run aborted at table '{table}': {source}")]
    RunAborted {
        table: String,
        results: Vec<LoadResult>,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn source_not_found(msg: impl Into<String>) -> Self {
        Self::SourceNotFound(msg.into())
    }

    pub fn extraction(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Extraction {
            table: table.into(),
            message: msg.into(),
        }
    }

    pub fn destination_write(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DestinationWrite {
            table: table.into(),
            message: msg.into(),
        }
    }

    pub fn destination(msg: impl Into<String>) -> Self {
        Self::Destination(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn transform(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transform {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Short stage label used as a structured log field
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::SourceNotFound(_) => "setup",
            Self::Extraction { .. } | Self::Storage(_) => "extract",
            Self::DestinationWrite { .. } | Self::Destination(_) => "load",
            Self::Transform { .. } => "transform",
            Self::RunAborted { source, .. } => source.stage(),
            Self::Io(_) => "io",
        }
    }

    /// Table the failure is attributed to, if any
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Extraction { table, .. }
            | Self::DestinationWrite { table, .. }
            | Self::RunAborted { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Per-table results collected before the run aborted
    pub fn partial_results(&self) -> &[LoadResult] {
        match self {
            Self::RunAborted { results, .. } => results,
            _ => &[],
        }
    }
}
