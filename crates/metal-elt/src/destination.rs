//! Destination policy
//!
//! Maps a [`RunConfiguration`] onto exactly one [`DestinationProfile`]. The
//! mapping is total and has no side effects, so the same configuration always
//! yields the same profile.

use serde::Serialize;
use std::path::PathBuf;

use crate::config::{DestinationKind, RunConfiguration, TargetEnvironment};
use crate::tables::SourceLayout;

pub const LOCAL_BUCKET_ROOT: &str = "s3://death-metal-raw";
pub const CLOUD_BUCKET_ROOT: &str = "gs://death-metal-raw-data";

pub const LOCAL_PIPELINE_NAME: &str = "death_metal_pipeline";
pub const CLOUD_PIPELINE_NAME: &str = "death_metal_pipeline_bq";

pub const LOCAL_SOURCE_NAME: &str = "death_metal_data";
pub const CLOUD_SOURCE_NAME: &str = "death_metal_data_bq";

const BIGQUERY_CONSOLE_URL: &str = "https://console.cloud.google.com/bigquery";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreKind {
    /// DuckDB database file
    LocalEmbedded { database_path: PathBuf },
    /// BigQuery project
    CloudWarehouse { project: String, location: String },
}

impl StoreKind {
    pub fn kind(&self) -> DestinationKind {
        match self {
            StoreKind::LocalEmbedded { .. } => DestinationKind::LocalEmbedded,
            StoreKind::CloudWarehouse { .. } => DestinationKind::CloudWarehouse,
        }
    }

    pub fn destination_name(&self) -> &'static str {
        match self {
            StoreKind::LocalEmbedded { .. } => "duckdb",
            StoreKind::CloudWarehouse { .. } => "bigquery",
        }
    }
}

/// Everything a run needs to know about where data comes from and goes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationProfile {
    pub pipeline_name: &'static str,
    pub source_name: &'static str,
    pub bucket_root: String,
    pub store_kind: StoreKind,
    pub dataset_name: String,
    /// Drop the whole dataset before loading
    pub reset_before_load: bool,
    pub use_explicit_schema: bool,
    pub source_layout: SourceLayout,
    #[serde(skip)]
    pub target_environment: TargetEnvironment,
}

impl DestinationProfile {
    pub fn destination_name(&self) -> &'static str {
        self.store_kind.destination_name()
    }

    pub fn project_id(&self) -> Option<&str> {
        match &self.store_kind {
            StoreKind::CloudWarehouse { project, .. } => Some(project),
            StoreKind::LocalEmbedded { .. } => None,
        }
    }

    pub fn console_url(&self) -> Option<String> {
        self.project_id()
            .map(|project| format!("{}?project={}", BIGQUERY_CONSOLE_URL, project))
    }
}

/// Pick the destination profile for a run
pub fn select_profile(config: &RunConfiguration) -> DestinationProfile {
    let dataset_name = config.dataset_name().to_string();

    match config.destination_kind {
        DestinationKind::LocalEmbedded => DestinationProfile {
            pipeline_name: LOCAL_PIPELINE_NAME,
            source_name: LOCAL_SOURCE_NAME,
            bucket_root: config
                .source_url
                .clone()
                .unwrap_or_else(|| LOCAL_BUCKET_ROOT.to_string()),
            store_kind: StoreKind::LocalEmbedded {
                database_path: config.duckdb_path.clone(),
            },
            dataset_name,
            reset_before_load: true,
            use_explicit_schema: config.use_explicit_schema,
            source_layout: config.source_layout.unwrap_or(SourceLayout::SingleFile),
            target_environment: config.target_environment,
        },
        DestinationKind::CloudWarehouse => DestinationProfile {
            pipeline_name: CLOUD_PIPELINE_NAME,
            source_name: CLOUD_SOURCE_NAME,
            bucket_root: config
                .source_url
                .clone()
                .unwrap_or_else(|| CLOUD_BUCKET_ROOT.to_string()),
            store_kind: StoreKind::CloudWarehouse {
                project: config.bigquery.project.clone(),
                location: config.bigquery.location.clone(),
            },
            dataset_name,
            reset_before_load: false,
            use_explicit_schema: true,
            source_layout: config.source_layout.unwrap_or(SourceLayout::Directory),
            target_environment: config.target_environment,
        },
    }
}
