//! Run configuration
//!
//! The environment is snapshotted once into a map and parsed by pure
//! functions, so every component sees the same values for the whole run.
//! Writing resolved defaults back into the process environment (for dbt) is a
//! separate, explicit call: [`export_defaults`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::tables::SourceLayout;

pub const ENV_USE_BIGQUERY: &str = "DBT_USE_BIGQUERY";
pub const ENV_TARGET: &str = "DBT_TARGET";
pub const ENV_DUCKDB_SCHEMA: &str = "DBT_DUCKDB_SCHEMA";
pub const ENV_DUCKDB_PATH: &str = "DBT_DUCKDB_PATH";
pub const ENV_BIGQUERY_PROJECT: &str = "DBT_BIGQUERY_PROJECT";
pub const ENV_BIGQUERY_PROD_DATASET: &str = "DBT_BIGQUERY_PROD_DATASET";
pub const ENV_BIGQUERY_DEV_DATASET: &str = "DBT_BIGQUERY_DEV_DATASET";
pub const ENV_BIGQUERY_LOCATION: &str = "DBT_BIGQUERY_LOCATION";
pub const ENV_EXPLICIT_SCHEMA: &str = "METAL_EXPLICIT_SCHEMA";
pub const ENV_SOURCE_URL: &str = "METAL_SOURCE_URL";
pub const ENV_SOURCE_LAYOUT: &str = "METAL_SOURCE_LAYOUT";
pub const ENV_ACCESS_TOKEN: &str = "METAL_ACCESS_TOKEN";
pub const ENV_GOOGLE_ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const ENV_BIGQUERY_API_URL: &str = "BIGQUERY_API_URL";
pub const ENV_GCS_API_URL: &str = "GCS_API_URL";

pub const DEFAULT_TARGET: &str = "dev";
pub const DEFAULT_USE_BIGQUERY: &str = "false";
pub const DEFAULT_DUCKDB_SCHEMA: &str = "metal_data";
pub const DEFAULT_DUCKDB_PATH: &str = "death_metal_pipeline.duckdb";
pub const DEFAULT_BIGQUERY_PROJECT: &str = "dw-bigquery-462900";
pub const DEFAULT_BIGQUERY_PROD_DATASET: &str = "death_metal_analytics";
pub const DEFAULT_BIGQUERY_DEV_DATASET: &str = "death_metal_analytics_dev";
pub const DEFAULT_BIGQUERY_LOCATION: &str = "US";
pub const DEFAULT_BIGQUERY_API_URL: &str = "https://bigquery.googleapis.com";
pub const DEFAULT_GCS_API_URL: &str = "https://storage.googleapis.com";
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Variables that must be present; empty for now
pub const REQUIRED_VARS: &[&str] = &[];

/// Defaults exported to the process environment before dbt runs
pub const OPTIONAL_DEFAULTS: &[(&str, &str)] = &[
    (ENV_USE_BIGQUERY, DEFAULT_USE_BIGQUERY),
    (ENV_TARGET, DEFAULT_TARGET),
    (ENV_DUCKDB_SCHEMA, DEFAULT_DUCKDB_SCHEMA),
];

/// Point-in-time copy of the environment
pub type EnvSnapshot = HashMap<String, String>;

pub fn snapshot_env() -> EnvSnapshot {
    std::env::vars().collect()
}

/// Non-empty value of a variable
pub(crate) fn lookup<'a>(vars: &'a EnvSnapshot, name: &str) -> Option<&'a str> {
    vars.get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// `true` only for a case-insensitive "true"; anything else is false
pub(crate) fn parse_flag(value: Option<&str>) -> bool {
    value.map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationKind {
    #[default]
    LocalEmbedded,
    CloudWarehouse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetEnvironment {
    #[default]
    Dev,
    Prod,
}

impl TargetEnvironment {
    /// Only the exact target name `prod` selects production
    pub fn from_target(target: &str) -> Self {
        if target.trim() == "prod" {
            TargetEnvironment::Prod
        } else {
            TargetEnvironment::Dev
        }
    }
}

impl fmt::Display for TargetEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetEnvironment::Dev => f.write_str("dev"),
            TargetEnvironment::Prod => f.write_str("prod"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigQuerySettings {
    pub project: String,
    pub prod_dataset: String,
    pub dev_dataset: String,
    pub location: String,
}

impl Default for BigQuerySettings {
    fn default() -> Self {
        Self {
            project: DEFAULT_BIGQUERY_PROJECT.to_string(),
            prod_dataset: DEFAULT_BIGQUERY_PROD_DATASET.to_string(),
            dev_dataset: DEFAULT_BIGQUERY_DEV_DATASET.to_string(),
            location: DEFAULT_BIGQUERY_LOCATION.to_string(),
        }
    }
}

/// S3-compatible object storage settings
#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl S3Settings {
    pub fn from_vars(vars: &EnvSnapshot) -> Self {
        Self {
            endpoint: lookup(vars, "S3_ENDPOINT").map(String::from),
            region: lookup(vars, "S3_REGION")
                .or_else(|| lookup(vars, "AWS_REGION"))
                .unwrap_or(DEFAULT_S3_REGION)
                .to_string(),
            access_key: lookup(vars, "S3_ACCESS_KEY")
                .or_else(|| lookup(vars, "AWS_ACCESS_KEY_ID"))
                .map(String::from),
            secret_key: lookup(vars, "S3_SECRET_KEY")
                .or_else(|| lookup(vars, "AWS_SECRET_ACCESS_KEY"))
                .map(String::from),
            path_style: parse_flag(lookup(vars, "S3_PATH_STYLE")),
        }
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "***"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

/// Endpoints and credentials for sources and destinations
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub s3: S3Settings,
    pub gcs_api_url: String,
    pub bigquery_api_url: String,
    /// OAuth bearer token for GCS and BigQuery
    pub access_token: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            s3: S3Settings::default(),
            gcs_api_url: DEFAULT_GCS_API_URL.to_string(),
            bigquery_api_url: DEFAULT_BIGQUERY_API_URL.to_string(),
            access_token: None,
        }
    }
}

impl ConnectionSettings {
    pub fn from_vars(vars: &EnvSnapshot) -> Self {
        Self {
            s3: S3Settings::from_vars(vars),
            gcs_api_url: lookup(vars, ENV_GCS_API_URL)
                .unwrap_or(DEFAULT_GCS_API_URL)
                .trim_end_matches('/')
                .to_string(),
            bigquery_api_url: lookup(vars, ENV_BIGQUERY_API_URL)
                .unwrap_or(DEFAULT_BIGQUERY_API_URL)
                .trim_end_matches('/')
                .to_string(),
            access_token: lookup(vars, ENV_ACCESS_TOKEN)
                .or_else(|| lookup(vars, ENV_GOOGLE_ACCESS_TOKEN))
                .map(String::from),
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("s3", &self.s3)
            .field("gcs_api_url", &self.gcs_api_url)
            .field("bigquery_api_url", &self.bigquery_api_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Immutable settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub destination_kind: DestinationKind,
    pub target_environment: TargetEnvironment,
    /// Raw `DBT_TARGET`, handed to dbt unchanged
    pub target_name: String,
    pub duckdb_schema: String,
    pub duckdb_path: PathBuf,
    pub bigquery: BigQuerySettings,
    pub use_explicit_schema: bool,
    pub source_url: Option<String>,
    pub source_layout: Option<SourceLayout>,
    pub connection: ConnectionSettings,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            destination_kind: DestinationKind::default(),
            target_environment: TargetEnvironment::default(),
            target_name: DEFAULT_TARGET.to_string(),
            duckdb_schema: DEFAULT_DUCKDB_SCHEMA.to_string(),
            duckdb_path: PathBuf::from(DEFAULT_DUCKDB_PATH),
            bigquery: BigQuerySettings::default(),
            use_explicit_schema: false,
            source_url: None,
            source_layout: None,
            connection: ConnectionSettings::default(),
        }
    }
}

impl RunConfiguration {
    /// Snapshot the process environment and parse it
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&snapshot_env())
    }

    pub fn from_vars(vars: &EnvSnapshot) -> Result<Self> {
        check_required(vars, REQUIRED_VARS)?;

        let destination_kind = if parse_flag(lookup(vars, ENV_USE_BIGQUERY)) {
            DestinationKind::CloudWarehouse
        } else {
            DestinationKind::LocalEmbedded
        };
        let target_name = lookup(vars, ENV_TARGET).unwrap_or(DEFAULT_TARGET).to_string();
        let source_layout = lookup(vars, ENV_SOURCE_LAYOUT)
            .map(str::parse::<SourceLayout>)
            .transpose()?;

        let bigquery = BigQuerySettings {
            project: lookup(vars, ENV_BIGQUERY_PROJECT)
                .unwrap_or(DEFAULT_BIGQUERY_PROJECT)
                .to_string(),
            prod_dataset: lookup(vars, ENV_BIGQUERY_PROD_DATASET)
                .unwrap_or(DEFAULT_BIGQUERY_PROD_DATASET)
                .to_string(),
            dev_dataset: lookup(vars, ENV_BIGQUERY_DEV_DATASET)
                .unwrap_or(DEFAULT_BIGQUERY_DEV_DATASET)
                .to_string(),
            location: lookup(vars, ENV_BIGQUERY_LOCATION)
                .unwrap_or(DEFAULT_BIGQUERY_LOCATION)
                .to_string(),
        };

        Ok(Self {
            destination_kind,
            target_environment: TargetEnvironment::from_target(&target_name),
            target_name,
            duckdb_schema: lookup(vars, ENV_DUCKDB_SCHEMA)
                .unwrap_or(DEFAULT_DUCKDB_SCHEMA)
                .to_string(),
            duckdb_path: PathBuf::from(lookup(vars, ENV_DUCKDB_PATH).unwrap_or(DEFAULT_DUCKDB_PATH)),
            bigquery,
            use_explicit_schema: parse_flag(lookup(vars, ENV_EXPLICIT_SCHEMA)),
            source_url: lookup(vars, ENV_SOURCE_URL).map(String::from),
            source_layout,
            connection: ConnectionSettings::from_vars(vars),
        })
    }

    pub fn use_bigquery(&self) -> bool {
        self.destination_kind == DestinationKind::CloudWarehouse
    }

    /// Dataset (schema) this run writes to
    pub fn dataset_name(&self) -> &str {
        match (self.destination_kind, self.target_environment) {
            (DestinationKind::LocalEmbedded, _) => &self.duckdb_schema,
            (DestinationKind::CloudWarehouse, TargetEnvironment::Prod) => &self.bigquery.prod_dataset,
            (DestinationKind::CloudWarehouse, TargetEnvironment::Dev) => &self.bigquery.dev_dataset,
        }
    }
}

/// Fail with every missing name at once
pub fn check_required(vars: &EnvSnapshot, required: &[&str]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| lookup(vars, name).is_none())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::configuration(format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        )))
    }
}

/// Write [`OPTIONAL_DEFAULTS`] into the process environment where unset
///
/// Returns the variables that were set.
pub fn export_defaults() -> Vec<(&'static str, &'static str)> {
    let mut applied = Vec::new();

    for &(name, default) in OPTIONAL_DEFAULTS {
        let unset = std::env::var(name).map(|v| v.trim().is_empty()).unwrap_or(true);
        if unset {
            std::env::set_var(name, default);
            info!("Configured {}={}", name, default);
            applied.push((name, default));
        }
    }

    applied
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn vars(pairs: &[(&str, &str)]) -> EnvSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = RunConfiguration::from_vars(&EnvSnapshot::new()).unwrap();
        assert_eq!(config.destination_kind, DestinationKind::LocalEmbedded);
        assert_eq!(config.target_environment, TargetEnvironment::Dev);
        assert_eq!(config.target_name, "dev");
        assert_eq!(config.dataset_name(), "metal_data");
        assert!(!config.use_explicit_schema);
        assert_eq!(config.duckdb_path, PathBuf::from("death_metal_pipeline.duckdb"));
        assert_eq!(config, RunConfiguration::default());
    }

    #[test]
    fn test_flag_parsing_is_lenient() {
        let config = RunConfiguration::from_vars(&vars(&[(ENV_USE_BIGQUERY, "TRUE")])).unwrap();
        assert!(config.use_bigquery());

        for value in ["1", "yes", "false", ""] {
            let config = RunConfiguration::from_vars(&vars(&[(ENV_USE_BIGQUERY, value)])).unwrap();
            assert!(!config.use_bigquery(), "{value} should not enable BigQuery");
        }
    }

    #[test]
    fn test_unknown_target_counts_as_dev() {
        let config = RunConfiguration::from_vars(&vars(&[
            (ENV_USE_BIGQUERY, "true"),
            (ENV_TARGET, "staging"),
        ]))
        .unwrap();
        assert_eq!(config.target_environment, TargetEnvironment::Dev);
        assert_eq!(config.target_name, "staging");
        assert_eq!(config.dataset_name(), "death_metal_analytics_dev");
    }

    #[test]
    fn test_prod_dataset_override() {
        let config = RunConfiguration::from_vars(&vars(&[
            (ENV_USE_BIGQUERY, "true"),
            (ENV_TARGET, "prod"),
            (ENV_BIGQUERY_PROD_DATASET, "metal_gold"),
        ]))
        .unwrap();
        assert_eq!(config.dataset_name(), "metal_gold");
    }

    #[test]
    fn test_duckdb_schema_override() {
        let config =
            RunConfiguration::from_vars(&vars(&[(ENV_DUCKDB_SCHEMA, "metal_raw")])).unwrap();
        assert_eq!(config.dataset_name(), "metal_raw");
    }

    #[test]
    fn test_malformed_layout_is_configuration_error() {
        let result = RunConfiguration::from_vars(&vars(&[(ENV_SOURCE_LAYOUT, "zip")]));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_check_required_lists_missing() {
        let err = check_required(&vars(&[("A", "1"), ("B", " ")]), &["A", "B", "C"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required environment variables: B, C"
        );
    }

    #[test]
    fn test_connection_settings_redacted() {
        let settings = ConnectionSettings::from_vars(&vars(&[
            ("AWS_ACCESS_KEY_ID", "AKIA"),
            ("S3_SECRET_KEY", "hunter2"),
            (ENV_GOOGLE_ACCESS_TOKEN, "ya29.token"),
            (ENV_BIGQUERY_API_URL, "http://localhost:9050/"),
        ]));
        assert_eq!(settings.s3.access_key.as_deref(), Some("AKIA"));
        assert_eq!(settings.bigquery_api_url, "http://localhost:9050");

        let debug = format!("{:?}", settings);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("ya29.token"));
    }

    #[test]
    #[serial]
    fn test_export_defaults_keeps_existing_values() {
        std::env::set_var(ENV_TARGET, "prod");
        std::env::remove_var(ENV_USE_BIGQUERY);
        std::env::remove_var(ENV_DUCKDB_SCHEMA);

        let applied = export_defaults();

        assert_eq!(std::env::var(ENV_TARGET).unwrap(), "prod");
        assert_eq!(std::env::var(ENV_USE_BIGQUERY).unwrap(), "false");
        assert!(applied.contains(&(ENV_DUCKDB_SCHEMA, "metal_data")));
        assert!(!applied.iter().any(|(name, _)| *name == ENV_TARGET));

        std::env::remove_var(ENV_TARGET);
        std::env::remove_var(ENV_USE_BIGQUERY);
        std::env::remove_var(ENV_DUCKDB_SCHEMA);
    }
}
