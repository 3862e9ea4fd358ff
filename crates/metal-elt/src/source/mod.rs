//! Object-storage CSV source
//!
//! [`ObjectStore`] is the narrow seam to S3, GCS or a local directory: list
//! keys under a prefix and fetch one object. [`CsvSource`] sits on top and
//! turns a [`TableDescriptor`] into [`TableData`].

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::ConnectionSettings;
use crate::data::TableData;
use crate::error::{PipelineError, Result};
use crate::tables::{SourceLayout, TableDescriptor};

pub mod csv;
pub mod gcs;
pub mod local;
pub mod s3;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use s3::S3Store;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// URI of the bucket root, for logs
    fn root_uri(&self) -> &str;

    /// Keys under `prefix`, relative to the bucket root, `/`-separated
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Parsed bucket root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
    Gcs { bucket: String, prefix: String },
}

impl SourceLocation {
    /// Accepts `s3://bucket[/prefix]`, `gs://bucket[/prefix]`, `file:///dir` or a plain path
    pub fn parse(uri: &str) -> Result<Self> {
        let url = match Url::parse(uri) {
            Ok(url) if url.scheme().len() > 1 => url,
            // Relative paths and Windows drive letters
            _ => return Ok(SourceLocation::Local(PathBuf::from(uri))),
        };

        let bucket_and_prefix = |url: &Url| -> Result<(String, String)> {
            let bucket = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| PipelineError::configuration(format!("Missing bucket name in '{}'", uri)))?;
            Ok((bucket.to_string(), url.path().trim_matches('/').to_string()))
        };

        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(SourceLocation::Local)
                .map_err(|_| PipelineError::configuration(format!("Invalid file URL '{}'", uri))),
            "s3" => {
                let (bucket, prefix) = bucket_and_prefix(&url)?;
                Ok(SourceLocation::S3 { bucket, prefix })
            },
            "gs" | "gcs" => {
                let (bucket, prefix) = bucket_and_prefix(&url)?;
                Ok(SourceLocation::Gcs { bucket, prefix })
            },
            other => Err(PipelineError::configuration(format!(
                "Unsupported source scheme '{}' in '{}'",
                other, uri
            ))),
        }
    }
}

/// Open the object store behind a bucket root URI
pub async fn open_store(uri: &str, settings: &ConnectionSettings) -> Result<Box<dyn ObjectStore>> {
    let store: Box<dyn ObjectStore> = match SourceLocation::parse(uri)? {
        SourceLocation::Local(path) => Box::new(LocalStore::new(path)),
        SourceLocation::S3 { bucket, prefix } => {
            Box::new(S3Store::new(bucket, prefix, &settings.s3).await)
        },
        SourceLocation::Gcs { bucket, prefix } => Box::new(GcsStore::new(
            &settings.gcs_api_url,
            bucket,
            prefix,
            settings.access_token.clone(),
        )?),
    };

    debug!("Opened object store at {}", store.root_uri());
    Ok(store)
}

/// Part of a glob before its first wildcard, used to narrow listings
pub fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// Reads every table's CSV files from one bucket root
pub struct CsvSource {
    store: Box<dyn ObjectStore>,
    layout: SourceLayout,
}

impl CsvSource {
    pub fn new(store: Box<dyn ObjectStore>, layout: SourceLayout) -> Self {
        Self { store, layout }
    }

    pub fn root_uri(&self) -> &str {
        self.store.root_uri()
    }

    pub fn layout(&self) -> SourceLayout {
        self.layout
    }

    /// Read all rows for a table
    ///
    /// Zero matching files is an error; matching files with only a header,
    /// or with no content at all, yield an empty table.
    #[instrument(skip(self, table), fields(table = table.logical_name))]
    pub async fn extract(&self, table: &TableDescriptor, explicit_schema: bool) -> Result<TableData> {
        let name = table.logical_name;
        let pattern = table.source_pattern(self.layout);

        let keys = self
            .store
            .list(literal_prefix(&pattern))
            .await
            .map_err(|e| PipelineError::extraction(name, e.to_string()))?;
        let matched = csv::matching_keys(name, &keys, &pattern)?;

        if matched.is_empty() {
            return Err(PipelineError::extraction(
                name,
                format!(
                    "no source files match {}",
                    table.source_path(self.store.root_uri(), self.layout)
                ),
            ));
        }

        let mut reader = csv::CsvTableReader::new(name);
        for key in &matched {
            let bytes = self
                .store
                .get(key)
                .await
                .map_err(|e| PipelineError::extraction(name, e.to_string()))?;
            debug!("Read {} bytes from {}", bytes.len(), key);
            reader.add_file(key, &bytes)?;
        }

        // Blank files still produce the table, so it can be read back
        let data = if reader.has_header() {
            reader.finish(table.schema_for(explicit_schema))?
        } else {
            warn!("No header in any source file for {}, creating it empty", name);
            csv::declared_table(table.column_schema.unwrap_or_default())
        };
        info!(
            "Extracted {} rows from {} file(s) for {}",
            data.row_count(),
            matched.len(),
            name
        );

        Ok(data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            SourceLocation::parse("s3://death-metal-raw").unwrap(),
            SourceLocation::S3 {
                bucket: "death-metal-raw".to_string(),
                prefix: String::new()
            }
        );
        assert_eq!(
            SourceLocation::parse("gs://death-metal-raw-data/exports/2024/").unwrap(),
            SourceLocation::Gcs {
                bucket: "death-metal-raw-data".to_string(),
                prefix: "exports/2024".to_string()
            }
        );
        assert_eq!(
            SourceLocation::parse("data/raw").unwrap(),
            SourceLocation::Local(PathBuf::from("data/raw"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_file_url() {
        assert_eq!(
            SourceLocation::parse("file:///srv/metal").unwrap(),
            SourceLocation::Local(PathBuf::from("/srv/metal"))
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            SourceLocation::parse("ftp://example.com/metal"),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("bands.csv"), "bands.csv");
        assert_eq!(literal_prefix("albums/*.csv"), "albums/");
    }
}
