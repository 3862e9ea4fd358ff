//! Destination stores
//!
//! A [`Destination`] is bound to one dataset when it is opened. Writes are
//! full replaces scoped to a single table; there is no transaction across
//! tables.

use async_trait::async_trait;

use crate::config::ConnectionSettings;
use crate::data::TableData;
use crate::destination::{DestinationProfile, StoreKind};
use crate::error::Result;

pub mod bigquery;
pub mod duckdb;

pub use self::bigquery::BigQueryDestination;
pub use self::duckdb::DuckDbDestination;

#[async_trait]
pub trait Destination: Send + Sync {
    /// Human-readable location, e.g. `duckdb:metal.duckdb/metal_data`
    fn describe(&self) -> String;

    /// Remove the dataset and everything in it; a missing dataset is fine
    async fn drop_dataset(&self) -> Result<()>;

    /// Replace the table's contents with `data`, returning rows written
    ///
    /// Either the whole new row set becomes visible or the previous contents
    /// stay untouched.
    async fn write_replace(&self, table: &str, data: TableData) -> Result<u64>;

    async fn read_table(&self, table: &str) -> Result<TableData>;
}

/// Open the destination named by a profile
pub async fn connect(profile: &DestinationProfile, settings: &ConnectionSettings) -> Result<Box<dyn Destination>> {
    match &profile.store_kind {
        StoreKind::LocalEmbedded { database_path } => Ok(Box::new(DuckDbDestination::open(
            database_path,
            &profile.dataset_name,
        )?)),
        StoreKind::CloudWarehouse { project, location } => Ok(Box::new(BigQueryDestination::new(
            &settings.bigquery_api_url,
            project,
            &profile.dataset_name,
            location,
            settings.access_token.clone(),
        )?)),
    }
}

/// Double-quote an SQL identifier
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("bands"), "\"bands\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
