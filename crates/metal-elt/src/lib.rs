//! Death metal ELT pipeline
//!
//! Extracts band, album and review CSVs from object storage and loads them
//! into DuckDB or BigQuery with replace-on-run semantics, then optionally
//! hands over to dbt for transformation, tests and docs.
//!
//! A run is strictly linear:
//!
//! 1. [`config::RunConfiguration`] is read once from an environment snapshot
//! 2. [`destination::select_profile`] turns it into a [`destination::DestinationProfile`]
//! 3. [`executor::LoadReplaceExecutor`] resets the dataset (local only) and
//!    full-replaces every table in [`tables::TABLES`] order
//! 4. [`verify`] reads `bands` back and flags duplicate primary keys
//!
//! [`flow::LoadFlow`] and [`transform::TransformFlow`] wrap those steps with
//! bounded retries and reduce the outcome to `SUCCESS` or `ERROR`.
//!
//! # Example
//!
//! ```no_run
//! use metal_elt::config::RunConfiguration;
//! use metal_elt::pipeline::LoadPipeline;
//!
//! # async fn run() -> metal_elt::error::Result<()> {
//! let pipeline = LoadPipeline::new(RunConfiguration::from_env()?);
//! let report = pipeline.run().await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod data;
pub mod destination;
pub mod error;
pub mod executor;
pub mod flow;
pub mod pipeline;
pub mod report;
pub mod source;
pub mod store;
pub mod tables;
pub mod transform;
pub mod verify;

pub use config::RunConfiguration;
pub use destination::{select_profile, DestinationProfile};
pub use error::{PipelineError, Result};
pub use flow::FlowStatus;
pub use report::{LoadResult, LoadStatus, RunReport};
pub use tables::{TableDescriptor, TABLES};
