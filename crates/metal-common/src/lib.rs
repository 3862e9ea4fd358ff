//! Metal Common Library
//!
//! Shared plumbing for the death metal ELT workspace.
//!
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` environment variables
//! - **Retry**: bounded retry with fixed or exponential delay, used by the
//!   orchestration layer around whole pipeline steps
//!
//! # Example
//!
//! ```no_run
//! use metal_common::logging::{init_logging, LogConfig};
//! use metal_common::retry::{retry, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!
//!     let policy = RetryPolicy::fixed(3, Duration::from_secs(30));
//!     let value = retry(&policy, "fetch-value", || async { Ok::<_, anyhow::Error>(42) }).await?;
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod logging;
pub mod retry;

pub use retry::{retry, Backoff, RetryPolicy};
