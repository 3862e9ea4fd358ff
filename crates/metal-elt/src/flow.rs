//! Orchestrated load flow
//!
//! Three named steps, each wrapped in a bounded retry. Whatever happens, the
//! flow reduces to [`FlowStatus::Success`] or [`FlowStatus::Error`].
//!
//! | step                       | attempts | delay |
//! |----------------------------|----------|-------|
//! | `validate-environment`     | 2        | 0 s   |
//! | `create-pipeline-instance` | 3        | 0 s   |
//! | `execute-data-pipeline`    | 3        | 30 s  |

use chrono::{DateTime, Local, Utc};
use metal_common::retry::{retry, RetryPolicy};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{export_defaults, RunConfiguration};
use crate::error::Result;
use crate::pipeline::LoadPipeline;
use crate::report::LoadResult;
use crate::source::CsvSource;
use crate::store::Destination;

pub const VALIDATE_ENVIRONMENT: &str = "validate-environment";
pub const CREATE_PIPELINE_INSTANCE: &str = "create-pipeline-instance";
pub const EXECUTE_DATA_PIPELINE: &str = "execute-data-pipeline";

const VALIDATE_ATTEMPTS: u32 = 2;
const CREATE_ATTEMPTS: u32 = 3;
const EXECUTE_ATTEMPTS: u32 = 3;
const EXECUTE_RETRY_DELAY_SECS: u64 = 30;

/// Terminal state of an orchestrated flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowStatus {
    Success,
    Error,
}

impl FlowStatus {
    pub fn is_success(self) -> bool {
        self == FlowStatus::Success
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Success => f.write_str("SUCCESS"),
            FlowStatus::Error => f.write_str("ERROR"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowOptions {
    /// Replaces every step's retry delay, e.g. zero in tests
    pub retry_delay: Option<Duration>,
    pub progress: bool,
}

impl FlowOptions {
    pub(crate) fn policy(&self, attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy::fixed(attempts, self.retry_delay.unwrap_or(delay))
    }
}

/// Outcome of `execute-data-pipeline`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineExecution {
    pub pipeline_name: String,
    pub destination: String,
    pub dataset_name: String,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bigquery_url: Option<String>,
    pub tables: Vec<LoadResult>,
}

/// Export defaults, then read the configuration for this run
pub fn validate_environment() -> Result<RunConfiguration> {
    info!("Validating environment");
    export_defaults();

    let config = RunConfiguration::from_env()?;
    info!(
        use_bigquery = config.use_bigquery(),
        target = %config.target_name,
        "Environment validated"
    );
    Ok(config)
}

/// A pipeline with its source and destination already opened
pub struct PipelineInstance {
    pub pipeline: LoadPipeline,
    pub source: CsvSource,
    pub destination: Box<dyn Destination>,
}

/// Resolve the profile and open both endpoints
pub async fn create_pipeline_instance(config: &RunConfiguration, progress: bool) -> Result<PipelineInstance> {
    let pipeline = LoadPipeline::new(config.clone()).with_progress(progress);
    let source = pipeline.connect_source().await?;
    let destination = pipeline.connect_destination().await?;

    let profile = pipeline.profile();
    info!(
        source = profile.source_name,
        bucket = %profile.bucket_root,
        pipeline = profile.pipeline_name,
        destination = %destination.describe(),
        "Pipeline created"
    );

    Ok(PipelineInstance {
        pipeline,
        source,
        destination,
    })
}

pub async fn execute_data_pipeline(instance: &PipelineInstance) -> Result<PipelineExecution> {
    info!("Executing data pipeline");
    let pipeline = &instance.pipeline;
    let report = pipeline
        .run_with(&instance.source, instance.destination.as_ref())
        .await?;
    let profile = pipeline.profile();

    Ok(PipelineExecution {
        pipeline_name: report.pipeline_name,
        destination: report.destination,
        dataset_name: report.dataset_name,
        status: "success",
        timestamp: Utc::now(),
        project_id: profile.project_id().map(String::from),
        bigquery_url: profile.console_url(),
        tables: report.results,
    })
}

pub struct LoadFlow {
    options: FlowOptions,
}

impl LoadFlow {
    pub fn new(options: FlowOptions) -> Self {
        Self { options }
    }

    pub async fn run(&self) -> FlowStatus {
        info!(
            "Starting Death Metal Data Pipeline at {}",
            Local::now().format("%d/%m/%Y %H:%M:%S")
        );

        match self.run_steps().await {
            Ok(execution) => {
                let summary = serde_json::to_string(&execution).unwrap_or_default();
                info!(summary = %summary, "Death Metal Data Pipeline finished");
                FlowStatus::Success
            },
            Err(e) => {
                error!(
                    stage = e.stage(),
                    table = e.table().unwrap_or("-"),
                    error = %e,
                    "Death Metal Data Pipeline failed"
                );
                FlowStatus::Error
            },
        }
    }

    pub async fn run_steps(&self) -> Result<PipelineExecution> {
        let config = retry(
            &self.options.policy(VALIDATE_ATTEMPTS, Duration::ZERO),
            VALIDATE_ENVIRONMENT,
            || async { validate_environment() },
        )
        .await?;

        let config = &config;
        let progress = self.options.progress;
        let instance = retry(
            &self.options.policy(CREATE_ATTEMPTS, Duration::ZERO),
            CREATE_PIPELINE_INSTANCE,
            move || async move { create_pipeline_instance(config, progress).await },
        )
        .await?;

        let instance = &instance;
        retry(
            &self
                .options
                .policy(EXECUTE_ATTEMPTS, Duration::from_secs(EXECUTE_RETRY_DELAY_SECS)),
            EXECUTE_DATA_PIPELINE,
            move || async move { execute_data_pipeline(instance).await },
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[test]
    fn test_status_strings() {
        assert_eq!(FlowStatus::Success.to_string(), "SUCCESS");
        assert_eq!(FlowStatus::Error.to_string(), "ERROR");
        assert_eq!(serde_json::to_value(FlowStatus::Error).unwrap(), "ERROR");
    }

    #[test]
    fn test_delay_override() {
        let options = FlowOptions {
            retry_delay: Some(Duration::ZERO),
            progress: false,
        };
        let policy = options.policy(EXECUTE_ATTEMPTS, Duration::from_secs(EXECUTE_RETRY_DELAY_SECS));
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay, Duration::ZERO);

        let policy = FlowOptions::default().policy(EXECUTE_ATTEMPTS, Duration::from_secs(30));
        assert_eq!(policy.delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_create_step_fails_on_unreachable_source() {
        let config = RunConfiguration {
            source_url: Some("ftp://example.com/metal".to_string()),
            ..RunConfiguration::default()
        };

        let err = create_pipeline_instance(&config, false).await.err().unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_create_step_retries_until_exhausted() {
        let config = RunConfiguration {
            source_url: Some("ftp://example.com/metal".to_string()),
            ..RunConfiguration::default()
        };
        let config = &config;
        let calls = &std::sync::atomic::AtomicU32::new(0);
        let options = FlowOptions {
            retry_delay: Some(Duration::ZERO),
            progress: false,
        };

        let result = retry(
            &options.policy(CREATE_ATTEMPTS, Duration::ZERO),
            CREATE_PIPELINE_INSTANCE,
            move || async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                create_pipeline_instance(config, false).await
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), CREATE_ATTEMPTS);
    }
}
