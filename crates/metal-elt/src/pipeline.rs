//! One direct load run: connect, execute, verify, report

use chrono::Utc;
use tracing::{info, instrument};

use crate::config::RunConfiguration;
use crate::destination::{select_profile, DestinationProfile};
use crate::error::Result;
use crate::executor::LoadReplaceExecutor;
use crate::report::RunReport;
use crate::source::{open_store, CsvSource};
use crate::store::{self, Destination};
use crate::tables::{PRIMARY_TABLE, TABLES};
use crate::verify;

pub struct LoadPipeline {
    config: RunConfiguration,
    profile: DestinationProfile,
    progress: bool,
}

impl LoadPipeline {
    pub fn new(config: RunConfiguration) -> Self {
        let profile = select_profile(&config);
        Self {
            config,
            profile,
            progress: false,
        }
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn profile(&self) -> &DestinationProfile {
        &self.profile
    }

    pub async fn connect_source(&self) -> Result<CsvSource> {
        let store = open_store(&self.profile.bucket_root, &self.config.connection).await?;
        Ok(CsvSource::new(store, self.profile.source_layout))
    }

    pub async fn connect_destination(&self) -> Result<Box<dyn Destination>> {
        store::connect(&self.profile, &self.config.connection).await
    }

    /// Connect to the configured source and destination and run
    pub async fn run(&self) -> Result<RunReport> {
        let source = self.connect_source().await?;
        let destination = self.connect_destination().await?;
        self.run_with(&source, destination.as_ref()).await
    }

    /// Run against already opened endpoints
    #[instrument(skip_all, fields(pipeline = self.profile.pipeline_name, dataset = %self.profile.dataset_name))]
    pub async fn run_with(&self, source: &CsvSource, destination: &dyn Destination) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(
            "Starting {} from {} into {}",
            self.profile.pipeline_name,
            source.root_uri(),
            destination.describe()
        );

        let mut results = LoadReplaceExecutor::new(&self.profile, &TABLES, source, destination)
            .with_progress(self.progress)
            .execute()
            .await?;

        let verification = verify::verify(destination, &PRIMARY_TABLE).await;
        if let Some(report) = &verification {
            verify::apply(&mut results, report);
        }

        let report = RunReport {
            pipeline_name: self.profile.pipeline_name.to_string(),
            destination: self.profile.destination_name().to_string(),
            dataset_name: self.profile.dataset_name.clone(),
            results,
            verification,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            rows = report.total_rows(),
            warnings = report.has_warnings(),
            "Load finished"
        );
        Ok(report)
    }
}
