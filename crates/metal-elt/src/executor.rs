//! Load-replace executor
//!
//! One pass over the table descriptors: optional dataset reset, then for each
//! table a full extraction followed by a full-replace write. The first failing
//! table ends the run; tables written before it keep their new contents.

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, instrument};

use crate::destination::DestinationProfile;
use crate::error::{PipelineError, Result};
use crate::report::LoadResult;
use crate::source::CsvSource;
use crate::store::Destination;
use crate::tables::TableDescriptor;

fn table_progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

pub struct LoadReplaceExecutor<'a> {
    profile: &'a DestinationProfile,
    tables: &'a [TableDescriptor],
    source: &'a CsvSource,
    destination: &'a dyn Destination,
    progress: ProgressBar,
}

impl<'a> LoadReplaceExecutor<'a> {
    pub fn new(
        profile: &'a DestinationProfile,
        tables: &'a [TableDescriptor],
        source: &'a CsvSource,
        destination: &'a dyn Destination,
    ) -> Self {
        Self {
            profile,
            tables,
            source,
            destination,
            progress: ProgressBar::hidden(),
        }
    }

    /// Show a progress bar across tables on stderr
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = if enabled {
            table_progress(self.tables.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        self
    }

    /// Run every table in order, returning one result per table
    ///
    /// On failure the error is [`PipelineError::RunAborted`] carrying the
    /// results so far, the failed table last.
    #[instrument(skip(self), fields(pipeline = self.profile.pipeline_name, dataset = %self.profile.dataset_name))]
    pub async fn execute(&self) -> Result<Vec<LoadResult>> {
        if self.profile.reset_before_load {
            info!("Resetting dataset {} before load", self.destination.describe());
            self.destination.drop_dataset().await?;
        }

        let mut results = Vec::with_capacity(self.tables.len());

        for table in self.tables {
            self.progress.set_message(table.logical_name);

            match self.load_table(table).await {
                Ok(row_count) => {
                    info!(table = table.logical_name, row_count, "Table replaced");
                    results.push(LoadResult::success(table.logical_name, row_count));
                    self.progress.inc(1);
                },
                Err(e) => {
                    error!(
                        table = table.logical_name,
                        stage = e.stage(),
                        error = %e,
                        "Table load failed, aborting run"
                    );
                    self.progress.abandon_with_message(format!("{} failed", table.logical_name));
                    results.push(LoadResult::failed(table.logical_name));
                    return Err(PipelineError::RunAborted {
                        table: table.logical_name.to_string(),
                        results,
                        source: Box::new(e),
                    });
                },
            }
        }

        self.progress.finish_with_message("done");
        Ok(results)
    }

    async fn load_table(&self, table: &TableDescriptor) -> Result<u64> {
        info!(
            "Loading {} from {}",
            table.logical_name,
            table.source_path(self.source.root_uri(), self.source.layout())
        );

        let data = self
            .source
            .extract(table, self.profile.use_explicit_schema)
            .await?;
        self.destination.write_replace(table.logical_name, data).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RunConfiguration;
    use crate::destination::select_profile;
    use crate::report::LoadStatus;
    use crate::source::LocalStore;
    use crate::store::DuckDbDestination;
    use crate::tables::{SourceLayout, TABLES};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_loads_tables_in_order() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bands.csv", "id,name\n1,Death\n2,Morbid Angel\n");
        write(&dir, "albums.csv", "id,band,title,year\n10,1,Scream Bloody Gore,1987\n");
        write(&dir, "reviews.csv", "id,album,title,score,content\n");

        let profile = select_profile(&RunConfiguration::default());
        let source = CsvSource::new(Box::new(LocalStore::new(dir.path())), SourceLayout::SingleFile);
        let destination = DuckDbDestination::in_memory("metal_data").unwrap();

        let results = LoadReplaceExecutor::new(&profile, &TABLES, &source, &destination)
            .execute()
            .await
            .unwrap();

        let summary: Vec<_> = results
            .iter()
            .map(|r| (r.logical_name.as_str(), r.row_count, r.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("bands", 2, LoadStatus::Success),
                ("albums", 1, LoadStatus::Success),
                ("reviews", 0, LoadStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_tables() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bands.csv", "id,name\n1,Death\n");
        write(&dir, "reviews.csv", "id,album,title,score,content\n1,1,x,50,y\n");

        let profile = select_profile(&RunConfiguration::default());
        let source = CsvSource::new(Box::new(LocalStore::new(dir.path())), SourceLayout::SingleFile);
        let destination = DuckDbDestination::in_memory("metal_data").unwrap();

        let err = LoadReplaceExecutor::new(&profile, &TABLES, &source, &destination)
            .execute()
            .await
            .unwrap_err();

        assert_eq!(err.table(), Some("albums"));
        let statuses: Vec<_> = err.partial_results().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![LoadStatus::Success, LoadStatus::Failed]);
        assert!(destination.read_table("reviews").await.is_err());
        assert_eq!(destination.read_table("bands").await.unwrap().row_count(), 1);
    }
}
