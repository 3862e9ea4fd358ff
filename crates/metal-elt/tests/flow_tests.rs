//! Orchestrated flows driven through the process environment
//!
//! Tests touching environment variables run serially.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use metal_elt::config::{
    EnvSnapshot, ENV_DUCKDB_PATH, ENV_DUCKDB_SCHEMA, ENV_SOURCE_URL, ENV_TARGET, ENV_USE_BIGQUERY,
};
use metal_elt::flow::{FlowOptions, LoadFlow};
use metal_elt::transform::{
    Invocation, StepStatus, TransformFlow, TransformRunner, ENV_DBT_PROFILES_DIR,
    ENV_DBT_PROJECT_DIR,
};
use metal_elt::store::{Destination, DuckDbDestination};
use metal_elt::{FlowStatus, LoadStatus, Result};
use serial_test::serial;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn fast() -> FlowOptions {
    FlowOptions {
        retry_delay: Some(Duration::ZERO),
        progress: false,
    }
}

fn clear_env() {
    for name in [
        ENV_USE_BIGQUERY,
        ENV_TARGET,
        ENV_DUCKDB_SCHEMA,
        ENV_SOURCE_URL,
        ENV_DUCKDB_PATH,
    ] {
        std::env::remove_var(name);
    }
}

fn write_sources(dir: &Path) {
    std::fs::write(dir.join("bands.csv"), "id,name\n1,Death\n2,Obituary\n").unwrap();
    std::fs::write(dir.join("albums.csv"), "id,band,title,year\n10,2,Cause of Death,1990\n").unwrap();
    std::fs::write(dir.join("reviews.csv"), "id,album,title,score,content\n").unwrap();
}

#[tokio::test]
#[serial]
async fn test_load_flow_success() {
    clear_env();
    let dir = TempDir::new().unwrap();
    write_sources(dir.path());
    std::env::set_var(ENV_SOURCE_URL, dir.path());
    std::env::set_var(ENV_DUCKDB_PATH, dir.path().join("flow.duckdb"));

    let execution = LoadFlow::new(fast()).run_steps().await.unwrap();

    assert_eq!(execution.status, "success");
    assert_eq!(execution.destination, "duckdb");
    assert_eq!(execution.dataset_name, "metal_data");
    assert!(execution.project_id.is_none());
    assert_eq!(execution.tables.len(), 3);
    // Defaults were exported for downstream tools
    assert_eq!(std::env::var(ENV_TARGET).unwrap(), "dev");
    assert_eq!(std::env::var(ENV_USE_BIGQUERY).unwrap(), "false");
    assert_eq!(std::env::var(ENV_DUCKDB_SCHEMA).unwrap(), "metal_data");

    clear_env();
    assert!(std::env::var(ENV_DUCKDB_SCHEMA).is_err());
}

#[tokio::test]
#[serial]
async fn test_load_flow_reports_error_after_retries() {
    clear_env();
    let dir = TempDir::new().unwrap();
    std::env::set_var(ENV_SOURCE_URL, dir.path().join("missing"));
    std::env::set_var(ENV_DUCKDB_PATH, dir.path().join("flow.duckdb"));

    let status = LoadFlow::new(fast()).run().await;

    assert_eq!(status, FlowStatus::Error);
    clear_env();
}

#[tokio::test]
#[serial]
async fn test_load_flow_succeeds_with_duplicate_band_ids() {
    clear_env();
    let dir = TempDir::new().unwrap();
    write_sources(dir.path());
    std::fs::write(
        dir.path().join("bands.csv"),
        "id,name\n1,Death\n2,Obituary\n2,Obituary\n3,Deicide\n",
    )
    .unwrap();
    std::env::set_var(ENV_SOURCE_URL, dir.path());
    std::env::set_var(ENV_DUCKDB_PATH, dir.path().join("flow.duckdb"));

    let flow = LoadFlow::new(fast());
    let execution = flow.run_steps().await.unwrap();
    let bands = execution.tables.iter().find(|t| t.logical_name == "bands").unwrap();
    assert_eq!(bands.row_count, 4);
    assert_eq!(bands.duplicate_primary_key_count, 1);
    assert_eq!(bands.status, LoadStatus::Warning);

    assert_eq!(flow.run().await, FlowStatus::Success);
    clear_env();
}

#[tokio::test]
#[serial]
async fn test_load_flow_errors_on_missing_albums_and_keeps_bands() {
    clear_env();
    let dir = TempDir::new().unwrap();
    write_sources(dir.path());
    std::fs::remove_file(dir.path().join("albums.csv")).unwrap();
    let db_path = dir.path().join("flow.duckdb");
    std::env::set_var(ENV_SOURCE_URL, dir.path());
    std::env::set_var(ENV_DUCKDB_PATH, &db_path);

    let status = LoadFlow::new(fast()).run().await;

    assert_eq!(status, FlowStatus::Error);
    let warehouse = DuckDbDestination::open(&db_path, "metal_data").unwrap();
    assert_eq!(warehouse.read_table("bands").await.unwrap().row_count(), 2);
    assert!(warehouse.read_table("albums").await.is_err());
    clear_env();
}

#[derive(Clone, Default)]
struct ScriptedRunner {
    calls: Arc<Mutex<Vec<String>>>,
    fail_test: bool,
    fail_run: bool,
    docs_dir: Option<std::path::PathBuf>,
}

#[async_trait]
impl TransformRunner for ScriptedRunner {
    async fn invoke(&self, args: &[&str]) -> Result<Invocation> {
        self.calls.lock().unwrap().push(args.join(" "));
        let success = match args.first().copied() {
            Some("run") => !self.fail_run,
            Some("test") => !self.fail_test,
            Some("docs") => {
                if let Some(dir) = &self.docs_dir {
                    std::fs::create_dir_all(dir).unwrap();
                    std::fs::write(dir.join("catalog.json"), "{}").unwrap();
                    std::fs::write(dir.join("manifest.json"), "{}").unwrap();
                }
                true
            },
            _ => true,
        };
        Ok(Invocation {
            success,
            output: format!("dbt {}", args.join(" ")),
        })
    }
}

fn dbt_project(root: &Path) -> EnvSnapshot {
    let project = root.join("dbt_deathmetal");
    let profiles = root.join(".dbt");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::create_dir_all(&profiles).unwrap();
    std::fs::write(project.join("dbt_project.yml"), "name: dbt_deathmetal\n").unwrap();
    std::fs::write(profiles.join("profiles.yml"), "dbt_deathmetal: {}\n").unwrap();

    EnvSnapshot::from([
        (ENV_DBT_PROJECT_DIR.to_string(), project.display().to_string()),
        (ENV_DBT_PROFILES_DIR.to_string(), profiles.display().to_string()),
        (ENV_TARGET.to_string(), "prod".to_string()),
    ])
}

#[tokio::test]
async fn test_transform_flow_runs_all_commands() {
    let dir = TempDir::new().unwrap();
    let vars = dbt_project(dir.path());
    let runner = ScriptedRunner {
        docs_dir: Some(dir.path().join("dbt_deathmetal").join("target")),
        ..Default::default()
    };
    let calls = runner.calls.clone();

    let summary = TransformFlow::new(fast())
        .run_steps(&vars, move |_| Box::new(runner))
        .await
        .unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec!["run --target prod", "test --target prod", "docs generate --target prod"]
    );
    assert_eq!(summary.test.status, StepStatus::Success);
    assert!(summary.docs.docs_ready);
    assert!(!summary.docs.files_generated.index);
}

#[tokio::test]
async fn test_transform_flow_downgrades_test_failures() {
    let dir = TempDir::new().unwrap();
    let vars = dbt_project(dir.path());
    let runner = ScriptedRunner {
        fail_test: true,
        ..Default::default()
    };
    let calls = runner.calls.clone();

    let status = TransformFlow::new(fast())
        .run_with(&vars, move |_| Box::new(runner))
        .await;

    assert_eq!(status, FlowStatus::Success);
    let tests_run = calls.lock().unwrap().iter().filter(|c| c.starts_with("test")).count();
    assert_eq!(tests_run, 1);
}

#[tokio::test]
async fn test_transform_flow_errors_when_dbt_run_fails() {
    let dir = TempDir::new().unwrap();
    let vars = dbt_project(dir.path());
    let runner = ScriptedRunner {
        fail_run: true,
        ..Default::default()
    };
    let calls = runner.calls.clone();

    let status = TransformFlow::new(fast())
        .run_with(&vars, move |_| Box::new(runner))
        .await;

    assert_eq!(status, FlowStatus::Error);
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.starts_with("run")));
}

#[tokio::test]
async fn test_transform_flow_errors_without_project() {
    let dir = TempDir::new().unwrap();
    let vars = EnvSnapshot::from([(
        ENV_DBT_PROJECT_DIR.to_string(),
        dir.path().join("nope").display().to_string(),
    )]);

    let status = TransformFlow::new(fast())
        .run_with(&vars, |_| Box::new(ScriptedRunner::default()))
        .await;

    assert_eq!(status, FlowStatus::Error);
}
