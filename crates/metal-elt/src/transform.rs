//! Orchestrated dbt flow
//!
//! Validates the dbt project and profile files, then runs `dbt run`,
//! `dbt test` and `dbt docs generate` against the configured target. Test
//! failures are reported as a warning and never fail the flow.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use metal_common::retry::retry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{
    lookup, parse_flag, snapshot_env, EnvSnapshot, DEFAULT_TARGET, ENV_TARGET, ENV_USE_BIGQUERY,
};
use crate::error::{PipelineError, Result};
use crate::flow::{FlowOptions, FlowStatus};

pub const ENV_DBT_PROJECT_DIR: &str = "DBT_PROJECT_DIR";
pub const ENV_DBT_PROFILES_DIR: &str = "DBT_PROFILES_DIR";
pub const ENV_DBT_EXECUTABLE: &str = "DBT_EXECUTABLE";

pub const DEFAULT_DBT_PROJECT_DIR: &str = "dbt_deathmetal";
pub const DEFAULT_DBT_EXECUTABLE: &str = "dbt";

pub const PROFILE_DUCKDB: &str = "dbt_deathmetal";
pub const PROFILE_BIGQUERY: &str = "dbt_deathmetal_bq";

pub const VALIDATE_DBT_SETUP: &str = "validate-dbt-setup";
pub const SETUP_DBT_RUNNER: &str = "setup-dbt-runner";
pub const DBT_RUN: &str = "dbt-run";
pub const DBT_TEST: &str = "dbt-test";
pub const DBT_DOCS_GENERATE: &str = "dbt-docs-generate";

const VALIDATE_ATTEMPTS: u32 = 2;
const RUN_ATTEMPTS: u32 = 3;
const RUN_RETRY_DELAY_SECS: u64 = 60;
const TEST_ATTEMPTS: u32 = 2;

/// Lines of dbt output kept in error messages
const OUTPUT_TAIL_LINES: usize = 20;

/// Resolved dbt project layout and target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbtSetup {
    pub project_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub target: String,
    pub use_bigquery: bool,
    pub profile_name: &'static str,
}

impl DbtSetup {
    pub fn docs_dir(&self) -> PathBuf {
        self.project_dir.join("target")
    }
}

fn require_exists(path: &Path, what: &str) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::source_not_found(format!("{what} not found: {}", path.display())))
    }
}

fn default_profiles_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".dbt"))
        .ok_or_else(|| {
            PipelineError::configuration(format!(
                "cannot locate home directory, set {ENV_DBT_PROFILES_DIR}"
            ))
        })
}

/// Check that the dbt project and its profile exist
pub fn validate_dbt_setup(vars: &EnvSnapshot) -> Result<DbtSetup> {
    info!("Validating dbt setup");

    let project_dir =
        PathBuf::from(lookup(vars, ENV_DBT_PROJECT_DIR).unwrap_or(DEFAULT_DBT_PROJECT_DIR));
    require_exists(&project_dir, "dbt project")?;
    require_exists(&project_dir.join("dbt_project.yml"), "dbt_project.yml")?;

    let profiles_dir = match lookup(vars, ENV_DBT_PROFILES_DIR) {
        Some(dir) => PathBuf::from(dir),
        None => default_profiles_dir()?,
    };
    require_exists(&profiles_dir.join("profiles.yml"), "profiles.yml")?;

    let use_bigquery = parse_flag(lookup(vars, ENV_USE_BIGQUERY));
    let setup = DbtSetup {
        project_dir,
        profiles_dir,
        target: lookup(vars, ENV_TARGET).unwrap_or(DEFAULT_TARGET).to_string(),
        use_bigquery,
        profile_name: if use_bigquery { PROFILE_BIGQUERY } else { PROFILE_DUCKDB },
    };

    info!(
        project = %setup.project_dir.display(),
        target = %setup.target,
        profile = setup.profile_name,
        use_bigquery = setup.use_bigquery,
        "dbt setup validated"
    );
    Ok(setup)
}

/// Outcome of one dbt command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub success: bool,
    pub output: String,
}

impl Invocation {
    fn tail(&self) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Executes dbt commands
///
/// `Err` means the command could not be run at all; a command that ran and
/// failed is an `Ok` with `success == false`.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    async fn invoke(&self, args: &[&str]) -> Result<Invocation>;
}

/// Runs the `dbt` executable as a child process
pub struct DbtCli {
    executable: String,
    project_dir: PathBuf,
    profiles_dir: PathBuf,
}

impl DbtCli {
    pub fn new(executable: impl Into<String>, setup: &DbtSetup) -> Self {
        Self {
            executable: executable.into(),
            project_dir: setup.project_dir.clone(),
            profiles_dir: setup.profiles_dir.clone(),
        }
    }

    pub fn from_vars(vars: &EnvSnapshot, setup: &DbtSetup) -> Self {
        Self::new(lookup(vars, ENV_DBT_EXECUTABLE).unwrap_or(DEFAULT_DBT_EXECUTABLE), setup)
    }
}

#[async_trait]
impl TransformRunner for DbtCli {
    async fn invoke(&self, args: &[&str]) -> Result<Invocation> {
        let output = Command::new(&self.executable)
            .args(args)
            .arg("--project-dir")
            .arg(&self.project_dir)
            .arg("--profiles-dir")
            .arg(&self.profiles_dir)
            .output()
            .await
            .map_err(|e| {
                PipelineError::transform(
                    args.join(" "),
                    format!("could not start '{}': {e}", self.executable),
                )
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(Invocation {
            success: output.status.success(),
            output: text,
        })
    }
}

/// Build the default runner from the environment
pub fn setup_dbt_runner(vars: &EnvSnapshot, setup: &DbtSetup) -> Box<dyn TransformRunner> {
    let runner = DbtCli::from_vars(vars, setup);
    info!(
        executable = %runner.executable,
        project_dir = %runner.project_dir.display(),
        profiles_dir = %runner.profiles_dir.display(),
        "dbt runner configured"
    );
    Box::new(runner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub command: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepOutcome {
    fn new(status: StepStatus, command: &str, setup: &DbtSetup) -> Self {
        Self {
            status,
            command: command.to_string(),
            target: setup.target.clone(),
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DocsFiles {
    pub catalog: bool,
    pub manifest: bool,
    pub index: bool,
}

impl DocsFiles {
    pub fn scan(docs_dir: &Path) -> Self {
        Self {
            catalog: docs_dir.join("catalog.json").exists(),
            manifest: docs_dir.join("manifest.json").exists(),
            index: docs_dir.join("index.html").exists(),
        }
    }

    pub fn docs_ready(&self) -> bool {
        self.catalog && self.manifest
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocsOutcome {
    #[serde(flatten)]
    pub step: StepOutcome,
    pub docs_path: PathBuf,
    pub files_generated: DocsFiles,
    pub docs_ready: bool,
}

fn mark(present: bool) -> &'static str {
    if present {
        "yes"
    } else {
        "no"
    }
}

pub async fn dbt_run(setup: &DbtSetup, runner: &dyn TransformRunner) -> Result<StepOutcome> {
    info!(target = %setup.target, profile = setup.profile_name, "Running dbt run");

    let invocation = runner.invoke(&["run", "--target", &setup.target]).await?;
    if !invocation.success {
        return Err(PipelineError::transform("dbt run", invocation.tail()));
    }

    info!("dbt run finished, models transformed");
    Ok(StepOutcome::new(StepStatus::Success, "dbt run", setup))
}

/// `dbt test`; any failure becomes a warning outcome
pub async fn dbt_test(setup: &DbtSetup, runner: &dyn TransformRunner, options: &FlowOptions) -> StepOutcome {
    info!(target = %setup.target, "Running dbt test");

    let args = ["test", "--target", setup.target.as_str()];
    let args = &args;
    let attempt = retry(&options.policy(TEST_ATTEMPTS, Duration::ZERO), DBT_TEST, move || {
        runner.invoke(args)
    })
    .await;

    let problem = match attempt {
        Ok(invocation) if invocation.success => None,
        Ok(invocation) => Some(invocation.tail()),
        Err(e) => Some(e.to_string()),
    };

    match problem {
        None => {
            info!("dbt test finished");
            StepOutcome::new(StepStatus::Success, "dbt test", setup)
        },
        Some(problem) => {
            warn!(error = %problem, "dbt test reported problems, some tests may have failed");
            let mut outcome = StepOutcome::new(StepStatus::Warning, "dbt test", setup);
            outcome.error = Some(problem);
            outcome
        },
    }
}

pub async fn dbt_docs_generate(setup: &DbtSetup, runner: &dyn TransformRunner) -> Result<DocsOutcome> {
    info!(target = %setup.target, "Running dbt docs generate");

    let invocation = runner
        .invoke(&["docs", "generate", "--target", &setup.target])
        .await?;
    if !invocation.success {
        return Err(PipelineError::transform("dbt docs generate", invocation.tail()));
    }

    let docs_path = setup.docs_dir();
    let files = DocsFiles::scan(&docs_path);
    info!(
        path = %docs_path.display(),
        catalog = mark(files.catalog),
        manifest = mark(files.manifest),
        index = mark(files.index),
        "dbt docs generated"
    );
    if files.docs_ready() {
        info!(
            "Serve the docs with: cd {} && dbt docs serve, then open http://localhost:8080",
            setup.project_dir.display()
        );
    }

    Ok(DocsOutcome {
        step: StepOutcome::new(StepStatus::Success, "dbt docs generate", setup),
        docs_path,
        files_generated: files,
        docs_ready: files.docs_ready(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformSummary {
    pub setup: DbtSetup,
    pub run: StepOutcome,
    pub test: StepOutcome,
    pub docs: DocsOutcome,
}

pub struct TransformFlow {
    options: FlowOptions,
}

impl TransformFlow {
    pub fn new(options: FlowOptions) -> Self {
        Self { options }
    }

    /// Run against the process environment and the `dbt` executable
    pub async fn run(&self) -> FlowStatus {
        let vars = snapshot_env();
        self.run_with(&vars, |setup| setup_dbt_runner(&vars, setup)).await
    }

    pub async fn run_with<F>(&self, vars: &EnvSnapshot, build_runner: F) -> FlowStatus
    where
        F: FnOnce(&DbtSetup) -> Box<dyn TransformRunner>,
    {
        info!(
            "Starting Modern dbt Pipeline at {}",
            Local::now().format("%d/%m/%Y %H:%M:%S")
        );

        match self.run_steps(vars, build_runner).await {
            Ok(summary) => {
                let summary = serde_json::to_string(&summary).unwrap_or_default();
                info!(summary = %summary, "Modern dbt Pipeline finished");
                FlowStatus::Success
            },
            Err(e) => {
                error!(stage = e.stage(), error = %e, "Modern dbt Pipeline failed");
                FlowStatus::Error
            },
        }
    }

    pub async fn run_steps<F>(&self, vars: &EnvSnapshot, build_runner: F) -> Result<TransformSummary>
    where
        F: FnOnce(&DbtSetup) -> Box<dyn TransformRunner>,
    {
        let setup = retry(
            &self.options.policy(VALIDATE_ATTEMPTS, Duration::ZERO),
            VALIDATE_DBT_SETUP,
            move || async move { validate_dbt_setup(vars) },
        )
        .await?;

        info!(step = SETUP_DBT_RUNNER, "Configuring dbt runner");
        let runner = build_runner(&setup);
        let runner = runner.as_ref();
        let setup_ref = &setup;

        let run = retry(
            &self
                .options
                .policy(RUN_ATTEMPTS, Duration::from_secs(RUN_RETRY_DELAY_SECS)),
            DBT_RUN,
            move || async move { dbt_run(setup_ref, runner).await },
        )
        .await?;

        let test = dbt_test(&setup, runner, &self.options).await;

        let docs = dbt_docs_generate(&setup, runner)
            .await
            .map_err(|e| {
                error!(step = DBT_DOCS_GENERATE, error = %e, "dbt docs generate failed");
                e
            })?;

        Ok(TransformSummary {
            setup,
            run,
            test,
            docs,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> (TempDir, EnvSnapshot) {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("dbt_deathmetal");
        let profiles = dir.path().join("profiles");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(project.join("dbt_project.yml"), "name: dbt_deathmetal\n").unwrap();
        std::fs::write(profiles.join("profiles.yml"), "dbt_deathmetal: {}\n").unwrap();

        let vars = EnvSnapshot::from([
            (ENV_DBT_PROJECT_DIR.to_string(), project.display().to_string()),
            (ENV_DBT_PROFILES_DIR.to_string(), profiles.display().to_string()),
        ]);
        (dir, vars)
    }

    #[test]
    fn test_validate_setup_defaults() {
        let (_dir, vars) = project();
        let setup = validate_dbt_setup(&vars).unwrap();
        assert_eq!(setup.target, "dev");
        assert!(!setup.use_bigquery);
        assert_eq!(setup.profile_name, PROFILE_DUCKDB);
    }

    #[test]
    fn test_validate_setup_bigquery_profile() {
        let (_dir, mut vars) = project();
        vars.insert(ENV_USE_BIGQUERY.to_string(), "TRUE".to_string());
        vars.insert(ENV_TARGET.to_string(), "prod".to_string());

        let setup = validate_dbt_setup(&vars).unwrap();
        assert_eq!(setup.profile_name, PROFILE_BIGQUERY);
        assert_eq!(setup.target, "prod");
    }

    #[test]
    fn test_validate_setup_missing_files() {
        let (dir, vars) = project();
        std::fs::remove_file(dir.path().join("profiles").join("profiles.yml")).unwrap();
        let err = validate_dbt_setup(&vars).unwrap_err();
        assert!(matches!(err, PipelineError::SourceNotFound(_)));
        assert!(err.to_string().contains("profiles.yml"));

        std::fs::remove_file(dir.path().join("dbt_deathmetal").join("dbt_project.yml")).unwrap();
        let err = validate_dbt_setup(&vars).unwrap_err();
        assert!(err.to_string().contains("dbt_project.yml"));
    }

    #[test]
    fn test_docs_ready_needs_catalog_and_manifest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("manifest.json"), "{}").unwrap();
        std::fs::write(dir.path().join("index.html"), "").unwrap();
        let files = DocsFiles::scan(dir.path());
        assert!(files.manifest && files.index && !files.catalog);
        assert!(!files.docs_ready());

        std::fs::write(dir.path().join("catalog.json"), "{}").unwrap();
        assert!(DocsFiles::scan(dir.path()).docs_ready());
    }

    #[test]
    fn test_invocation_tail() {
        let output = (1..=30).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let invocation = Invocation {
            success: false,
            output,
        };
        let tail = invocation.tail();
        assert!(tail.starts_with("11\n"));
        assert!(tail.ends_with("30"));
    }
}
