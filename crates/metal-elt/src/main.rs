//! metal-elt - death metal load and transform runner

use anyhow::Result;
use clap::{Parser, Subcommand};
use metal_common::logging::{init_logging, LogConfig, LogLevel};
use metal_elt::flow::{FlowOptions, LoadFlow};
use metal_elt::pipeline::LoadPipeline;
use metal_elt::transform::TransformFlow;
use metal_elt::RunConfiguration;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "metal-elt")]
#[command(author, version, about = "Load death metal CSV data into DuckDB or BigQuery")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one load and print the report
    Load {
        /// Show a progress bar across tables
        #[arg(long)]
        progress: bool,
    },

    /// Run the load as an orchestrated flow with retries
    Flow {
        /// Override the delay between retries of every step
        #[arg(long, env = "METAL_RETRY_DELAY_SECS")]
        retry_delay_secs: Option<u64>,

        #[arg(long)]
        progress: bool,
    },

    /// Run dbt run, test and docs generate
    Transform {
        /// Override the delay between retries of every step
        #[arg(long, env = "METAL_RETRY_DELAY_SECS")]
        retry_delay_secs: Option<u64>,
    },
}

async fn load(progress: bool) -> Result<ExitCode> {
    let config = RunConfiguration::from_env()?;
    let pipeline = LoadPipeline::new(config).with_progress(progress);

    match pipeline.run().await {
        Ok(report) => {
            println!("{report}");
            Ok(ExitCode::SUCCESS)
        },
        Err(e) => {
            error!(stage = e.stage(), error = %e, "Load failed");
            for result in e.partial_results() {
                println!("{:<10} {:>8} {}", result.logical_name, result.row_count, result.status);
            }
            eprintln!("Error: {e}");
            Ok(ExitCode::FAILURE)
        },
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let code = match cli.command {
        Command::Load { progress } => load(progress).await?,
        Command::Flow {
            retry_delay_secs,
            progress,
        } => {
            let status = LoadFlow::new(FlowOptions {
                retry_delay: retry_delay_secs.map(Duration::from_secs),
                progress,
            })
            .run()
            .await;
            println!("Final result: {status}");
            if status.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        },
        Command::Transform { retry_delay_secs } => {
            let status = TransformFlow::new(FlowOptions {
                retry_delay: retry_delay_secs.map(Duration::from_secs),
                progress: false,
            })
            .run()
            .await;
            println!("Final result: {status}");
            if status.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        },
    };

    info!("metal-elt finished");
    Ok(code)
}
