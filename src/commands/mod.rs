//! `loadramp` CLI subcommands.
//!
//! Provides `run` (execute a load test), `validate` (check a scenario
//! without sending traffic) and `init` (generate a starter scenario).

mod init;
mod run;
mod validate;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;

/// Load test commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test
    ///
    /// Executes the scenario in SCRIPT (default: auto-discover
    /// .loadramp/loadtest.toml). Prints a summary, writes a JSON report to
    /// .loadramp/reports/ and exits with 99 when a threshold fails.
    Run {
        /// Path to the scenario file
        script: Option<PathBuf>,

        /// Target URL (overrides request.url)
        #[arg(long, env = "LOADRAMP_URL")]
        url: Option<String>,

        /// Iteration limit across all VUs (overrides settings.iterations)
        #[arg(long)]
        iterations: Option<u64>,

        /// Disable JSON report output
        #[arg(long)]
        no_report: bool,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Validate a scenario file without running it
    ///
    /// Parses the file, checks stages, checks and thresholds, and prints the
    /// resolved ramp.
    Validate {
        /// Path to the scenario file
        script: PathBuf,
    },

    /// Generate a starter scenario file
    ///
    /// Creates .loadramp/loadtest.toml in the current directory.
    Init {
        /// Scenario template
        #[arg(long, value_parser = ["hpa", "stress"], default_value = "hpa")]
        template: String,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    /// Execute the selected subcommand.
    pub fn execute(self) -> Result<ExitCode> {
        match self {
            Command::Run {
                script,
                url,
                iterations,
                no_report,
                no_color,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(run::execute_run(
                    script, url, iterations, no_report, no_color,
                ))
            },
            Command::Validate { script } => validate::execute_validate(&script),
            Command::Init { template, force } => {
                let cwd = std::env::current_dir()?;
                init::execute_init(&cwd, &template, force)
            },
        }
    }
}
