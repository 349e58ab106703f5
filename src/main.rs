//! loadramp: staged HTTP load testing from the command line.
//!
//! Exit codes: 0 when every threshold passed, 99 when any threshold failed,
//! 1 on configuration or I/O errors.

use clap::Parser;
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Staged HTTP load testing
#[derive(Parser)]
#[command(name = "loadramp")]
#[command(about = "Ramp virtual users against an HTTP endpoint and check thresholds", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.execute() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "Error:".red().bold());
            ExitCode::FAILURE
        },
    }
}

/// Logs go to stderr so the summary on stdout stays clean.
fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "loadramp=debug,info",
        _ => "loadramp=trace,debug",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time(),
        )
        .init();
}
