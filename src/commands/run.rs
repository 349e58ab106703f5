//! `loadramp run` command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use loadramp::loadtest::config::LoadTestConfig;
use loadramp::loadtest::engine::LoadTestEngine;
use loadramp::loadtest::report::{write_report, LoadTestReport, STATE_DIR};
use loadramp::loadtest::summary::render_summary;

/// Exit code when the run completed but a threshold failed.
pub const THRESHOLD_FAILED_EXIT: u8 = 99;

/// Execute the `run` command.
///
/// Loads config (via explicit path or auto-discovery), builds and runs the
/// engine, prints the summary and writes the JSON report.
pub async fn execute_run(
    script: Option<PathBuf>,
    url: Option<String>,
    iterations: Option<u64>,
    no_report: bool,
    no_color: bool,
) -> Result<ExitCode> {
    // Step 1: Load config
    let config_file = match script {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `loadramp init` to create one.",
                    path.display()
                );
            }
            path
        },
        None => {
            let cwd = std::env::current_dir()?;
            match discover_config(&cwd) {
                Some(path) => path,
                None => {
                    anyhow::bail!(
                        "No loadtest config found.\n\
                         Run `loadramp init` to create {STATE_DIR}/loadtest.toml,\n\
                         or pass the path to a scenario file."
                    );
                },
            }
        },
    };

    eprintln!("Loading config from: {}", config_file.display());

    let config = LoadTestConfig::load(&config_file)
        .with_context(|| format!("Failed to load config '{}'", config_file.display()))?;

    let Some(target) = url.or_else(|| config.request.url.clone()) else {
        anyhow::bail!("No target URL: set request.url in the config or pass --url");
    };

    // Step 2: Build and run the engine
    let mut engine = LoadTestEngine::new(config)
        .with_url(target.clone())
        .with_live_display(std::io::stderr().is_terminal())
        .with_signal_handling(true)
        .with_no_color(no_color);
    if let Some(n) = iterations {
        engine = engine.with_iterations(n);
    }

    let result = engine.run().await.context("Load test failed")?;

    // Step 3: Terminal summary
    if no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let summary = render_summary(&result, engine.config(), &target);
    println!("{summary}");

    // Step 4: JSON report (unless --no-report)
    if !no_report {
        let report = LoadTestReport::from_result(&result, engine.config(), &target);
        let base = report_base_dir(&config_file);
        match write_report(&report, &base) {
            Ok(path) => {
                eprintln!();
                eprintln!("Report written to: {}", path.display());
            },
            Err(e) => {
                // Non-fatal: the verdict does not depend on the report.
                eprintln!();
                eprintln!("{} Failed to write report: {e}", "Warning:".yellow());
            },
        }
    }

    if result.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(THRESHOLD_FAILED_EXIT))
    }
}

/// Discover `.loadramp/loadtest.toml` by walking parent directories.
///
/// Starts from `start` and walks up until either the file is found or the
/// filesystem root is reached. This matches `.git` directory discovery
/// semantics.
fn discover_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(STATE_DIR).join("loadtest.toml");
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Directory whose `.loadramp/reports/` receives the report.
///
/// A discovered `<root>/.loadramp/loadtest.toml` reports under `<root>`; any
/// other scenario file reports under the current directory.
fn report_base_dir(config_file: &Path) -> PathBuf {
    let parent = config_file.parent();
    if parent.and_then(Path::file_name).is_some_and(|n| n == STATE_DIR) {
        if let Some(root) = parent.and_then(Path::parent) {
            return root.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_config_in_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let state = root.path().join(STATE_DIR);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("loadtest.toml"), "").unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(discover_config(&nested), Some(state.join("loadtest.toml")));
    }

    #[test]
    fn test_discover_config_ignores_directory_named_like_config() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join(STATE_DIR).join("loadtest.toml")).unwrap();
        let found = discover_config(root.path());
        assert_ne!(found, Some(root.path().join(STATE_DIR).join("loadtest.toml")));
    }

    #[test]
    fn test_report_base_dir_for_discovered_config() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join(STATE_DIR).join("loadtest.toml");
        assert_eq!(report_base_dir(&file), root.path());
    }

    #[test]
    fn test_report_base_dir_for_other_file_is_cwd() {
        let file = Path::new("/tmp/scenarios/smoke.toml");
        assert_eq!(report_base_dir(file), std::env::current_dir().unwrap());
    }
}
