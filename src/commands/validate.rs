//! `loadramp validate` command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;
use std::process::ExitCode;

use loadramp::loadtest::config::LoadTestConfig;

/// Execute the `validate` command.
///
/// Any config error is returned and maps to exit code 1.
pub fn execute_validate(path: &Path) -> Result<ExitCode> {
    let config = LoadTestConfig::load(path)
        .with_context(|| format!("Invalid config '{}'", path.display()))?;

    println!("{} {} is valid", "✓".green(), path.display());
    println!();
    print!("{}", describe(&config)?);
    Ok(ExitCode::SUCCESS)
}

/// Human-readable description of the resolved scenario.
fn describe(config: &LoadTestConfig) -> Result<String> {
    let profile = config.ramp_profile();
    let thresholds = config.thresholds()?;
    let mut out = String::new();

    let target = config.request.url.as_deref().unwrap_or("(not set, pass --url)");
    writeln!(out, "  target:     {target}")?;
    writeln!(
        out,
        "  ramp:       {} stage(s), peak {} VUs, {}",
        profile.stages.len(),
        profile.max_target(),
        humantime::format_duration(profile.total_duration())
    )?;
    if profile.start_target > 0 {
        writeln!(out, "  start:      {} VUs", profile.start_target)?;
    }
    for (i, stage) in profile.stages.iter().enumerate() {
        writeln!(
            out,
            "    {:>2}. {:<8} -> {} VUs",
            i + 1,
            stage.duration.to_string(),
            stage.target
        )?;
    }
    if let Some(n) = config.settings.iterations {
        writeln!(out, "  iterations: {n}")?;
    }

    if !config.check.is_empty() {
        writeln!(out, "  checks:")?;
        for check in &config.check {
            writeln!(out, "    - {}", check.name)?;
        }
    }

    if !config.rate.is_empty() {
        writeln!(out, "  rates:")?;
        for rate in &config.rate {
            writeln!(out, "    - {}", rate.name)?;
        }
    }

    if thresholds.is_empty() {
        writeln!(out, "  thresholds: none")?;
    } else {
        writeln!(out, "  thresholds:")?;
        for threshold in thresholds.iter() {
            let abort = if threshold.abort_on_fail {
                " (abort on fail)"
            } else {
                ""
            };
            writeln!(out, "    - {threshold}{abort}")?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_staged_config() {
        let config = LoadTestConfig::from_toml(
            r#"
[request]
url = "http://localhost:8080/"

[[check]]
name = "status is 200"
status = 200

[[stage]]
duration = "30s"
target = 10

[[stage]]
duration = "1m"
target = 50

[thresholds]
http_req_failed = [{ threshold = "rate<0.1", abort_on_fail = true }]
http_req_duration = "p(95)<5000"
"#,
        )
        .unwrap();

        let text = describe(&config).unwrap();
        assert!(text.contains("target:     http://localhost:8080/"), "{text}");
        assert!(text.contains("2 stage(s), peak 50 VUs, 1m 30s"), "{text}");
        assert!(text.contains("30s"), "{text}");
        assert!(text.contains("-> 50 VUs"), "{text}");
        assert!(text.contains("- status is 200"), "{text}");
        assert!(text.contains("http_req_failed: rate<0.1 (abort on fail)"), "{text}");
        assert!(text.contains("http_req_duration: p(95)<5000"), "{text}");
    }

    #[test]
    fn test_describe_flat_config_without_url() {
        let config =
            LoadTestConfig::from_toml("[settings]\nvus = 5\nduration = \"10s\"\n").unwrap();
        let text = describe(&config).unwrap();
        assert!(text.contains("(not set, pass --url)"), "{text}");
        assert!(text.contains("start:      5 VUs"), "{text}");
        assert!(text.contains("thresholds: none"), "{text}");
    }
}
