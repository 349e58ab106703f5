//! `loadramp init` command implementation.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use loadramp::loadtest::report::STATE_DIR;

/// Execute the `init` command.
///
/// Creates `.loadramp/loadtest.toml` under `base_dir` from the named
/// template. Refuses to overwrite an existing file unless `force` is set.
pub fn execute_init(base_dir: &Path, template: &str, force: bool) -> Result<ExitCode> {
    let config_dir = base_dir.join(STATE_DIR);
    let config_path = config_dir.join("loadtest.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            config_path.display()
        );
    }

    let content = match template {
        "stress" => stress_template(),
        _ => hpa_template(),
    };

    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(&config_path, content)?;
    eprintln!("Created {}", config_path.display());
    eprintln!("Set request.url (or pass --url) and run `loadramp run`.");

    Ok(ExitCode::SUCCESS)
}

/// Ramp up to 150 VUs and back down, for watching an autoscaler react.
fn hpa_template() -> &'static str {
    r#"# loadramp scenario: autoscaling ramp
#
# Ramps to 150 virtual users over ~5 minutes and back down, so replica counts
# can be watched scaling up at each plateau and down again at the end.

[settings]
# Grace period for in-flight iterations once the last stage ends
drain_timeout = "30s"

[request]
# Target URL (or pass --url / set LOADRAMP_URL)
url = "http://localhost:8080/"
timeout = "30s"
tags = { endpoint = "homepage" }
# Each VU pauses a random 1-4s between iterations
think_time = { min = "1s", max = "4s" }

[[check]]
name = "status is 200"
status = 200

[[check]]
name = "response time OK"
max_duration = "10s"

# Calm
[[stage]]
duration = "30s"
target = 10

# Medium load
[[stage]]
duration = "1m"
target = 50

# High load
[[stage]]
duration = "2m"
target = 100

# Peak
[[stage]]
duration = "1m"
target = 150

# Scale down
[[stage]]
duration = "1m"
target = 20

[[stage]]
duration = "30s"
target = 0

[thresholds]
http_req_failed = ["rate<0.1"]
http_req_duration = ["p(95)<5000"]
"#
}

/// Longer ramp to 200 VUs with strict error and latency budgets.
fn stress_template() -> &'static str {
    r#"# loadramp scenario: stress ramp
#
# Gradual 5 minute ramp to 100 VUs, 5 minutes climbing to 200, then 5 minutes
# back down to zero.

[request]
# Target URL (or pass --url / set LOADRAMP_URL)
url = "http://localhost:8080/"
tags = { endpoint = "homepage" }
think_time = { min = "0s", max = "2s" }

[[check]]
name = "status is 200"
status = 200

[[check]]
name = "response time < 2s"
max_duration = "2s"

# Fraction of requests that did not return 200
[[rate]]
name = "failed_requests"
status_not = 200

[[stage]]
duration = "1m"
target = 10

[[stage]]
duration = "2m"
target = 50

[[stage]]
duration = "2m"
target = 100

[[stage]]
duration = "5m"
target = 200

[[stage]]
duration = "2m"
target = 50

[[stage]]
duration = "3m"
target = 0

[thresholds]
http_req_failed = ["rate<0.01"]
http_req_duration = ["p(95)<2000"]
# failed_requests = ["rate<0.01"]
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadramp::loadtest::config::LoadTestConfig;
    use std::time::Duration;

    #[test]
    fn test_hpa_template_parses() {
        let config = LoadTestConfig::from_toml(hpa_template()).unwrap();
        let profile = config.ramp_profile();
        assert_eq!(profile.stages.len(), 6);
        assert_eq!(profile.max_target(), 150);
        assert_eq!(profile.total_duration(), Duration::from_secs(360));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.check.len(), 2);
        assert_eq!(config.thresholds().unwrap().len(), 2);
    }

    #[test]
    fn test_stress_template_parses() {
        let config = LoadTestConfig::from_toml(stress_template()).unwrap();
        let profile = config.ramp_profile();
        assert_eq!(profile.max_target(), 200);
        assert_eq!(profile.total_duration(), Duration::from_secs(15 * 60));
        assert_eq!(config.rate.len(), 1);
        assert_eq!(config.rate[0].name, "failed_requests");
    }

    #[test]
    fn test_init_writes_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        execute_init(dir.path(), "hpa", false).unwrap();
        let path = dir.path().join(".loadramp").join("loadtest.toml");
        assert!(path.is_file());

        let err = execute_init(dir.path(), "stress", false).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        execute_init(dir.path(), "stress", true).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("failed_requests"));
    }
}
