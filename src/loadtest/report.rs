//! JSON report serialization for load test results.
//!
//! Produces a schema-versioned JSON report file containing every metric
//! series, threshold verdicts, request error and status breakdowns, and the
//! resolved ramp configuration for reproducibility. Designed for CI/CD
//! pipeline consumption.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::loadtest::config::{LoadTestConfig, Stage};
use crate::loadtest::engine::{LoadTestResult, StopReason};
use crate::loadtest::metrics::{names, MetricSnapshot};
use crate::loadtest::threshold::ThresholdResult;

/// Schema version for the JSON report format.
///
/// Increment when making breaking changes to the report structure.
/// External tools key on this field to determine parser compatibility.
const SCHEMA_VERSION: &str = "1.0";

/// Directory (relative to the project root) that holds config and reports.
pub const STATE_DIR: &str = ".loadramp";

/// Top-level JSON report structure.
///
/// Self-contained: anyone reading just the JSON file should understand the
/// ramp that was run and what the verdict was.
#[derive(Debug, Serialize)]
pub struct LoadTestReport {
    /// Report format version for parser compatibility.
    pub schema_version: String,
    /// RFC 3339 timestamp when the report was generated.
    pub timestamp: String,
    /// Target URL that was tested.
    pub target_url: String,
    /// Actual test duration in seconds.
    pub duration_secs: f64,
    /// `true` when no threshold failed.
    pub passed: bool,
    /// Why the run stopped.
    pub stop_reason: StopReason,
    /// Largest VU pool size reached.
    pub max_vus: u32,
    /// `false` when VUs were still running after the drain timeout.
    pub drained: bool,
    /// Resolved configuration.
    pub config: ReportConfig,
    /// Every series of the final snapshot, keyed by series key.
    pub metrics: BTreeMap<String, MetricSnapshot>,
    /// Threshold verdicts in evaluation order.
    pub thresholds: Vec<ThresholdResult>,
    /// Failed request counts by error category (`timeout`, `network`).
    pub errors: BTreeMap<String, u64>,
    /// Request counts by response status; `0` means no response.
    pub status_counts: BTreeMap<String, u64>,
}

/// Resolved test configuration embedded in the report.
#[derive(Debug, Serialize)]
pub struct ReportConfig {
    /// VUs at the start of the first stage.
    pub start_vus: u32,
    /// The stages actually scheduled (flat load appears as one stage).
    pub stages: Vec<Stage>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Lower bound of the think time in milliseconds.
    pub think_time_min_ms: u64,
    /// Upper bound of the think time in milliseconds.
    pub think_time_max_ms: u64,
    /// Iteration limit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    /// Tags attached to every request.
    pub tags: BTreeMap<String, String>,
    /// Check names in declaration order.
    pub checks: Vec<String>,
}

impl LoadTestReport {
    /// Build a report from load test results, config, and target URL.
    pub fn from_result(result: &LoadTestResult, config: &LoadTestConfig, url: &str) -> Self {
        let snap = &result.snapshot;
        let profile = config.ramp_profile();

        let count_by = |tag: &str| -> BTreeMap<String, u64> {
            snap.tagged(names::HTTP_REQS, tag)
                .filter_map(|(value, metric)| match metric {
                    MetricSnapshot::Counter { total, .. } => Some((value.to_string(), *total as u64)),
                    _ => None,
                })
                .collect()
        };

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            target_url: url.to_string(),
            duration_secs: result.elapsed.as_secs_f64(),
            passed: result.passed(),
            stop_reason: result.stop_reason.clone(),
            max_vus: result.max_vus,
            drained: result.drained,
            config: ReportConfig {
                start_vus: profile.start_target,
                stages: profile.stages.clone(),
                timeout_ms: config.request_timeout().as_millis() as u64,
                think_time_min_ms: config.request.think_time.min.get().as_millis() as u64,
                think_time_max_ms: config.request.think_time.max.get().as_millis() as u64,
                iterations: config.settings.iterations,
                tags: config.request.tags.clone(),
                checks: config.check.iter().map(|c| c.name.clone()).collect(),
            },
            metrics: snap.series.clone(),
            thresholds: result.thresholds.results.clone(),
            errors: count_by("error"),
            status_counts: count_by("status"),
        }
    }
}

/// Write a JSON report file to the `.loadramp/reports/` directory.
///
/// Creates the reports directory if it does not exist. Returns the path to
/// the written report file.
pub fn write_report(report: &LoadTestReport, base_dir: &Path) -> Result<PathBuf, std::io::Error> {
    let reports_dir = base_dir.join(STATE_DIR).join("reports");
    std::fs::create_dir_all(&reports_dir)?;

    let report_path = reports_dir.join(report_filename(&chrono::Utc::now()));
    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(&report_path, json)?;

    Ok(report_path)
}

/// Generate the report filename for a given timestamp.
///
/// Uses hyphens instead of colons for cross-platform filename compatibility.
pub fn report_filename(timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    format!("loadtest-{}.json", timestamp.format("%Y-%m-%dT%H-%M-%S"))
}
