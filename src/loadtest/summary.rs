//! k6-style terminal summary renderer for load test results.
//!
//! Produces a colorized, human-readable summary with:
//! - ASCII art header with the run shape
//! - A pass/fail line per check
//! - Dotted-line metric rows (metric.........: value), one per metric
//! - Threshold marks under the metric they apply to
//!
//! The renderer is a pure function: [`render_summary`] takes structured data
//! and returns a formatted [`String`]. No I/O, no side effects.
//!
//! Color coding is applied via the `colored` crate, which respects
//! the global override set by [`colored::control::set_override(false)`]
//! when `--no-color` is active or stdout is piped.

use colored::Colorize;
use std::time::Duration;

use crate::loadtest::checks::CHECK_TAG;
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::engine::LoadTestResult;
use crate::loadtest::metrics::{names, MetricSnapshot, MetricsSnapshot, TrendSnapshot};
use crate::loadtest::threshold::{ThresholdOutcome, ThresholdResult};

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 36;

/// Render a k6-style terminal summary from load test results.
///
/// # Layout
///
/// ```text
///           /\      |  loadramp
///          /  \     |
///     /\  /    \    |  target:     https://example.com
///    /  \/      \   |  stages:     2 (max 50 VUs)
///   /    \       \  |  duration:   1m 30s
///  /      \       \ |  thresholds: 2
///
///   ✓ status is 200
///   ✗ response time OK
///    ↳  97% — ✓ 970 / ✗ 30
///
///   checks.............................: 98.50% ✓ 1970 ✗ 30
///   http_req_duration..................: avg=120.00ms min=80.00ms med=110.00ms max=2.30s p(90)=180.00ms p(95)=250.00ms
///     ✓ p(95)<5000
///   http_req_failed....................: 1.00%  ✓ 10 ✗ 990
///     ✓ rate<0.1
///   http_reqs..........................: 1000 11.1/s
/// ```
pub fn render_summary(result: &LoadTestResult, config: &LoadTestConfig, url: &str) -> String {
    let snap = &result.snapshot;
    let profile = config.ramp_profile();
    let mut lines = Vec::new();

    lines.push(render_header(
        url,
        profile.stages.len(),
        profile.max_target(),
        profile.total_duration(),
        result.thresholds.results.len(),
    ));

    let check_lines = render_checks(snap);
    if !check_lines.is_empty() {
        lines.extend(check_lines);
        lines.push(String::new());
    }

    for (name, metric) in snap.metrics() {
        lines.push(format_metric_row(
            name,
            &format_metric_value(name, metric, result.elapsed),
            PAD_WIDTH,
        ));
        lines.extend(render_threshold_marks(result.thresholds.for_metric(name)));
    }

    // Thresholds on tagged series get their own row, like k6.
    let mut tagged: Vec<&str> = result
        .thresholds
        .results
        .iter()
        .map(|r| r.metric.as_str())
        .filter(|m| m.contains('{'))
        .collect();
    tagged.dedup();
    for key in tagged {
        let value = snap
            .get(key)
            .map_or_else(
                || "no data".dimmed().to_string(),
                |m| format_metric_value(key, m, result.elapsed),
            );
        lines.push(format_metric_row(&format!("  {{{}}}", tag_part(key)), &value, PAD_WIDTH));
        lines.extend(render_threshold_marks(result.thresholds.for_metric(key)));
    }

    lines.push(String::new());
    let status = format!(
        "{} after {} with {} max VUs",
        result.stop_reason,
        format_duration(result.elapsed),
        result.max_vus
    );
    lines.push(format!("  {status}"));
    if !result.drained {
        lines.push(format!(
            "  {} drain timeout elapsed before every virtual user stopped",
            "WARNING:".yellow().bold()
        ));
    }
    let verdict = if result.passed() {
        "thresholds passed".green().bold().to_string()
    } else {
        let failed = result.thresholds.failures().count();
        format!("{failed} threshold(s) failed").red().bold().to_string()
    };
    if !result.thresholds.is_empty() {
        lines.push(format!("  {verdict}"));
    }

    lines.join("\n")
}

/// Render the ASCII art header with the run shape.
fn render_header(url: &str, stages: usize, max_vus: u32, duration: Duration, thresholds: usize) -> String {
    format!(
        r#"
          /\      |  {}
         /  \     |
    /\  /    \    |  target:     {}
   /  \/      \   |  stages:     {} (max {} VUs)
  /    \       \  |  duration:   {}
 /      \       \ |  thresholds: {}
"#,
        "loadramp".bold(),
        url,
        stages,
        max_vus,
        format_duration(duration),
        thresholds,
    )
}

fn render_checks(snap: &MetricsSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    for (name, metric) in snap.tagged(names::CHECKS, CHECK_TAG) {
        let MetricSnapshot::Rate { passes, fails } = metric else {
            continue;
        };
        if *fails == 0 {
            lines.push(format!("  {} {name}", "✓".green()));
        } else {
            lines.push(format!("  {} {name}", "✗".red()));
            let pct = (*passes as f64 / (*passes + *fails) as f64 * 100.0).floor();
            lines.push(format!("   ↳  {pct}% — ✓ {passes} / ✗ {fails}").dimmed().to_string());
        }
    }
    lines
}

fn render_threshold_marks<'a>(results: impl Iterator<Item = &'a ThresholdResult>) -> Vec<String> {
    results
        .map(|r| {
            let mark = match r.outcome {
                ThresholdOutcome::Passed => "✓".green().to_string(),
                ThresholdOutcome::Failed => "✗".red().to_string(),
                ThresholdOutcome::NoData => "-".dimmed().to_string(),
            };
            let note = if r.outcome == ThresholdOutcome::NoData {
                " (no data)".dimmed().to_string()
            } else {
                String::new()
            };
            format!("    {mark} {}{note}", r.expression)
        })
        .collect()
}

fn tag_part(key: &str) -> &str {
    key.split_once('{')
        .map(|(_, rest)| rest.trim_end_matches('}'))
        .unwrap_or(key)
}

/// Renders the value column for one metric. Counter rates are per second of
/// the whole run.
fn format_metric_value(name: &str, metric: &MetricSnapshot, elapsed: Duration) -> String {
    let is_time = name.contains("duration");
    let is_bytes = name.starts_with("data_");
    match metric {
        MetricSnapshot::Counter { total, .. } => {
            let secs = elapsed.as_secs_f64();
            let per_second = if secs > 0.0 { total / secs } else { 0.0 };
            if is_bytes {
                format!("{} {}/s", format_bytes(*total), format_bytes(per_second))
            } else {
                format!("{} {:.1}/s", format_number(*total), per_second)
            }
        },
        MetricSnapshot::Rate { passes, fails } => {
            let rate = metric.rate().unwrap_or(0.0);
            let pct = format!("{:.2}%", rate * 100.0);
            let colored = if name == names::HTTP_REQ_FAILED && rate > 0.0 {
                pct.red().to_string()
            } else {
                pct
            };
            format!("{colored} ✓ {passes} ✗ {fails}")
        },
        MetricSnapshot::Trend(trend) => format_trend(trend, is_time),
        MetricSnapshot::Gauge {
            value, min, max, ..
        } => format!(
            "{} min={} max={}",
            format_number(*value),
            format_number(*min),
            format_number(*max)
        ),
    }
}

fn format_trend(trend: &TrendSnapshot, is_time: bool) -> String {
    if trend.count == 0 {
        return "no data".dimmed().to_string();
    }
    let fmt = |v: f64| {
        if is_time {
            format_ms(v)
        } else {
            format!("{v:.2}")
        }
    };
    let value = format!(
        "avg={} min={} med={} max={} p(90)={} p(95)={}",
        fmt(trend.avg),
        fmt(trend.min),
        fmt(trend.med),
        fmt(trend.max),
        fmt(trend.p90),
        fmt(trend.p95),
    );
    if is_time && trend.p95 >= 1000.0 {
        value.yellow().to_string()
    } else {
        value
    }
}

/// Milliseconds as `"123.45ms"` below a second, `"1.23s"` above.
pub(crate) fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{ms:.2}ms")
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v:.2}")
    }
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(d: Duration) -> String {
    humantime::format_duration(Duration::from_millis(d.as_millis() as u64)).to_string()
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::engine::StopReason;
    use crate::loadtest::metrics::{MetricKind, MetricRegistry};

    /// Disable colors in tests for deterministic assertions.
    fn setup_no_color() {
        colored::control::set_override(false);
    }

    const CONFIG: &str = r#"
[request]
url = "https://example.com"

[[stage]]
duration = "30s"
target = 10

[[stage]]
duration = "1m"
target = 50

[thresholds]
http_req_failed = "rate<0.1"
http_req_duration = "p(95)<5000"
"http_req_duration{endpoint:homepage}" = "avg<100"
"#;

    fn result() -> (LoadTestResult, LoadTestConfig) {
        let config = LoadTestConfig::from_toml(CONFIG).unwrap();
        let registry = MetricRegistry::with_builtins();
        for i in 0..100 {
            registry.record("http_reqs", MetricKind::Counter, 1.0).unwrap();
            registry
                .record("http_req_duration", MetricKind::Trend, 100.0 + f64::from(i))
                .unwrap();
            registry.record_rate("http_req_failed", i < 5).unwrap();
            registry.record_rate("checks", i >= 3).unwrap();
            registry.record_rate("checks{check:status is 200}", i >= 3).unwrap();
            registry.record_rate("checks", true).unwrap();
            registry.record_rate("checks{check:response time OK}", true).unwrap();
            registry.record("data_received", MetricKind::Counter, 1500.0).unwrap();
        }
        let snapshot = registry.freeze();
        let thresholds = config.thresholds().unwrap().evaluate(&snapshot);
        (
            LoadTestResult {
                snapshot,
                thresholds,
                elapsed: Duration::from_secs(90),
                stop_reason: StopReason::Completed,
                max_vus: 50,
                drained: true,
            },
            config,
        )
    }

    #[test]
    fn test_render_summary_contains_header() {
        setup_no_color();
        let (result, config) = result();
        let output = render_summary(&result, &config, "https://example.com");

        assert!(output.contains("loadramp"), "Missing header title");
        assert!(output.contains("https://example.com"), "Missing target URL");
        assert!(output.contains("2 (max 50 VUs)"), "Missing stage shape:\n{output}");
        assert!(output.contains("1m 30s"), "Missing duration:\n{output}");
    }

    #[test]
    fn test_render_summary_checks_section() {
        setup_no_color();
        let (result, config) = result();
        let output = render_summary(&result, &config, "https://example.com");

        assert!(output.contains("✓ response time OK"), "{output}");
        assert!(output.contains("✗ status is 200"), "{output}");
        assert!(output.contains("97% — ✓ 97 / ✗ 3"), "{output}");
    }

    #[test]
    fn test_render_summary_metric_rows_and_thresholds() {
        setup_no_color();
        let (result, config) = result();
        let output = render_summary(&result, &config, "https://example.com");

        assert!(output.contains("http_req_failed....."), "{output}");
        assert!(output.contains("5.00% ✓ 5 ✗ 95"), "{output}");
        assert!(output.contains("✓ rate<0.1"), "{output}");
        assert!(output.contains("✓ p(95)<5000"), "{output}");
        assert!(output.contains("http_reqs"), "{output}");
        assert!(output.contains("100 1.1/s"), "{output}");
        assert!(output.contains("150.0 kB"), "{output}");
        assert!(output.contains("{endpoint:homepage}"), "{output}");
        assert!(output.contains("- avg<100 (no data)"), "{output}");
        assert!(output.contains("thresholds passed"), "{output}");
    }

    #[test]
    fn test_render_summary_failed_threshold_verdict() {
        setup_no_color();
        let (mut result, config) = result();
        result.thresholds.results[0].outcome = ThresholdOutcome::Failed;
        let output = render_summary(&result, &config, "https://example.com");
        assert!(output.contains("1 threshold(s) failed"), "{output}");
    }

    #[test]
    fn test_render_summary_warns_when_not_drained() {
        setup_no_color();
        let (mut result, config) = result();
        let output = render_summary(&result, &config, "https://example.com");
        assert!(!output.contains("drain timeout elapsed"), "{output}");

        result.drained = false;
        let output = render_summary(&result, &config, "https://example.com");
        assert!(output.contains("WARNING: drain timeout elapsed"), "{output}");
    }

    #[test]
    fn test_format_metric_row_padding() {
        let row = format_metric_row("http_reqs", "100", 20);
        assert_eq!(row, "  http_reqs...........: 100");
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_ms(12.345), "12.35ms");
        assert_eq!(format_ms(2300.0), "2.30s");
        assert_eq!(format_bytes(999.0), "999 B");
        assert_eq!(format_bytes(1_500_000.0), "1.5 MB");
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
    }
}
