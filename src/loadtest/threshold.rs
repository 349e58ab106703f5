//! Threshold parsing and evaluation.
//!
//! A threshold is `<aggregation>[(<percentile>)] <op> <number>` attached to a
//! metric key (`name` or `name{tag:value}`). Parsing happens once, at config
//! load, against the known metric kinds; evaluation is a pure function of a
//! [`MetricsSnapshot`] and can run any number of times.
//!
//! | kind    | aggregations                  |
//! |---------|-------------------------------|
//! | trend   | `avg min max med p(N)`        |
//! | rate    | `rate`                        |
//! | counter | `count rate` (rate is per s)  |
//! | gauge   | `value min max`               |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::loadtest::config::ThresholdRules;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{split_series_key, MetricKind, MetricSnapshot, MetricsSnapshot};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*([a-z]+)(?:\(\s*([^)]*?)\s*\))?\s*(<=|>=|==|<|>)\s*([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*$",
    )
    .expect("threshold expression regex is valid")
});

static METRIC_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\{([^:{}]+):([^{}]*)\})?$")
        .expect("metric key regex is valid")
});

/// Aggregate a threshold reads from a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Trend mean.
    Avg,
    /// Trend or gauge minimum.
    Min,
    /// Trend or gauge maximum.
    Max,
    /// Trend median.
    Med,
    /// Trend percentile, `0 < p <= 100`.
    Percentile(f64),
    /// Counter total.
    Count,
    /// Rate fraction, or counter total per second.
    Rate,
    /// Gauge last value.
    Value,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
        }
    }
}

impl Aggregation {
    fn allowed_for(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_)
            ),
            MetricKind::Rate => matches!(self, Self::Rate),
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value | Self::Min | Self::Max),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
    /// `==`
    #[serde(rename = "==")]
    Eq,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            _ => return None,
        })
    }

    /// Applies the operator: `observed <op> bound`.
    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => {
                let scale = observed.abs().max(bound.abs()).max(1.0);
                (observed - bound).abs() <= f64::EPSILON * scale
            },
        }
    }
}

/// A parsed threshold rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    /// Metric key, possibly tag-qualified.
    pub metric: String,
    /// Kind of the underlying metric.
    pub kind: MetricKind,
    /// Aggregate being compared.
    pub aggregation: Aggregation,
    /// Operator.
    pub op: Comparison,
    /// Right-hand side.
    pub bound: f64,
    /// The expression as written.
    pub expression: String,
    /// Stop the run as soon as this rule fails.
    pub abort_on_fail: bool,
    /// Minimum run time before abort evaluation.
    #[serde(skip)]
    pub delay_abort_eval: Duration,
}

impl Threshold {
    /// Parses `expression` for `metric` given the known metric kinds.
    pub fn parse(
        metric: &str,
        expression: &str,
        kinds: &BTreeMap<String, MetricKind>,
    ) -> Result<Self, LoadTestError> {
        let invalid = |reason: String| LoadTestError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason,
        };

        let key = METRIC_KEY
            .captures(metric)
            .ok_or_else(|| invalid("metric key must be `name` or `name{tag:value}`".to_string()))?;
        let name = &key[1];
        let kind = *kinds
            .get(name)
            .ok_or_else(|| invalid(format!("unknown metric '{name}'")))?;

        let caps = EXPRESSION.captures(expression).ok_or_else(|| {
            invalid("expected `<aggregation> <op> <number>`, e.g. `p(95)<500`".to_string())
        })?;
        let word = &caps[1];
        let arg = caps.get(2).map(|m| m.as_str());

        let aggregation = match (word, arg) {
            ("p", Some(raw)) => {
                let p: f64 = raw
                    .parse()
                    .map_err(|_| invalid(format!("percentile '{raw}' is not a number")))?;
                if !(p > 0.0 && p <= 100.0) {
                    return Err(invalid(format!("percentile {p} must be in (0, 100]")));
                }
                Aggregation::Percentile(p)
            },
            ("p", None) => return Err(invalid("percentile needs an argument, e.g. p(95)".to_string())),
            (_, Some(_)) => return Err(invalid(format!("aggregation '{word}' takes no argument"))),
            ("avg", None) => Aggregation::Avg,
            ("min", None) => Aggregation::Min,
            ("max", None) => Aggregation::Max,
            ("med", None) => Aggregation::Med,
            ("count", None) => Aggregation::Count,
            ("rate", None) => Aggregation::Rate,
            ("value", None) => Aggregation::Value,
            _ => return Err(invalid(format!("unknown aggregation '{word}'"))),
        };

        if !aggregation.allowed_for(kind) {
            return Err(invalid(format!(
                "aggregation '{aggregation}' is not supported on {kind} metric '{name}'"
            )));
        }

        let op = Comparison::parse(&caps[3]).ok_or_else(|| invalid("unknown operator".to_string()))?;
        let bound: f64 = caps[4]
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a number", &caps[4])))?;

        Ok(Self {
            metric: metric.to_string(),
            kind,
            aggregation,
            op,
            bound,
            expression: expression.trim().to_string(),
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    /// Reads the aggregate from `snapshot`; `None` when the series has no
    /// samples.
    pub fn observe(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        let series = snapshot.get(&self.metric)?;
        if series.sample_count() == 0 {
            return None;
        }
        match (series, self.aggregation) {
            (MetricSnapshot::Trend(t), Aggregation::Avg) => Some(t.avg),
            (MetricSnapshot::Trend(t), Aggregation::Min) => Some(t.min),
            (MetricSnapshot::Trend(t), Aggregation::Max) => Some(t.max),
            (MetricSnapshot::Trend(t), Aggregation::Med) => t.percentile(50.0),
            (MetricSnapshot::Trend(t), Aggregation::Percentile(p)) => t.percentile(p),
            (MetricSnapshot::Rate { .. }, Aggregation::Rate) => series.rate(),
            (MetricSnapshot::Counter { total, .. }, Aggregation::Count) => Some(*total),
            (MetricSnapshot::Counter { per_second, .. }, Aggregation::Rate) => Some(*per_second),
            (MetricSnapshot::Gauge { value, .. }, Aggregation::Value) => Some(*value),
            (MetricSnapshot::Gauge { min, .. }, Aggregation::Min) => Some(*min),
            (MetricSnapshot::Gauge { max, .. }, Aggregation::Max) => Some(*max),
            _ => None,
        }
    }

    /// Evaluates against `snapshot`.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let observed = self.observe(snapshot);
        let outcome = match observed {
            None => ThresholdOutcome::NoData,
            Some(v) if self.op.holds(v, self.bound) => ThresholdOutcome::Passed,
            Some(_) => ThresholdOutcome::Failed,
        };
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            outcome,
        }
    }

    /// The untagged metric name.
    pub fn metric_name(&self) -> &str {
        split_series_key(&self.metric).0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expression)
    }
}

/// Outcome of one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOutcome {
    /// The comparison held.
    Passed,
    /// The comparison did not hold.
    Failed,
    /// The metric had no samples; counted as non-failing.
    NoData,
}

/// One evaluated threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    /// Metric key.
    pub metric: String,
    /// Expression as written.
    pub expression: String,
    /// Observed aggregate, if any.
    pub observed: Option<f64>,
    /// Verdict.
    pub outcome: ThresholdOutcome,
}

/// Every threshold result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThresholdReport {
    /// Results in declaration order (metric keys sorted).
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    /// `true` when no threshold failed. `NoData` does not fail.
    pub fn passed(&self) -> bool {
        !self
            .results
            .iter()
            .any(|r| r.outcome == ThresholdOutcome::Failed)
    }

    /// Failed thresholds.
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == ThresholdOutcome::Failed)
    }

    /// Results for one metric key.
    pub fn for_metric<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a ThresholdResult> + 'a {
        self.results.iter().filter(move |r| r.metric == metric)
    }

    /// Returns `true` when there are no thresholds.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// All thresholds of a scenario.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Parses the `[thresholds]` table.
    pub fn parse(
        rules: &BTreeMap<String, ThresholdRules>,
        kinds: &BTreeMap<String, MetricKind>,
    ) -> Result<Self, LoadTestError> {
        let mut thresholds = Vec::new();
        for (metric, metric_rules) in rules {
            for rule in metric_rules.rules() {
                let mut threshold = Threshold::parse(metric, rule.expression(), kinds)?;
                threshold.abort_on_fail = rule.abort_on_fail();
                threshold.delay_abort_eval = rule.delay_abort_eval();
                thresholds.push(threshold);
            }
        }
        Ok(Self { thresholds })
    }

    /// Number of thresholds.
    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    /// Returns `true` when there are no thresholds.
    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Iterates the parsed thresholds.
    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    /// Returns `true` when at least one rule aborts on failure.
    pub fn has_abort_rules(&self) -> bool {
        self.thresholds.iter().any(|t| t.abort_on_fail)
    }

    /// Evaluates every threshold against `snapshot`.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdReport {
        ThresholdReport {
            results: self.thresholds.iter().map(|t| t.evaluate(snapshot)).collect(),
        }
    }

    /// The first abort-on-fail rule that is past its delay and failing.
    pub fn abort_trigger(&self, snapshot: &MetricsSnapshot) -> Option<&Threshold> {
        self.thresholds.iter().find(|t| {
            t.abort_on_fail
                && snapshot.elapsed >= t.delay_abort_eval
                && t.evaluate(snapshot).outcome == ThresholdOutcome::Failed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::config::{HumanDuration, ThresholdRule};
    use crate::loadtest::metrics::{builtin_metrics, MetricRegistry};

    fn kinds() -> BTreeMap<String, MetricKind> {
        let mut kinds: BTreeMap<String, MetricKind> = builtin_metrics()
            .into_iter()
            .map(|(n, k)| (n.to_string(), k))
            .collect();
        kinds.insert("failed_requests".to_string(), MetricKind::Rate);
        kinds
    }

    fn parse(metric: &str, expr: &str) -> Result<Threshold, LoadTestError> {
        Threshold::parse(metric, expr, &kinds())
    }

    #[test]
    fn test_parse_grammar() {
        let t = parse("http_req_duration", "p(95)<5000").unwrap();
        assert_eq!(t.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(t.op, Comparison::Lt);
        assert_eq!(t.bound, 5000.0);
        assert_eq!(t.kind, MetricKind::Trend);

        let t = parse("http_req_failed", " rate <= 0.1 ").unwrap();
        assert_eq!(t.aggregation, Aggregation::Rate);
        assert_eq!(t.op, Comparison::Le);
        assert_eq!(t.expression, "rate <= 0.1");

        assert_eq!(parse("http_req_duration", "p(99.9)<1").unwrap().aggregation, Aggregation::Percentile(99.9));
        assert_eq!(parse("http_reqs", "count>=100").unwrap().op, Comparison::Ge);
        assert_eq!(parse("vus", "value==0").unwrap().op, Comparison::Eq);
        assert_eq!(parse("http_reqs{endpoint:homepage}", "rate>1").unwrap().kind, MetricKind::Counter);
    }

    #[test]
    fn test_percentile_out_of_range_is_rejected() {
        for expr in ["p(999)<1", "p(0)<1", "p(-5)<1", "p(100.5)<1"] {
            let err = parse("http_req_duration", expr).unwrap_err();
            assert!(
                matches!(err, LoadTestError::InvalidThreshold { .. }),
                "{expr} should be rejected"
            );
        }
        assert!(parse("http_req_duration", "p(100)<1").is_ok());
    }

    #[test]
    fn test_kind_mismatch_and_unknown_metric_rejected() {
        assert!(parse("http_req_failed", "p(95)<1").is_err());
        assert!(parse("http_req_duration", "rate<1").is_err());
        assert!(parse("http_req_duration", "value<1").is_err());
        assert!(parse("checks", "count>1").is_err());
        let err = parse("nope", "rate<1").unwrap_err();
        assert!(err.to_string().contains("unknown metric"));
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        for expr in ["", "p95<1", "avg", "avg < fast", "avg != 1", "avg(1)<2", "mean<2", "p()<1"] {
            assert!(parse("http_req_duration", expr).is_err(), "{expr:?} should be rejected");
        }
        assert!(parse("http_req_duration{bad", "avg<1").is_err());
    }

    #[test]
    fn test_evaluate_outcomes() {
        let registry = MetricRegistry::with_builtins();
        for i in 1..=100 {
            registry
                .record("http_req_duration", MetricKind::Trend, f64::from(i) * 10.0)
                .unwrap();
        }
        for i in 0..10 {
            registry.record_rate("http_req_failed", i == 0).unwrap();
        }
        let snap = registry.freeze();

        let pass = parse("http_req_duration", "p(95)<1000").unwrap().evaluate(&snap);
        assert_eq!(pass.outcome, ThresholdOutcome::Passed);
        let fail = parse("http_req_duration", "p(95)<500").unwrap().evaluate(&snap);
        assert_eq!(fail.outcome, ThresholdOutcome::Failed);
        assert!(fail.observed.unwrap() > 900.0);

        let rate = parse("http_req_failed", "rate<0.1").unwrap().evaluate(&snap);
        assert_eq!(rate.outcome, ThresholdOutcome::Failed, "0.1 is not < 0.1");
        let rate = parse("http_req_failed", "rate<=0.1").unwrap().evaluate(&snap);
        assert_eq!(rate.outcome, ThresholdOutcome::Passed);
    }

    #[test]
    fn test_empty_metrics_are_no_data() {
        let snap = MetricRegistry::with_builtins().freeze();
        for (metric, expr) in [
            ("http_req_duration", "p(95)<5000"),
            ("http_req_failed", "rate<0.1"),
            ("http_reqs", "count>0"),
            ("http_req_duration{endpoint:homepage}", "avg<1"),
        ] {
            let result = parse(metric, expr).unwrap().evaluate(&snap);
            assert_eq!(result.outcome, ThresholdOutcome::NoData, "{metric}: {expr}");
            assert_eq!(result.observed, None);
        }
        let report = ThresholdReport {
            results: vec![parse("http_req_duration", "p(95)<1").unwrap().evaluate(&snap)],
        };
        assert!(report.passed());
    }

    #[test]
    fn test_set_parse_and_abort_trigger() {
        let rules = BTreeMap::from([
            ("http_req_failed".to_string(), ThresholdRules::One("rate<0.1".to_string())),
            (
                "http_req_duration".to_string(),
                ThresholdRules::Many(vec![
                    ThresholdRule::Expr("p(95)<5000".to_string()),
                    ThresholdRule::Detailed {
                        threshold: "max<100".to_string(),
                        abort_on_fail: true,
                        delay_abort_eval: None,
                    },
                ]),
            ),
        ]);
        let set = ThresholdSet::parse(&rules, &kinds()).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.has_abort_rules());

        let registry = MetricRegistry::with_builtins();
        registry.record("http_req_duration", MetricKind::Trend, 50.0).unwrap();
        assert!(set.abort_trigger(&registry.snapshot()).is_none());
        registry.record("http_req_duration", MetricKind::Trend, 150.0).unwrap();
        let trigger = set.abort_trigger(&registry.snapshot()).unwrap();
        assert_eq!(trigger.expression, "max<100");

        let report = set.evaluate(&registry.freeze());
        assert!(!report.passed());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.for_metric("http_req_failed").next().unwrap().outcome, ThresholdOutcome::NoData);
    }

    #[test]
    fn test_abort_trigger_waits_for_delay() {
        let rules = BTreeMap::from([(
            "http_req_failed".to_string(),
            ThresholdRules::Many(vec![ThresholdRule::Detailed {
                threshold: "rate<0.1".to_string(),
                abort_on_fail: true,
                delay_abort_eval: Some(HumanDuration::secs(30)),
            }]),
        )]);
        let set = ThresholdSet::parse(&rules, &kinds()).unwrap();

        let registry = MetricRegistry::with_builtins();
        registry.record_rate("http_req_failed", true).unwrap();

        let mut snap = registry.snapshot();
        snap.elapsed = Duration::from_secs(29);
        assert_eq!(set.evaluate(&snap).results[0].outcome, ThresholdOutcome::Failed);
        assert!(set.abort_trigger(&snap).is_none(), "rule must not fire before its delay");

        snap.elapsed = Duration::from_secs(30);
        let trigger = set.abort_trigger(&snap).unwrap();
        assert_eq!(trigger.expression, "rate<0.1");
    }

    #[test]
    fn test_comparison_operators() {
        assert!(Comparison::Lt.holds(1.0, 2.0));
        assert!(!Comparison::Lt.holds(2.0, 2.0));
        assert!(Comparison::Le.holds(2.0, 2.0));
        assert!(Comparison::Gt.holds(3.0, 2.0));
        assert!(Comparison::Ge.holds(2.0, 2.0));
        assert!(Comparison::Eq.holds(0.1 + 0.2, 0.3));
        assert!(!Comparison::Eq.holds(1.0, 1.001));
    }
}
