//! TOML-based load test scenario configuration.
//!
//! A scenario file describes the ramp profile, the request every virtual user
//! issues per iteration, the checks run against each response, custom rate
//! metrics and the thresholds that decide the verdict.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! timeout = "30s"
//!
//! [request]
//! url = "https://example.com"
//! tags = { endpoint = "homepage" }
//! think_time = { min = "1s", max = "4s" }
//!
//! [[stage]]
//! duration = "30s"
//! target = 10
//!
//! [[stage]]
//! duration = "1m"
//! target = 50
//!
//! [[check]]
//! name = "status is 200"
//! status = 200
//!
//! [[rate]]
//! name = "failed_requests"
//! status_not = 200
//!
//! [thresholds]
//! http_req_failed = "rate<0.1"
//! http_req_duration = ["p(95)<5000", "avg<1000"]
//! ```
//!
//! Durations accept humantime strings (`"30s"`, `"1m30s"`, `"500ms"`),
//! integer seconds or float seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::loadtest::client::{Response, RESERVED_TAGS};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::builtin_metrics;
use crate::loadtest::scheduler::RampProfile;
use crate::loadtest::threshold::ThresholdSet;

/// A [`Duration`] that deserializes from `"30s"`-style strings or seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    /// Shorthand for whole seconds.
    pub const fn secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Shorthand for milliseconds.
    pub const fn millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// The wrapped duration.
    pub fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("duration as string (e.g. 30s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(HumanDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(HumanDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a finite, non-negative number"));
                }
                Ok(HumanDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v).map_err(E::custom)?;
                Ok(HumanDuration(d))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// A load-shaping stage: ramp linearly to `target` VUs over `duration`.
///
/// Stages are defined as `[[stage]]` blocks; the first stage ramps from
/// `settings.start_vus`, each later one from the previous stage's target.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Length of the ramp segment. Must be positive.
    pub duration: HumanDuration,
    /// Number of virtual users reached at the end of the stage.
    pub target: u32,
}

impl Stage {
    /// Convenience constructor.
    pub fn new(duration: Duration, target: u32) -> Self {
        Self {
            duration: HumanDuration(duration),
            target,
        }
    }
}

/// Top-level load test configuration parsed from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoadTestConfig {
    /// General execution settings.
    #[serde(default)]
    pub settings: Settings,
    /// The request issued once per iteration.
    #[serde(default)]
    pub request: RequestSpec,
    /// Named checks run against every response.
    #[serde(default)]
    pub check: Vec<CheckSpec>,
    /// Custom rate metrics fed once per iteration.
    #[serde(default)]
    pub rate: Vec<CustomRate>,
    /// Load-shaping stages.
    ///
    /// The field name is `stage` (not `stages`) because TOML `[[stage]]`
    /// array-of-tables syntax creates a key called `stage`.
    #[serde(default)]
    pub stage: Vec<Stage>,
    /// Metric key to threshold rules.
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdRules>,
}

/// General load test settings controlling execution parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Flat-load VU count, used when no `[[stage]]` is present.
    pub vus: Option<u32>,
    /// Flat-load duration, used when no `[[stage]]` is present.
    pub duration: Option<HumanDuration>,
    /// VU count the first stage ramps from.
    pub start_vus: u32,
    /// Per-request timeout.
    pub timeout: HumanDuration,
    /// How long to wait for VUs to finish their iteration after the run ends.
    pub drain_timeout: HumanDuration,
    /// Scheduler tick interval.
    pub tick: HumanDuration,
    /// Stop the run after this many iterations across all VUs.
    pub iterations: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vus: None,
            duration: None,
            start_vus: 0,
            timeout: HumanDuration::secs(60),
            drain_timeout: HumanDuration::secs(30),
            tick: HumanDuration::millis(200),
            iterations: None,
        }
    }
}

/// The request each iteration issues.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct RequestSpec {
    /// Target URL; `--url` on the command line overrides it.
    pub url: Option<String>,
    /// Per-request timeout, overriding `settings.timeout`.
    pub timeout: Option<HumanDuration>,
    /// Tags attached to every request metric sample.
    pub tags: BTreeMap<String, String>,
    /// Pause after each iteration, drawn uniformly from `[min, max]`.
    pub think_time: ThinkTime,
}

/// Uniform think-time range.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ThinkTime {
    /// Lower bound (inclusive).
    pub min: HumanDuration,
    /// Upper bound (inclusive).
    pub max: HumanDuration,
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self {
            min: HumanDuration::secs(1),
            max: HumanDuration::secs(1),
        }
    }
}

/// Declarative response conditions. All given conditions must hold.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Condition {
    /// Status must equal this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Status must differ from this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_not: Option<u16>,
    /// Response must arrive strictly faster than this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<HumanDuration>,
    /// Body must contain this substring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,
}

impl Condition {
    /// Returns `true` when no condition is set.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.status_not.is_none()
            && self.max_duration.is_none()
            && self.body_contains.is_none()
    }

    /// Evaluates every set condition against `response`.
    pub fn matches(&self, response: &Response) -> bool {
        if let Some(status) = self.status {
            if response.status != status {
                return false;
            }
        }
        if let Some(status) = self.status_not {
            if response.status == status {
                return false;
            }
        }
        if let Some(max) = self.max_duration {
            if response.duration >= max.0 {
                return false;
            }
        }
        if let Some(needle) = &self.body_contains {
            if !response.body_text().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A named `[[check]]`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CheckSpec {
    /// Check name, used as the `check` tag value.
    pub name: String,
    /// Conditions that must hold for the check to pass.
    #[serde(flatten)]
    pub condition: Condition,
}

/// A custom `[[rate]]` metric: one sample per iteration, non-zero when the
/// condition holds.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CustomRate {
    /// Metric name.
    pub name: String,
    /// Conditions counted as a "true" sample.
    #[serde(flatten)]
    pub condition: Condition,
}

/// Threshold rules for one metric key: a single expression or a list.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ThresholdRules {
    /// `http_req_failed = "rate<0.1"`
    One(String),
    /// `http_req_duration = ["p(95)<5000", { threshold = "p(99)<8000", abort_on_fail = true }]`
    Many(Vec<ThresholdRule>),
}

/// One threshold rule, either a bare expression or a rule table.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ThresholdRule {
    /// Bare expression string.
    Expr(String),
    /// Rule table with abort options.
    Detailed {
        /// The expression.
        threshold: String,
        /// Stop the run as soon as the rule fails.
        #[serde(default)]
        abort_on_fail: bool,
        /// Do not evaluate for abort before this much run time.
        #[serde(default)]
        delay_abort_eval: Option<HumanDuration>,
    },
}

impl ThresholdRule {
    /// The expression text.
    pub fn expression(&self) -> &str {
        match self {
            Self::Expr(expr) => expr,
            Self::Detailed { threshold, .. } => threshold,
        }
    }

    /// Whether a failure aborts the run.
    pub fn abort_on_fail(&self) -> bool {
        matches!(
            self,
            Self::Detailed {
                abort_on_fail: true,
                ..
            }
        )
    }

    /// Minimum run time before abort evaluation starts.
    pub fn delay_abort_eval(&self) -> Duration {
        match self {
            Self::Detailed {
                delay_abort_eval: Some(delay),
                ..
            } => delay.0,
            _ => Duration::ZERO,
        }
    }
}

impl ThresholdRules {
    /// Flattens to a list of rules.
    pub fn rules(&self) -> Vec<ThresholdRule> {
        match self {
            Self::One(expr) => vec![ThresholdRule::Expr(expr.clone())],
            Self::Many(rules) => rules.clone(),
        }
    }
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a [`LoadTestConfig`] from a file path.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read,
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed, or a
    /// validation error if the content is semantically invalid.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Returns `true` if the config defines load-shaping stages.
    pub fn has_stages(&self) -> bool {
        !self.stage.is_empty()
    }

    /// The ramp profile the scheduler follows.
    ///
    /// Flat load (`vus` + `duration`) becomes a profile starting at `vus` with
    /// a single stage holding `vus` for `duration`.
    pub fn ramp_profile(&self) -> RampProfile {
        if self.has_stages() {
            return RampProfile::new(self.settings.start_vus, self.stage.clone());
        }
        match (self.settings.vus, self.settings.duration) {
            (Some(vus), Some(duration)) => RampProfile::new(vus, vec![Stage {
                duration,
                target: vus,
            }]),
            _ => RampProfile::new(0, Vec::new()),
        }
    }

    /// The effective per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request.timeout.unwrap_or(self.settings.timeout).0
    }

    /// Parses every threshold rule against the known metric kinds.
    pub fn thresholds(&self) -> Result<ThresholdSet, LoadTestError> {
        ThresholdSet::parse(&self.thresholds, &self.metric_kinds())
    }

    /// Built-in metrics plus the custom rates this config declares.
    pub fn metric_kinds(&self) -> BTreeMap<String, crate::loadtest::metrics::MetricKind> {
        let mut kinds: BTreeMap<String, _> = builtin_metrics()
            .into_iter()
            .map(|(name, kind)| (name.to_string(), kind))
            .collect();
        for rate in &self.rate {
            kinds.insert(rate.name.clone(), crate::loadtest::metrics::MetricKind::Rate);
        }
        kinds
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks:
    /// - Either `[[stage]]` blocks or both `settings.vus` and `settings.duration`
    /// - Each stage has a positive duration
    /// - The tick interval and request timeouts are positive
    /// - `think_time.min <= think_time.max`
    /// - The URL, when set, parses as http(s)
    /// - Request tags do not use the keys the client sets itself
    /// - Checks and custom rates are named, have at least one condition, and
    ///   custom rate names do not shadow built-in metrics
    /// - Every threshold parses and targets a known metric
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.has_stages() {
            for (i, stage) in self.stage.iter().enumerate() {
                if stage.duration.0.is_zero() {
                    return Err(LoadTestError::validation(format!(
                        "Stage {} has duration 0; each stage must have a positive duration",
                        i + 1
                    )));
                }
            }
            if self.settings.vus.is_some() || self.settings.duration.is_some() {
                tracing::warn!("settings.vus and settings.duration are ignored when [[stage]] blocks are present");
            }
        } else {
            match (self.settings.vus, self.settings.duration) {
                (Some(_), Some(duration)) if duration.0.is_zero() => {
                    return Err(LoadTestError::validation(
                        "settings.duration must be positive",
                    ));
                },
                (Some(_), Some(_)) => {},
                _ => {
                    return Err(LoadTestError::validation(
                        "Config must contain [[stage]] blocks or both settings.vus and settings.duration",
                    ));
                },
            }
        }

        if self.settings.tick.0.is_zero() {
            return Err(LoadTestError::validation("settings.tick must be positive"));
        }
        if self.settings.timeout.0.is_zero() {
            return Err(LoadTestError::validation("settings.timeout must be positive"));
        }
        if self.request.timeout.is_some_and(|t| t.0.is_zero()) {
            return Err(LoadTestError::validation("request.timeout must be positive"));
        }

        let think = self.request.think_time;
        if think.min > think.max {
            return Err(LoadTestError::validation(format!(
                "request.think_time min ({}) is greater than max ({})",
                think.min, think.max
            )));
        }

        if let Some(raw) = &self.request.url {
            validate_url(raw)?;
        }

        if let Some(key) = self.request.tags.keys().find(|k| RESERVED_TAGS.contains(&k.as_str())) {
            return Err(LoadTestError::validation(format!(
                "request.tags must not use the reserved key '{key}'"
            )));
        }

        for check in &self.check {
            if check.name.trim().is_empty() {
                return Err(LoadTestError::validation("[[check]] name must not be empty"));
            }
            if check.condition.is_empty() {
                return Err(LoadTestError::validation(format!(
                    "Check '{}' has no condition; set status, status_not, max_duration or body_contains",
                    check.name
                )));
            }
        }

        for rate in &self.rate {
            if rate.name.trim().is_empty() || rate.name.contains(['{', '}']) {
                return Err(LoadTestError::validation(format!(
                    "Invalid [[rate]] name '{}'",
                    rate.name
                )));
            }
            if builtin_metrics().iter().any(|(name, _)| *name == rate.name) {
                return Err(LoadTestError::validation(format!(
                    "[[rate]] '{}' shadows a built-in metric",
                    rate.name
                )));
            }
            if rate.condition.is_empty() {
                return Err(LoadTestError::validation(format!(
                    "Rate '{}' has no condition",
                    rate.name
                )));
            }
        }

        self.thresholds()?;
        Ok(())
    }
}

/// Checks that `raw` is an absolute http(s) URL.
pub fn validate_url(raw: &str) -> Result<url::Url, LoadTestError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| LoadTestError::validation(format!("Invalid URL '{raw}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(LoadTestError::validation(format!(
            "Unsupported URL scheme '{other}' in '{raw}'; only http and https are supported"
        ))),
    }
}
