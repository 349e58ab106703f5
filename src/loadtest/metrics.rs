//! Run-scoped metric registry with HdrHistogram-backed trends.
//!
//! Provides [`MetricRegistry`], the single shared-mutable resource of a run.
//! Virtual users record into it concurrently; the engine reads periodic
//! snapshots for live display and abort-on-fail thresholds, then freezes it
//! at the end of the run for the final verdict.
//!
//! # Design
//!
//! - **Per-series locking**: the series map sits behind an `RwLock` and every
//!   series has its own `Mutex`, so writers to different metrics never contend
//!   and no update is lost.
//! - **Four kinds**: counters (monotonic sum), rates (exact pass/total counts),
//!   trends (HdrHistogram plus exact min/max/sum) and gauges (last value).
//! - **Tagged series**: [`MetricRegistry::record_tagged`] also writes one
//!   sub-metric per tag, keyed `name{tag:value}`.
//! - **Freeze**: after [`MetricRegistry::freeze`] every write is discarded, so
//!   the final snapshot cannot change underneath threshold evaluation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;

use crate::loadtest::error::MetricError;

/// Trend values are stored in the histogram in thousandths of their unit
/// (microseconds for millisecond trends).
const TREND_SCALE: f64 = 1000.0;

/// Names of the metrics the engine records on its own.
pub mod names {
    /// Counter: number of HTTP requests issued.
    pub const HTTP_REQS: &str = "http_reqs";
    /// Trend: request duration in milliseconds.
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    /// Rate: fraction of requests that errored or returned an unexpected status.
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    /// Counter: response body bytes received.
    pub const DATA_RECEIVED: &str = "data_received";
    /// Counter: completed script iterations.
    pub const ITERATIONS: &str = "iterations";
    /// Trend: iteration duration in milliseconds, think time included.
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// Rate: fraction of passed checks.
    pub const CHECKS: &str = "checks";
    /// Gauge: currently running virtual users.
    pub const VUS: &str = "vus";
    /// Gauge: the largest pool size reached so far.
    pub const VUS_MAX: &str = "vus_max";
}

/// The kind of a metric, which decides how samples are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic sum.
    Counter,
    /// Fraction of non-zero samples.
    Rate,
    /// Distribution of samples.
    Trend,
    /// Last recorded value.
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Trend => "trend",
            Self::Gauge => "gauge",
        };
        f.write_str(s)
    }
}

/// The built-in metrics and their kinds, in summary order.
pub fn builtin_metrics() -> [(&'static str, MetricKind); 9] {
    [
        (names::CHECKS, MetricKind::Rate),
        (names::DATA_RECEIVED, MetricKind::Counter),
        (names::HTTP_REQ_DURATION, MetricKind::Trend),
        (names::HTTP_REQ_FAILED, MetricKind::Rate),
        (names::HTTP_REQS, MetricKind::Counter),
        (names::ITERATION_DURATION, MetricKind::Trend),
        (names::ITERATIONS, MetricKind::Counter),
        (names::VUS, MetricKind::Gauge),
        (names::VUS_MAX, MetricKind::Gauge),
    ]
}

/// Builds the registry key of a single-tag sub-metric: `name{tag:value}`.
pub fn series_key(name: &str, tag: &str, value: &str) -> String {
    format!("{name}{{{tag}:{value}}}")
}

/// Splits a series key into its metric name and optional `(tag, value)` pair.
pub fn split_series_key(key: &str) -> (&str, Option<(&str, &str)>) {
    let Some(open) = key.find('{') else {
        return (key, None);
    };
    let name = &key[..open];
    let inner = key[open + 1..].trim_end_matches('}');
    match inner.split_once(':') {
        Some((tag, value)) => (name, Some((tag, value))),
        None => (name, None),
    }
}

struct TrendAggregate {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendAggregate {
    fn new() -> Self {
        let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
        histogram.auto(true);
        Self {
            histogram,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, value: f64) {
        let _ = self.histogram.record((value * TREND_SCALE).round() as u64);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn snapshot(&self) -> TrendSnapshot {
        if self.count == 0 {
            return TrendSnapshot::empty();
        }
        let mut snap = TrendSnapshot {
            count: self.count,
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            med: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            histogram: Some(self.histogram.clone()),
        };
        snap.med = snap.percentile(50.0).unwrap_or_default();
        snap.p90 = snap.percentile(90.0).unwrap_or_default();
        snap.p95 = snap.percentile(95.0).unwrap_or_default();
        snap.p99 = snap.percentile(99.0).unwrap_or_default();
        snap
    }
}

enum Aggregate {
    Counter { total: f64, samples: u64 },
    Rate { passes: u64, total: u64 },
    Trend(Box<TrendAggregate>),
    Gauge { value: f64, min: f64, max: f64, set: bool },
}

impl Aggregate {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter {
                total: 0.0,
                samples: 0,
            },
            MetricKind::Rate => Self::Rate {
                passes: 0,
                total: 0,
            },
            MetricKind::Trend => Self::Trend(Box::new(TrendAggregate::new())),
            MetricKind::Gauge => Self::Gauge {
                value: 0.0,
                min: 0.0,
                max: 0.0,
                set: false,
            },
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
            Self::Gauge { .. } => MetricKind::Gauge,
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            Self::Counter { total, samples } => {
                *total += value;
                *samples += 1;
            },
            Self::Rate { passes, total } => {
                if value != 0.0 {
                    *passes += 1;
                }
                *total += 1;
            },
            Self::Trend(trend) => trend.add(value),
            Self::Gauge {
                value: last,
                min,
                max,
                set,
            } => {
                if *set {
                    *min = min.min(value);
                    *max = max.max(value);
                } else {
                    *min = value;
                    *max = value;
                    *set = true;
                }
                *last = value;
            },
        }
    }

    fn snapshot(&self, elapsed: Duration) -> MetricSnapshot {
        match self {
            Self::Counter { total, samples } => {
                let secs = elapsed.as_secs_f64();
                MetricSnapshot::Counter {
                    total: *total,
                    samples: *samples,
                    per_second: if secs > 0.0 { total / secs } else { 0.0 },
                }
            },
            Self::Rate { passes, total } => MetricSnapshot::Rate {
                passes: *passes,
                fails: total - passes,
            },
            Self::Trend(trend) => MetricSnapshot::Trend(trend.snapshot()),
            Self::Gauge {
                value,
                min,
                max,
                set,
            } => MetricSnapshot::Gauge {
                value: *value,
                min: *min,
                max: *max,
                samples: u64::from(*set),
            },
        }
    }
}

/// Point-in-time view of a trend.
///
/// All values are in the unit the samples were recorded in (milliseconds for
/// the built-in duration trends). The histogram is kept so thresholds can ask
/// for arbitrary percentiles after the run.
#[derive(Debug, Clone, Serialize)]
pub struct TrendSnapshot {
    /// Number of samples.
    pub count: u64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub avg: f64,
    /// Median.
    pub med: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
    #[serde(skip)]
    histogram: Option<Histogram<u64>>,
}

impl TrendSnapshot {
    fn empty() -> Self {
        Self {
            count: 0,
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            med: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            histogram: None,
        }
    }

    /// Value at percentile `p` (`0 < p <= 100`), or `None` without samples.
    ///
    /// Histogram precision is three significant figures; the result is clamped
    /// to the exact observed min/max.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let histogram = self.histogram.as_ref()?;
        if self.count == 0 {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let raw = histogram.value_at_quantile(quantile) as f64 / TREND_SCALE;
        Some(raw.clamp(self.min, self.max))
    }
}

/// Point-in-time view of one metric series.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSnapshot {
    /// Counter state.
    Counter {
        /// Sum of all samples.
        total: f64,
        /// Number of samples.
        samples: u64,
        /// `total` divided by elapsed run time.
        per_second: f64,
    },
    /// Rate state. Counts are exact, so `passes + fails` is the sample count.
    Rate {
        /// Non-zero samples.
        passes: u64,
        /// Zero samples.
        fails: u64,
    },
    /// Trend state.
    Trend(TrendSnapshot),
    /// Gauge state.
    Gauge {
        /// Last recorded value.
        value: f64,
        /// Smallest recorded value.
        min: f64,
        /// Largest recorded value.
        max: f64,
        /// 0 if never recorded, 1 otherwise.
        samples: u64,
    },
}

impl MetricSnapshot {
    /// The kind of the underlying metric.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
            Self::Gauge { .. } => MetricKind::Gauge,
        }
    }

    /// Number of samples recorded into this series.
    pub fn sample_count(&self) -> u64 {
        match self {
            Self::Counter { samples, .. } | Self::Gauge { samples, .. } => *samples,
            Self::Rate { passes, fails } => passes + fails,
            Self::Trend(trend) => trend.count,
        }
    }

    /// Pass fraction of a rate, `None` for other kinds or an empty rate.
    pub fn rate(&self) -> Option<f64> {
        match self {
            Self::Rate { passes, fails } if passes + fails > 0 => {
                Some(*passes as f64 / (passes + fails) as f64)
            },
            _ => None,
        }
    }

    /// The trend view, if this is a trend.
    pub fn as_trend(&self) -> Option<&TrendSnapshot> {
        match self {
            Self::Trend(trend) => Some(trend),
            _ => None,
        }
    }
}

/// Point-in-time view of every series in a registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Time since the registry was created.
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Every series, sorted by key.
    pub series: BTreeMap<String, MetricSnapshot>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl MetricsSnapshot {
    /// Looks up a series by key (`name` or `name{tag:value}`).
    pub fn get(&self, key: &str) -> Option<&MetricSnapshot> {
        self.series.get(key)
    }

    /// Looks up a trend series.
    pub fn trend(&self, key: &str) -> Option<&TrendSnapshot> {
        self.get(key).and_then(MetricSnapshot::as_trend)
    }

    /// Pass fraction of a rate series, `None` when absent or empty.
    pub fn rate(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(MetricSnapshot::rate)
    }

    /// Total of a counter series, zero when absent.
    pub fn counter_total(&self, key: &str) -> f64 {
        match self.get(key) {
            Some(MetricSnapshot::Counter { total, .. }) => *total,
            _ => 0.0,
        }
    }

    /// Top-level metrics (series without a tag qualifier), sorted by name.
    pub fn metrics(&self) -> impl Iterator<Item = (&str, &MetricSnapshot)> {
        self.series
            .iter()
            .filter(|(key, _)| !key.contains('{'))
            .map(|(key, snap)| (key.as_str(), snap))
    }

    /// Sub-metrics of `name` tagged with `tag`, as `(tag value, snapshot)`.
    pub fn tagged<'a>(
        &'a self,
        name: &'a str,
        tag: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a MetricSnapshot)> + 'a {
        self.series.iter().filter_map(move |(key, snap)| {
            match split_series_key(key) {
                (n, Some((t, value))) if n == name && t == tag => Some((value, snap)),
                _ => None,
            }
        })
    }

    /// Returns `true` when no series has received a sample.
    pub fn is_empty(&self) -> bool {
        self.series.values().all(|s| s.sample_count() == 0)
    }
}

struct Series {
    aggregate: Aggregate,
}

/// Thread-safe, run-scoped metric registry.
///
/// Created by the engine at run start and shared by reference (`Arc`) with
/// every component that records. Not a process global: two engines in one
/// process have independent registries.
///
/// # Example
///
/// ```
/// use loadramp::loadtest::metrics::{MetricKind, MetricRegistry};
///
/// let registry = MetricRegistry::new();
/// registry.record("failed_requests", MetricKind::Rate, 1.0).unwrap();
/// registry.record("failed_requests", MetricKind::Rate, 0.0).unwrap();
///
/// let snap = registry.snapshot();
/// assert_eq!(snap.rate("failed_requests"), Some(0.5));
/// ```
pub struct MetricRegistry {
    series: RwLock<HashMap<String, Arc<Mutex<Series>>>>,
    frozen: AtomicBool,
    started: Instant,
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("series", &self.series.read().len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Creates an empty registry. Elapsed time for counter rates starts now.
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Creates a registry with the built-in metrics already declared, so they
    /// show up in snapshots (empty) even when nothing was recorded.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (name, kind) in builtin_metrics() {
            let _ = registry.register(name, kind);
        }
        registry
    }

    /// Declares a metric without recording a sample.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        self.series_for(name, kind).map(|_| ())
    }

    /// The kind a series was registered with, if it exists.
    pub fn kind_of(&self, key: &str) -> Option<MetricKind> {
        let series = self.series.read().get(key).cloned()?;
        let kind = series.lock().aggregate.kind();
        Some(kind)
    }

    /// Records one sample. Writes after [`MetricRegistry::freeze`] are discarded.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64) -> Result<(), MetricError> {
        if kind == MetricKind::Trend && !(value.is_finite() && value >= 0.0) {
            return Err(MetricError::InvalidSample {
                name: name.to_owned(),
                value,
            });
        }
        let series = self.series_for(name, kind)?;
        let mut guard = series.lock();
        // Checked under the series lock so a freeze that has started
        // snapshotting never misses or gains a write on this series.
        if self.frozen.load(Ordering::SeqCst) {
            return Ok(());
        }
        guard.aggregate.add(value);
        Ok(())
    }

    /// Records a sample into `name` and into one `name{tag:value}` series per tag.
    pub fn record_tagged(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), MetricError> {
        self.record(name, kind, value)?;
        for (tag, tag_value) in tags {
            self.record(&series_key(name, tag, tag_value), kind, value)?;
        }
        Ok(())
    }

    /// Records a boolean into a rate.
    pub fn record_rate(&self, name: &str, passed: bool) -> Result<(), MetricError> {
        self.record(name, MetricKind::Rate, if passed { 1.0 } else { 0.0 })
    }

    /// Captures every series. Writes racing with this call may or may not be
    /// included; writes that completed before it always are.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let entries: Vec<(String, Arc<Mutex<Series>>)> = self
            .series
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let elapsed = self.started.elapsed();
        let series = entries
            .into_iter()
            .map(|(key, series)| {
                let snap = series.lock().aggregate.snapshot(elapsed);
                (key, snap)
            })
            .collect();
        MetricsSnapshot { elapsed, series }
    }

    /// Stops accepting writes and returns the final, complete snapshot.
    pub fn freeze(&self) -> MetricsSnapshot {
        self.frozen.store(true, Ordering::SeqCst);
        self.snapshot()
    }

    /// Returns `true` once [`MetricRegistry::freeze`] was called.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn series_for(&self, name: &str, kind: MetricKind) -> Result<Arc<Mutex<Series>>, MetricError> {
        let existing = self.series.read().get(name).cloned();
        let series = match existing {
            Some(series) => series,
            None => {
                let mut map = self.series.write();
                Arc::clone(map.entry(name.to_owned()).or_insert_with(|| {
                    Arc::new(Mutex::new(Series {
                        aggregate: Aggregate::new(kind),
                    }))
                }))
            },
        };
        let existing_kind = series.lock().aggregate.kind();
        if existing_kind != kind {
            return Err(MetricError::KindMismatch {
                name: name.to_owned(),
                existing: existing_kind,
                requested: kind,
            });
        }
        Ok(series)
    }
}
