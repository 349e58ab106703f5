//! Load test execution engine with live monitoring and graceful shutdown.
//!
//! [`LoadTestEngine`] is the top-level orchestrator that:
//! - Builds the run-scoped [`MetricRegistry`], script and HTTP client
//! - Drives the [`StageScheduler`], which spawns and retires VU tasks on a
//!   [`tokio_util::task::TaskTracker`]
//! - Runs a monitor task that publishes [`DisplayState`] through a watch
//!   channel and evaluates abort-on-fail thresholds
//! - Coordinates shutdown via a run-level [`CancellationToken`], waits up to
//!   the drain timeout for VUs, freezes the registry and evaluates thresholds

use crate::loadtest::client::{HttpClient, ReqwestTransport, Transport};
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::display::display_loop;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricKind, MetricRegistry, MetricsSnapshot};
use crate::loadtest::scheduler::{ScheduleOutcome, StageScheduler, VuPool};
use crate::loadtest::script::{HttpScript, SharedScript};
use crate::loadtest::threshold::{Threshold, ThresholdReport, ThresholdSet};
use crate::loadtest::vu::{ActiveVuCounter, IterationLimit, VuContext};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How often the monitor publishes progress and checks abort rules.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Compile-time Send bounds verification for channel-transported types.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<MetricsSnapshot>();
    _assert_send::<DisplayState>();
}

/// Display state published through the watch channel to the live display.
#[derive(Debug, Clone)]
pub struct DisplayState {
    /// Current metrics snapshot.
    pub snapshot: MetricsSnapshot,
    /// Current stage label (e.g., `"stage 2/3"`).
    pub stage_label: Option<String>,
    /// VUs currently inside their loop.
    pub active_vus: u32,
    /// Largest target of the profile.
    pub target_vus: u32,
    /// Time since the run started.
    pub elapsed: Duration,
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The ramp profile ran to its end.
    Completed,
    /// The iteration budget was spent.
    IterationLimit,
    /// An abort-on-fail threshold failed.
    ThresholdAbort {
        /// Metric key of the failing rule.
        metric: String,
        /// Expression of the failing rule.
        expression: String,
    },
    /// Ctrl+C.
    Interrupted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::IterationLimit => f.write_str("iteration limit reached"),
            Self::ThresholdAbort { metric, expression } => {
                write!(f, "aborted by threshold {metric}: {expression}")
            },
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Result of a completed load test run.
#[derive(Debug, Clone)]
pub struct LoadTestResult {
    /// Final, frozen metrics snapshot.
    pub snapshot: MetricsSnapshot,
    /// Threshold verdicts over the final snapshot.
    pub thresholds: ThresholdReport,
    /// Total elapsed time of the test.
    pub elapsed: Duration,
    /// Why the run stopped.
    pub stop_reason: StopReason,
    /// Largest VU pool size reached.
    pub max_vus: u32,
    /// `false` when the drain timeout expired with VUs still running.
    pub drained: bool,
}

impl LoadTestResult {
    /// `true` when no threshold failed.
    pub fn passed(&self) -> bool {
        self.thresholds.passed()
    }
}

/// Top-level load test engine configuration and entry point.
///
/// # Example
///
/// ```no_run
/// use loadramp::loadtest::config::LoadTestConfig;
/// use loadramp::loadtest::engine::LoadTestEngine;
///
/// # async fn demo() -> Result<(), loadramp::loadtest::error::LoadTestError> {
/// let config = LoadTestConfig::from_toml(r#"
/// [request]
/// url = "http://localhost:8080"
///
/// [[stage]]
/// duration = "30s"
/// target = 10
///
/// [thresholds]
/// http_req_failed = "rate<0.1"
/// "#)?;
/// let result = LoadTestEngine::new(config).run().await?;
/// println!("passed: {}", result.passed());
/// # Ok(())
/// # }
/// ```
pub struct LoadTestEngine {
    config: LoadTestConfig,
    url: Option<String>,
    script: Option<SharedScript>,
    transport: Option<Arc<dyn Transport>>,
    max_iterations: Option<u64>,
    live_display: bool,
    handle_signals: bool,
    no_color: bool,
}

impl LoadTestEngine {
    /// Creates a new engine for `config`.
    pub fn new(config: LoadTestConfig) -> Self {
        Self {
            config,
            url: None,
            script: None,
            transport: None,
            max_iterations: None,
            live_display: false,
            handle_signals: false,
            no_color: false,
        }
    }

    /// Overrides `request.url`.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Replaces the config-built [`HttpScript`] with a custom script.
    pub fn with_script(mut self, script: SharedScript) -> Self {
        self.script = Some(script);
        self
    }

    /// Replaces the reqwest transport (used by tests to simulate a backend).
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets an iteration limit, overriding `settings.iterations`. The test
    /// stops after this many total iterations across all VUs
    /// (first-limit-wins with the stage clock).
    pub fn with_iterations(mut self, n: u64) -> Self {
        self.max_iterations = Some(n);
        self
    }

    /// Shows the live progress line on stderr.
    pub fn with_live_display(mut self, enabled: bool) -> Self {
        self.live_display = enabled;
        self
    }

    /// Installs the two-phase Ctrl+C handler for the duration of the run.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Disables colored output.
    pub fn with_no_color(mut self, no_color: bool) -> Self {
        self.no_color = no_color;
        self
    }

    /// Returns a reference to the engine's configuration.
    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    /// Returns the effective iteration limit, if any.
    pub fn max_iterations(&self) -> Option<u64> {
        self.max_iterations.or(self.config.settings.iterations)
    }

    /// Run the load test.
    ///
    /// Configuration errors (including thresholds) are returned before any
    /// VU starts. A profile whose targets are all zero completes immediately
    /// with empty metrics.
    pub async fn run(&self) -> Result<LoadTestResult, LoadTestError> {
        self.config.validate()?;
        let thresholds = self.config.thresholds()?;
        let profile = self.config.ramp_profile();

        let script: SharedScript = match &self.script {
            Some(script) => Arc::clone(script),
            None => Arc::new(HttpScript::from_config(&self.config, self.url.as_deref())?),
        };

        let registry = Arc::new(MetricRegistry::with_builtins());
        for rate in &self.config.rate {
            if let Err(err) = registry.register(&rate.name, MetricKind::Rate) {
                return Err(LoadTestError::validation(err.to_string()));
            }
        }

        let target_vus = profile.max_target();
        if target_vus == 0 {
            tracing::info!("ramp profile never targets a virtual user; nothing to run");
            let snapshot = registry.freeze();
            return Ok(LoadTestResult {
                thresholds: thresholds.evaluate(&snapshot),
                snapshot,
                elapsed: Duration::ZERO,
                stop_reason: StopReason::Completed,
                max_vus: 0,
                drained: true,
            });
        }

        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => {
                let client = reqwest::Client::builder().build().map_err(|e| LoadTestError::Cli {
                    message: format!("failed to build HTTP client: {e}"),
                })?;
                Arc::new(ReqwestTransport::new(client))
            },
        };

        let run = CancellationToken::new();
        let monitor_stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let active_vus = ActiveVuCounter::new();
        let limit = self
            .max_iterations()
            .map(|n| Arc::new(IterationLimit::new(n, run.clone())));

        let ctx = VuContext {
            script,
            client: HttpClient::new(transport, Arc::clone(&registry), self.config.request_timeout()),
            limit: limit.clone(),
            active_vus: active_vus.clone(),
        };
        let mut pool = VuPool::new(run.clone(), tracker.clone(), ctx);
        let scheduler = StageScheduler::new(
            profile,
            self.config.settings.tick.get(),
            Arc::clone(&registry),
        );

        let test_start = Instant::now();
        let (display_tx, display_rx) = watch::channel(DisplayState {
            snapshot: registry.snapshot(),
            stage_label: None,
            active_vus: 0,
            target_vus,
            elapsed: Duration::ZERO,
        });
        let abort_holder = Arc::new(Mutex::new(None::<Threshold>));

        let monitor_handle = tokio::spawn(monitor_loop(Monitor {
            registry: Arc::clone(&registry),
            thresholds: thresholds.clone(),
            display_tx,
            run: run.clone(),
            stop: monitor_stop.clone(),
            stage_label: scheduler.stage_label(),
            active_vus: active_vus.clone(),
            target_vus,
            abort_holder: Arc::clone(&abort_holder),
            test_start,
        }));

        let display_handle = self.live_display.then(|| {
            tokio::spawn(display_loop(display_rx, monitor_stop.clone(), self.no_color))
        });

        let interrupted = Arc::new(AtomicBool::new(false));
        let signal_handle = self
            .handle_signals
            .then(|| tokio::spawn(handle_ctrl_c(run.clone(), Arc::clone(&interrupted))));

        tracing::info!(target_vus, "load test started");
        let outcome = scheduler.run(&mut pool, &run).await;

        // Drain: stop spawning, close the tracker and wait for VUs to leave
        // their loops, bounded by the drain timeout.
        run.cancel();
        tracker.close();
        let drain_timeout = self.config.settings.drain_timeout.get();
        let drained = tokio::time::timeout(drain_timeout, tracker.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                still_running = active_vus.get(),
                timeout = ?drain_timeout,
                "drain timeout elapsed; finalizing with virtual users still running"
            );
        }

        monitor_stop.cancel();
        let _ = monitor_handle.await;
        if let Some(handle) = display_handle {
            let _ = handle.await;
        }
        if let Some(handle) = signal_handle {
            handle.abort();
        }

        let snapshot = registry.freeze();
        let elapsed = test_start.elapsed();
        let report = thresholds.evaluate(&snapshot);

        let aborted_by = abort_holder.lock().take();
        let stop_reason = if let Some(threshold) = aborted_by {
            StopReason::ThresholdAbort {
                metric: threshold.metric,
                expression: threshold.expression,
            }
        } else if interrupted.load(Ordering::SeqCst) {
            StopReason::Interrupted
        } else if limit.as_ref().is_some_and(|l| l.is_exhausted()) && outcome == ScheduleOutcome::Cancelled {
            StopReason::IterationLimit
        } else if outcome == ScheduleOutcome::Completed {
            StopReason::Completed
        } else {
            StopReason::Interrupted
        };
        tracing::info!(reason = %stop_reason, passed = report.passed(), "load test finished");

        Ok(LoadTestResult {
            snapshot,
            thresholds: report,
            elapsed,
            stop_reason,
            max_vus: pool.peak(),
            drained,
        })
    }
}

/// Everything the monitor task needs.
struct Monitor {
    registry: Arc<MetricRegistry>,
    thresholds: ThresholdSet,
    display_tx: watch::Sender<DisplayState>,
    run: CancellationToken,
    stop: CancellationToken,
    stage_label: Arc<Mutex<Option<String>>>,
    active_vus: ActiveVuCounter,
    target_vus: u32,
    abort_holder: Arc<Mutex<Option<Threshold>>>,
    test_start: Instant,
}

impl Monitor {
    fn publish(&self, snapshot: MetricsSnapshot) {
        let _ = self.display_tx.send(DisplayState {
            snapshot,
            stage_label: self.stage_label.lock().clone(),
            active_vus: self.active_vus.get(),
            target_vus: self.target_vus,
            elapsed: self.test_start.elapsed(),
        });
    }
}

/// Publishes progress every [`MONITOR_INTERVAL`] and cancels the run when an
/// abort-on-fail threshold fails.
///
/// Uses `biased;` select so a stop request always wins over a pending tick.
async fn monitor_loop(monitor: Monitor) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let check_aborts = monitor.thresholds.has_abort_rules();

    loop {
        tokio::select! {
            biased;

            _ = monitor.stop.cancelled() => {
                monitor.publish(monitor.registry.snapshot());
                break;
            }
            _ = tick.tick() => {
                let snapshot = monitor.registry.snapshot();
                if check_aborts && !monitor.run.is_cancelled() {
                    if let Some(threshold) = monitor.thresholds.abort_trigger(&snapshot) {
                        tracing::warn!(threshold = %threshold, "abort-on-fail threshold failed; stopping run");
                        *monitor.abort_holder.lock() = Some(threshold.clone());
                        monitor.run.cancel();
                    }
                }
                monitor.publish(snapshot);
            }
        }
    }
}

/// Ctrl+C handler with two-phase shutdown.
///
/// First Ctrl+C triggers graceful drain via the cancellation token.
/// Second Ctrl+C performs a hard abort via `std::process::exit(1)`.
async fn handle_ctrl_c(cancel: CancellationToken, interrupted: Arc<AtomicBool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
        return;
    }
    eprintln!("\nReceived Ctrl+C, stopping gracefully...");
    interrupted.store(true, Ordering::SeqCst);
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nReceived second Ctrl+C, aborting immediately.");
        std::process::exit(1);
    }
}
