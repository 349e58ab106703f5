//! Virtual user (VU) task loop for load test execution.
//!
//! Each VU repeatedly runs one [`Script`] iteration and sleeps the think time
//! the iteration asked for. Retirement is cooperative: the VU's
//! [`CancellationToken`] is checked between iterations, so an in-flight
//! request or think-time sleep always completes and is measured.

use crate::loadtest::client::HttpClient;
use crate::loadtest::metrics::{names, MetricKind, MetricRegistry};
use crate::loadtest::script::{ExecutionContext, SharedScript};

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Atomic counter tracking the number of currently active virtual users.
///
/// Lightweight wrapper around `Arc<AtomicU32>` for clone-friendly sharing
/// across VU tasks and the engine orchestrator.
#[derive(Clone, Debug)]
pub struct ActiveVuCounter(Arc<AtomicU32>);

impl ActiveVuCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(0)))
    }

    /// Increments the active VU count by one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the active VU count by one.
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current number of active VUs.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ActiveVuCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    /// Spawned, first iteration not started yet.
    Idle,
    /// Executing iterations.
    Running,
    /// Left its loop; will not run again.
    Stopped,
}

/// Shared, lock-free view of a VU's [`VuState`].
#[derive(Clone, Debug)]
pub struct VuStatus(Arc<AtomicU8>);

impl VuStatus {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    fn set(&self, state: VuState) {
        let raw = match state {
            VuState::Idle => 0,
            VuState::Running => 1,
            VuState::Stopped => 2,
        };
        self.0.store(raw, Ordering::Release);
    }

    /// Current state.
    pub fn get(&self) -> VuState {
        match self.0.load(Ordering::Acquire) {
            0 => VuState::Idle,
            1 => VuState::Running,
            _ => VuState::Stopped,
        }
    }
}

/// Scheduler-side handle to a spawned VU.
#[derive(Debug)]
pub struct VirtualUser {
    id: u32,
    token: CancellationToken,
    status: VuStatus,
}

impl VirtualUser {
    /// Creates a handle whose retirement token is a child of `run`.
    pub fn new(id: u32, run: &CancellationToken) -> Self {
        Self {
            id,
            token: run.child_token(),
            status: VuStatus::new(),
        }
    }

    /// VU id, unique within a run.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VuState {
        self.status.get()
    }

    /// Asks the VU to stop after its current iteration.
    pub fn retire(&self) {
        self.token.cancel();
    }

    /// Returns `true` once retirement was requested.
    pub fn is_retiring(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn status(&self) -> VuStatus {
        self.status.clone()
    }
}

/// Run-wide iteration budget (first-limit-wins with the stage clock).
#[derive(Debug)]
pub struct IterationLimit {
    started: AtomicU64,
    max: u64,
    run: CancellationToken,
}

impl IterationLimit {
    /// Creates a budget of `max` iterations; exhausting it cancels `run`.
    pub fn new(max: u64, run: CancellationToken) -> Self {
        Self {
            started: AtomicU64::new(0),
            max,
            run,
        }
    }

    /// Claims one iteration. Returns `false` (and cancels the run) once the
    /// budget is spent.
    pub fn try_acquire(&self) -> bool {
        let prev = self.started.fetch_add(1, Ordering::Relaxed);
        if prev >= self.max {
            self.run.cancel();
            return false;
        }
        true
    }

    /// Returns `true` once every iteration has been claimed.
    pub fn is_exhausted(&self) -> bool {
        self.started.load(Ordering::Relaxed) >= self.max
    }
}

/// Everything a VU task needs besides its own handle.
#[derive(Clone)]
pub struct VuContext {
    /// The script each iteration runs.
    pub script: SharedScript,
    /// Measuring HTTP client (shares the registry).
    pub client: HttpClient,
    /// Run-wide iteration budget, if any.
    pub limit: Option<Arc<IterationLimit>>,
    /// Count of running VUs.
    pub active_vus: ActiveVuCounter,
}

/// Main virtual user task loop.
///
/// 1. Checks the retirement token and the iteration budget.
/// 2. Runs one script iteration.
/// 3. Sleeps the requested think time.
/// 4. Records `iterations` and `iteration_duration` (think time included).
///
/// Retirement is only observed at the top of the loop, so an in-flight
/// request or think-time sleep always completes and every recorded
/// iteration is a whole one.
///
/// The `active_vus` counter is incremented on entry and decremented on exit.
pub async fn vu_loop(vu_id: u32, ctx: VuContext, retire: CancellationToken, status: VuStatus) {
    ctx.active_vus.increment();
    status.set(VuState::Running);
    tracing::debug!(vu = vu_id, "virtual user started");

    let registry = Arc::clone(ctx.client.registry());
    let mut exec = ExecutionContext::new(vu_id, ctx.client.clone());

    loop {
        if retire.is_cancelled() {
            break;
        }
        if let Some(limit) = &ctx.limit {
            if !limit.try_acquire() {
                break;
            }
        }

        let start = Instant::now();
        let outcome = ctx.script.iteration(&mut exec).await;
        if !outcome.think_time.is_zero() {
            tokio::time::sleep(outcome.think_time).await;
        }
        record_iteration(&registry, start.elapsed().as_secs_f64() * 1000.0);
        exec.iteration += 1;
    }

    status.set(VuState::Stopped);
    ctx.active_vus.decrement();
    tracing::debug!(vu = vu_id, iterations = exec.iteration, "virtual user stopped");
}

fn record_iteration(registry: &MetricRegistry, duration_ms: f64) {
    let result = registry
        .record(names::ITERATIONS, MetricKind::Counter, 1.0)
        .and_then(|()| registry.record(names::ITERATION_DURATION, MetricKind::Trend, duration_ms));
    if let Err(err) = result {
        tracing::warn!(error = %err, "dropping iteration metric");
    }
}
