//! Stage scheduler: ramps the number of running virtual users over time.
//!
//! [`RampProfile`] is the pure part: linear interpolation between stage
//! targets and round-half-up to a VU count. [`VuPool`] owns the spawned VUs
//! and retires them LIFO (last spawned, first retired). [`StageScheduler`]
//! ties both together on a fixed tick until the profile ends.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::loadtest::config::Stage;
use crate::loadtest::metrics::{names, MetricKind, MetricRegistry};
use crate::loadtest::vu::{vu_loop, VirtualUser, VuContext};

/// A starting VU count followed by ramp stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    /// VU count the first stage ramps from.
    pub start_target: u32,
    /// Ramp stages, in order.
    pub stages: Vec<Stage>,
}

impl RampProfile {
    /// Creates a profile.
    pub fn new(start_target: u32, stages: Vec<Stage>) -> Self {
        Self {
            start_target,
            stages,
        }
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration.0).sum()
    }

    /// Largest target anywhere in the profile.
    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, u32::max)
    }

    /// Index of the stage active at `elapsed`, `None` after the last stage.
    pub fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration.0;
            if elapsed < stage_end {
                return Some(i);
            }
        }
        None
    }

    /// Interpolated (fractional) target at `elapsed`. Zero once the profile
    /// has ended.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut from = self.start_target;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let length = stage.duration.0;
            if elapsed < stage_start + length {
                let progress = (elapsed - stage_start).as_secs_f64() / length.as_secs_f64();
                let (lo, hi) = (f64::from(from.min(stage.target)), f64::from(from.max(stage.target)));
                let value = f64::from(from) + (f64::from(stage.target) - f64::from(from)) * progress;
                return value.clamp(lo, hi);
            }
            stage_start += length;
            from = stage.target;
        }
        0.0
    }

    /// Desired VU count at `elapsed`: the interpolated target rounded half up.
    pub fn desired_vus(&self, elapsed: Duration) -> u32 {
        (self.target_at(elapsed) + 0.5).floor() as u32
    }
}

/// The set of VUs the scheduler currently wants running.
///
/// Retired VUs leave the pool immediately; their tasks finish the current
/// iteration on their own and are awaited through the [`TaskTracker`].
pub struct VuPool {
    run: CancellationToken,
    tracker: TaskTracker,
    ctx: VuContext,
    vus: Vec<VirtualUser>,
    next_id: u32,
    peak: u32,
}

impl VuPool {
    /// Creates an empty pool. VU tokens are children of `run`.
    pub fn new(run: CancellationToken, tracker: TaskTracker, ctx: VuContext) -> Self {
        Self {
            run,
            tracker,
            ctx,
            vus: Vec::new(),
            next_id: 0,
            peak: 0,
        }
    }

    /// Number of VUs in the pool.
    pub fn len(&self) -> u32 {
        self.vus.len() as u32
    }

    /// Returns `true` when the pool holds no VU.
    pub fn is_empty(&self) -> bool {
        self.vus.is_empty()
    }

    /// Largest size the pool reached.
    pub fn peak(&self) -> u32 {
        self.peak
    }

    /// Ids of pooled VUs, in spawn order.
    pub fn ids(&self) -> Vec<u32> {
        self.vus.iter().map(VirtualUser::id).collect()
    }

    /// Spawns or retires VUs until the pool holds `desired`.
    ///
    /// Returns `(spawned, retired)`. Nothing is spawned once the run token is
    /// cancelled.
    pub fn scale_to(&mut self, desired: u32) -> (u32, u32) {
        let mut spawned = 0;
        let mut retired = 0;
        while self.len() < desired && !self.run.is_cancelled() {
            let vu = VirtualUser::new(self.next_id, &self.run);
            self.next_id += 1;
            self.tracker
                .spawn(vu_loop(vu.id(), self.ctx.clone(), vu.token(), vu.status()));
            self.vus.push(vu);
            spawned += 1;
        }
        while self.len() > desired {
            if let Some(vu) = self.vus.pop() {
                vu.retire();
                retired += 1;
            }
        }
        self.peak = self.peak.max(self.len());
        if spawned > 0 || retired > 0 {
            tracing::debug!(desired, spawned, retired, "scaled virtual user pool");
        }
        (spawned, retired)
    }

    /// Retires every VU.
    pub fn retire_all(&mut self) {
        self.scale_to(0);
    }
}

/// How a schedule ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The profile ran to its end.
    Completed,
    /// The run token was cancelled first.
    Cancelled,
}

/// Periodic loop driving a [`VuPool`] along a [`RampProfile`].
#[derive(Debug, Clone)]
pub struct StageScheduler {
    profile: RampProfile,
    tick: Duration,
    registry: Arc<MetricRegistry>,
    stage_label: Arc<Mutex<Option<String>>>,
}

impl StageScheduler {
    /// Creates a scheduler ticking every `tick`.
    pub fn new(profile: RampProfile, tick: Duration, registry: Arc<MetricRegistry>) -> Self {
        Self {
            profile,
            tick,
            registry,
            stage_label: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared `"stage N/M"` label, updated every tick.
    pub fn stage_label(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.stage_label)
    }

    /// The profile being followed.
    pub fn profile(&self) -> &RampProfile {
        &self.profile
    }

    /// Runs the schedule until the profile ends or `cancel` fires, then
    /// retires the whole pool.
    pub async fn run(&self, pool: &mut VuPool, cancel: &CancellationToken) -> ScheduleOutcome {
        let start = Instant::now();
        let total = self.profile.total_duration();
        let stage_count = self.profile.stages.len();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current_stage = None;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ScheduleOutcome::Cancelled,
                _ = interval.tick() => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= total {
                break ScheduleOutcome::Completed;
            }

            let stage = self.profile.stage_index(elapsed);
            if stage != current_stage {
                current_stage = stage;
                if let Some(i) = stage {
                    tracing::info!(stage = i + 1, of = stage_count, "entering stage");
                    *self.stage_label.lock() = Some(format!("stage {}/{}", i + 1, stage_count));
                }
            }

            pool.scale_to(self.profile.desired_vus(elapsed));
            self.record_gauges(pool);
        };

        pool.retire_all();
        self.record_gauges(pool);
        outcome
    }

    fn record_gauges(&self, pool: &VuPool) {
        let result = self
            .registry
            .record(names::VUS, MetricKind::Gauge, f64::from(pool.len()))
            .and_then(|()| {
                self.registry
                    .record(names::VUS_MAX, MetricKind::Gauge, f64::from(pool.peak()))
            });
        if let Err(err) = result {
            tracing::warn!(error = %err, "dropping scheduler gauge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::client::{HttpClient, RawResponse, Transport};
    use crate::loadtest::error::RequestError;
    use crate::loadtest::metrics::MetricSnapshot;
    use crate::loadtest::script::{ExecutionContext, IterationResult, Script};
    use crate::loadtest::vu::ActiveVuCounter;
    use async_trait::async_trait;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn profile(start: u32, stages: &[(u64, u32)]) -> RampProfile {
        RampProfile::new(
            start,
            stages.iter().map(|&(d, t)| Stage::new(secs(d), t)).collect(),
        )
    }

    #[test]
    fn test_linear_interpolation_within_stage() {
        let p = profile(0, &[(30, 10), (60, 50)]);
        assert_eq!(p.target_at(secs(0)), 0.0);
        assert_eq!(p.target_at(secs(15)), 5.0);
        assert_eq!(p.target_at(secs(30)), 10.0);
        assert_eq!(p.target_at(secs(60)), 30.0);
        assert_eq!(p.target_at(secs(90)), 0.0);
        assert_eq!(p.total_duration(), secs(90));
        assert_eq!(p.max_target(), 50);
    }

    #[test]
    fn test_desired_rounds_half_up() {
        let p = profile(0, &[(10, 1)]);
        assert_eq!(p.desired_vus(Duration::from_millis(4_999)), 0);
        assert_eq!(p.desired_vus(secs(5)), 1);
        let down = profile(1, &[(10, 0)]);
        assert_eq!(down.desired_vus(secs(5)), 1);
        assert_eq!(down.desired_vus(Duration::from_millis(5_001)), 0);
    }

    #[test]
    fn test_stage_index_and_start_target() {
        let p = profile(5, &[(10, 5), (10, 0)]);
        assert_eq!(p.desired_vus(secs(0)), 5);
        assert_eq!(p.stage_index(secs(0)), Some(0));
        assert_eq!(p.stage_index(secs(10)), Some(1));
        assert_eq!(p.stage_index(secs(20)), None);
    }

    #[test]
    fn test_empty_profile_targets_zero() {
        let p = profile(0, &[]);
        assert_eq!(p.total_duration(), Duration::ZERO);
        assert_eq!(p.max_target(), 0);
        assert_eq!(p.desired_vus(secs(1)), 0);
    }

    struct InstantTransport;

    #[async_trait]
    impl Transport for InstantTransport {
        async fn get(&self, _url: &str, _timeout: Duration) -> Result<RawResponse, RequestError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(RawResponse {
                status: 200,
                body: Vec::new(),
            })
        }
    }

    struct Think;

    #[async_trait]
    impl Script for Think {
        async fn iteration(&self, ctx: &mut ExecutionContext) -> IterationResult {
            let _ = ctx.http().get("http://test.local/", &Default::default()).await;
            IterationResult {
                think_time: Duration::from_millis(250),
            }
        }
    }

    fn pool(run: &CancellationToken, registry: Arc<MetricRegistry>) -> (VuPool, TaskTracker, ActiveVuCounter) {
        let tracker = TaskTracker::new();
        let active = ActiveVuCounter::new();
        let ctx = VuContext {
            script: Arc::new(Think),
            client: HttpClient::new(Arc::new(InstantTransport), registry, secs(5)),
            limit: None,
            active_vus: active.clone(),
        };
        (VuPool::new(run.clone(), tracker.clone(), ctx), tracker, active)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_retires_lifo() {
        let run = CancellationToken::new();
        let (mut pool, tracker, _) = pool(&run, Arc::new(MetricRegistry::new()));
        assert_eq!(pool.scale_to(4), (4, 0));
        assert_eq!(pool.scale_to(2), (0, 2));
        assert_eq!(pool.ids(), vec![0, 1]);
        assert_eq!(pool.scale_to(3), (1, 0));
        assert_eq!(pool.ids(), vec![0, 1, 4]);
        assert_eq!(pool.peak(), 4);

        pool.retire_all();
        assert!(pool.is_empty());
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_does_not_spawn_after_cancel() {
        let run = CancellationToken::new();
        let (mut pool, _tracker, _) = pool(&run, Arc::new(MetricRegistry::new()));
        run.cancel();
        assert_eq!(pool.scale_to(3), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_follows_profile_and_drains() {
        let run = CancellationToken::new();
        let registry = Arc::new(MetricRegistry::new());
        let (mut pool, tracker, active) = pool(&run, Arc::clone(&registry));
        let scheduler = StageScheduler::new(
            profile(0, &[(2, 4), (2, 4), (2, 0)]),
            Duration::from_millis(200),
            Arc::clone(&registry),
        );
        let label = scheduler.stage_label();

        let sched_run = run.clone();
        let handle = tokio::spawn(async move {
            let outcome = scheduler.run(&mut pool, &sched_run).await;
            (outcome, pool.peak())
        });

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(active.get(), 4, "hold stage runs the full target");
        assert_eq!(label.lock().as_deref(), Some("stage 2/3"));

        let (outcome, peak) = handle.await.unwrap();
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(peak, 4);

        tracker.close();
        tracker.wait().await;
        assert_eq!(active.get(), 0);

        match registry.snapshot().get("vus_max").unwrap() {
            MetricSnapshot::Gauge { value, .. } => assert_eq!(*value, 4.0),
            other => panic!("expected gauge, got {other:?}"),
        }
        match registry.snapshot().get("vus").unwrap() {
            MetricSnapshot::Gauge { value, max, .. } => {
                assert_eq!(*value, 0.0);
                assert_eq!(*max, 4.0);
            },
            other => panic!("expected gauge, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_on_cancel() {
        let run = CancellationToken::new();
        let registry = Arc::new(MetricRegistry::new());
        let (mut pool, tracker, active) = pool(&run, Arc::clone(&registry));
        let scheduler = StageScheduler::new(profile(3, &[(60, 3)]), Duration::from_millis(200), registry);

        let canceller = run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(1)).await;
            canceller.cancel();
        });
        let outcome = scheduler.run(&mut pool, &run).await;
        assert_eq!(outcome, ScheduleOutcome::Cancelled);
        assert!(pool.is_empty());

        tracker.close();
        tracker.wait().await;
        assert_eq!(active.get(), 0);
    }
}
