use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::join_all, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::{ExecOutcome, ExecutionContext, Executor, RunState};
use crate::{
    data::DataGen,
    error::{Error, Result},
    metric::{builtin, MetricKind},
    scenario::{millis, RunContext, Scenario, Vu},
};
use internals::*;

/// A stage defines a target VU count and how long to ramp to that target.
///
/// `Stage::new(Duration::from_secs(30), 50)` moves the population linearly from the
/// previous target to 50 VUs over 30 seconds. Only a final stage ramping to 0 may
/// have a zero duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::config::duration_str")]
    pub duration: Duration,
    /// Virtual users
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Checks a stage list before anything runs.
pub fn validate_stages(stages: &[Stage]) -> Result<()> {
    if stages.is_empty() {
        return Err(Error::InvalidStages("at least one stage is required".into()));
    }
    let last = stages.len() - 1;
    for (i, stage) in stages.iter().enumerate() {
        if stage.duration.is_zero() && !(i == last && stage.target == 0) {
            return Err(Error::InvalidStages(format!(
                "stage {i} has a zero duration, only a final stage ramping to 0 may"
            )));
        }
    }
    Ok(())
}

/// Sum of every stage duration, i.e. the run deadline.
pub fn total_duration(stages: &[Stage]) -> Duration {
    stages.iter().map(|s| s.duration).sum()
}

/// Executor that ramps a population of virtual users through `stages`.
///
/// - Every `tick` the scheduler compares the live VU count to the interpolated target.
/// - Missing VUs are spawned immediately and start iterating right away.
/// - Surplus VUs (most recent first) finish their current iteration and leave. After
///   `graceful_ramp_down` they are aborted.
/// - At the end of the last stage, or on cancellation, all VUs get `graceful_stop` to
///   finish their iteration.
///
/// # Tuning Knobs
///
/// - `tick`: how often the population is adjusted. One second follows a ramp closely
///   enough for most tests; shorter ticks only matter for very steep ramps.
/// - `max_vus`: hard cap on concurrently running VUs, whatever the stages ask for.
#[derive(Clone, Debug, TypedBuilder)]
pub struct StageExecutor {
    /// The sequence of ramp stages to execute.
    pub stages: Vec<Stage>,
    /// VU count the first stage ramps from.
    #[builder(default)]
    pub start_vus: u64,
    /// The granularity of population updates.
    #[builder(default = Duration::from_secs(1))]
    pub tick: Duration,
    /// Time VUs get to finish their iteration once the run is over.
    #[builder(default = Duration::from_secs(30))]
    pub graceful_stop: Duration,
    /// Time a surplus VU gets to finish its iteration while ramping down.
    #[builder(default = Duration::from_secs(30))]
    pub graceful_ramp_down: Duration,
    #[builder(default, setter(strip_option))]
    pub max_vus: Option<u64>,
}

impl StageExecutor {
    pub fn total_duration(&self) -> Duration {
        total_duration(&self.stages)
    }

    /// Target VU count `elapsed` into the run.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        target_at(self.start_vus, &self.stages, elapsed)
    }

    fn state_for(&self, stage: usize) -> RunState {
        let from = match stage {
            0 => self.start_vus,
            i => self.stages[i - 1].target,
        };
        if from == self.stages[stage].target {
            RunState::Sustaining { stage }
        } else {
            RunState::Ramping { stage }
        }
    }
}

impl<F, Fut> Executor<F, Fut> for StageExecutor
where
    Self: Send + Sync + Sized,
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Error = Error;

    async fn exec(&self, scenario: &Scenario<F>, ctx: ExecutionContext) -> Result<ExecOutcome> {
        validate_stages(&self.stages)?;
        let total = self.total_duration();
        let start = Instant::now();
        let mut vus = VuPool::new(
            Arc::clone(&ctx.run),
            scenario.action.clone(),
            ctx.cancel.clone(),
            start + total,
            self.max_vus,
        );

        tracing::info!(
            "Running scenario `{}`: {} stage(s) over {:?}",
            scenario.name,
            self.stages.len(),
            total
        );

        let mut state = RunState::NotStarted;
        let mut next_tick = start;
        loop {
            let elapsed = start.elapsed();
            if ctx.cancel.is_cancelled() {
                tracing::warn!("Run cancelled after {elapsed:?}");
                break;
            }
            if elapsed >= total {
                break;
            }

            if let Some(i) = stage_at(&self.stages, elapsed) {
                let current = self.state_for(i);
                if current != state {
                    tracing::info!("Starting stage {}/{}: {:?}", i + 1, self.stages.len(), current);
                    ctx.publish(current);
                    state = current;
                }
            }

            vus.reap();
            vus.scale_to(self.target_at(elapsed), self.graceful_ramp_down);
            vus.record_population();

            next_tick += self.tick;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = ctx.cancel.cancelled() => {}
            }
        }

        tracing::info!("Draining {} VU(s)...", vus.live());
        ctx.publish(RunState::Draining);
        let mut outcome = vus.drain(self.graceful_stop).await;
        outcome.cancelled = ctx.cancel.is_cancelled();
        outcome.elapsed = start.elapsed();
        ctx.publish(RunState::Completed);

        tracing::info!(
            "Done running scenario `{}`: {} iteration(s), {} interrupted, in {:?}",
            scenario.name,
            outcome.iterations,
            outcome.interrupted,
            outcome.elapsed
        );
        Ok(outcome)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Ramp math and VU bookkeeping for the `StageExecutor`.
mod internals {
    use super::*;

    /// Target VU count at `elapsed`, interpolating linearly inside each stage and
    /// rounding to the nearest integer.
    ///
    /// At every stage boundary the result is exactly that stage's target. Past the
    /// last stage, the last target holds.
    pub fn target_at(start_vus: u64, stages: &[Stage], elapsed: Duration) -> u64 {
        let mut from = start_vus as f64;
        let mut stage_start = Duration::ZERO;
        for stage in stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let f = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let target = from + (stage.target as f64 - from) * f;
                return target.round().max(0.0) as u64;
            }
            from = stage.target as f64;
            stage_start = stage_end;
        }
        stages.last().map_or(start_vus, |s| s.target)
    }

    /// Index of the stage running at `elapsed`, `None` once every stage is over.
    pub fn stage_at(stages: &[Stage], elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        stages.iter().position(|s| {
            stage_end += s.duration;
            elapsed < stage_end
        })
    }

    pub(crate) struct VuHandle {
        pub id: u64,
        pub stop: CancellationToken,
        /// Set while the VU is inside an iteration.
        pub busy: Arc<AtomicBool>,
        pub handle: JoinHandle<()>,
    }

    /// The live VU population of one run.
    pub(crate) struct VuPool<F> {
        run: Arc<RunContext>,
        action: F,
        cancel: CancellationToken,
        deadline: Instant,
        max_vus: Option<u64>,
        next_id: u64,
        /// Running VUs, oldest first.
        active: Vec<VuHandle>,
        /// VUs told to stop, with the instant they get aborted at.
        retiring: Vec<(VuHandle, Instant)>,
        iterations: Arc<AtomicU64>,
        interrupted: u64,
        max_live: u64,
    }

    impl<F, Fut> VuPool<F>
    where
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        pub fn new(
            run: Arc<RunContext>,
            action: F,
            cancel: CancellationToken,
            deadline: Instant,
            max_vus: Option<u64>,
        ) -> Self {
            Self {
                run,
                action,
                cancel,
                deadline,
                max_vus,
                next_id: 1,
                active: Vec::new(),
                retiring: Vec::new(),
                iterations: Arc::new(AtomicU64::new(0)),
                interrupted: 0,
                max_live: 0,
            }
        }

        /// VUs currently running, retiring ones included.
        pub fn live(&self) -> usize {
            self.active.len() + self.retiring.len()
        }

        pub fn spawn(&mut self) -> Result<()> {
            if let Some(max) = self.max_vus {
                if self.live() as u64 >= max {
                    return Err(Error::Spawn(format!("max_vus ({max}) reached")));
                }
            }
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|e| Error::Spawn(e.to_string()))?;

            let id = self.next_id;
            let stop = self.cancel.child_token();
            let busy = Arc::new(AtomicBool::new(false));
            let handle = runtime.spawn(vu_loop(
                id,
                self.action.clone(),
                Arc::clone(&self.run),
                stop.clone(),
                Arc::clone(&busy),
                self.deadline,
                Arc::clone(&self.iterations),
            ));
            self.next_id += 1;
            self.active.push(VuHandle {
                id,
                stop,
                busy,
                handle,
            });
            self.max_live = self.max_live.max(self.live() as u64);
            Ok(())
        }

        /// Spawns or retires VUs so that `target` of them remain active.
        pub fn scale_to(&mut self, target: u64, grace: Duration) {
            let active = self.active.len() as u64;
            if active < target {
                for _ in active..target {
                    if let Err(e) = self.spawn() {
                        tracing::warn!("Skipping VU spawn until next tick: {e}");
                        break;
                    }
                }
            } else {
                let abort_at = Instant::now() + grace;
                for _ in target..active {
                    if let Some(vu) = self.active.pop() {
                        tracing::debug!("Retiring VU {}", vu.id);
                        vu.stop.cancel();
                        self.retiring.push((vu, abort_at));
                    }
                }
            }
        }

        /// Forgets finished VUs and aborts retiring ones past their grace period.
        pub fn reap(&mut self) {
            self.active.retain(|vu| !vu.handle.is_finished());

            let now = Instant::now();
            let mut interrupted = 0;
            self.retiring.retain(|(vu, abort_at)| {
                if vu.handle.is_finished() {
                    return false;
                }
                if now >= *abort_at {
                    tracing::warn!("VU {} did not finish its iteration in time, aborting", vu.id);
                    if abort(vu) {
                        interrupted += 1;
                    }
                    return false;
                }
                true
            });
            self.count_interrupted(interrupted);
        }

        pub fn record_population(&self) {
            record(&self.run, builtin::VUS, MetricKind::Gauge, self.live() as f64);
            record(&self.run, builtin::VUS_MAX, MetricKind::Gauge, self.max_live as f64);
        }

        /// Stops every VU, waits up to `grace` for them, then aborts the stragglers.
        pub async fn drain(mut self, grace: Duration) -> ExecOutcome {
            let mut all: Vec<VuHandle> = self.active.drain(..).collect();
            all.extend(self.retiring.drain(..).map(|(vu, _)| vu));
            for vu in &all {
                vu.stop.cancel();
            }

            let waiting = join_all(all.iter_mut().map(|vu| &mut vu.handle));
            if tokio::time::timeout(grace, waiting).await.is_err() {
                tracing::warn!("Graceful stop of {grace:?} exceeded, aborting remaining VUs");
            }

            let mut vus_at_end = 0;
            let mut interrupted = 0;
            for vu in &all {
                if !vu.handle.is_finished() {
                    vus_at_end += 1;
                    if abort(vu) {
                        interrupted += 1;
                    }
                }
            }
            self.count_interrupted(interrupted);
            record(&self.run, builtin::VUS, MetricKind::Gauge, 0.0);

            ExecOutcome {
                cancelled: false,
                iterations: self.iterations.load(Ordering::Acquire),
                interrupted: self.interrupted,
                max_vus: self.max_live,
                vus_at_end,
                elapsed: Duration::ZERO,
            }
        }

        fn count_interrupted(&mut self, n: u64) {
            if n > 0 {
                self.interrupted += n;
                record(
                    &self.run,
                    builtin::INTERRUPTED_ITERATIONS,
                    MetricKind::Counter,
                    n as f64,
                );
            }
        }
    }

    /// Aborts a VU task, returning whether it was in the middle of an iteration.
    fn abort(vu: &VuHandle) -> bool {
        vu.handle.abort();
        vu.busy.load(Ordering::Acquire)
    }

    /// Iteration loop of a single virtual user.
    ///
    /// Stop requests are only honoured between iterations; aborting the task is the
    /// only way to interrupt one.
    pub(crate) async fn vu_loop<F, Fut>(
        id: u64,
        action: F,
        run: Arc<RunContext>,
        stop: CancellationToken,
        busy: Arc<AtomicBool>,
        deadline: Instant,
        iterations: Arc<AtomicU64>,
    ) where
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let data = Arc::new(DataGen::for_vu(run.seed, id));
        tracing::debug!("VU {id} started.");

        let mut iteration = 0;
        while !stop.is_cancelled() && Instant::now() < deadline {
            busy.store(true, Ordering::Release);
            let started = Instant::now();
            let vu = Vu::new(id, iteration, Arc::clone(&run), Arc::clone(&data));
            let result = AssertUnwindSafe(action(vu)).catch_unwind().await;
            busy.store(false, Ordering::Release);

            match result {
                Ok(()) => {
                    record(&run, builtin::ITERATIONS, MetricKind::Counter, 1.0);
                    record(
                        &run,
                        builtin::ITERATION_DURATION,
                        MetricKind::Trend,
                        millis(started.elapsed()),
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        "VU {id} iteration {iteration} panicked: {}",
                        panic_message(panic.as_ref())
                    );
                    record(&run, builtin::ERRORS, MetricKind::Counter, 1.0);
                }
            }
            iterations.fetch_add(1, Ordering::AcqRel);
            iteration += 1;
            // An iteration that never awaits must not starve the scheduler.
            tokio::task::yield_now().await;
        }

        tracing::debug!("VU {id} stopped after {iteration} iteration(s).");
    }

    fn record(run: &RunContext, name: &str, kind: MetricKind, value: f64) {
        if let Err(e) = run.collector.record_as(name, kind, value) {
            tracing::warn!("Dropping sample: {e}");
        }
    }

    fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
        panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic>")
    }
}
