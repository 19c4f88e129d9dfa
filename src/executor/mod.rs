//! Executor: orchestration of virtual users over time
//!
//! The `Executor` trait is the runtime that executes a [`Scenario`]. An executor
//! decides how many virtual users (VUs) run at any moment, starts and stops them,
//! and reports back once the run is over.
//!
//! The built-in [`StageExecutor`] ramps the VU population through a list of
//! [`Stage`]s. Each stage defines a target VU count and a duration over which the
//! population moves linearly from the previous target to the new one.
//!
//! # High-level flow
//! 1. A scheduling task ticks every `tick` and computes the target VU count for the
//!    elapsed time.
//! 2. Under target, new VUs are spawned. Each VU runs the scenario action in a loop,
//!    one iteration after the other, until it is told to stop or the run deadline is
//!    reached.
//! 3. Over target, the most recently started VUs are told to stop. They finish the
//!    iteration they are in; a VU still busy after `graceful_ramp_down` is aborted.
//! 4. When the stages are exhausted, or the run is cancelled, every VU is told to stop
//!    and gets `graceful_stop` to finish its iteration before being aborted.
//!
//! # Mathematical behavior of the ramp
//! For stage `i` ending at cumulative time `T_i`, and `t` in `[T_{i-1}, T_i]`:
//!
//! ```text
//! f         = (t - T_{i-1}) / (T_i - T_{i-1})
//! target(t) = round(target_{i-1} + (target_i - target_{i-1}) * f)
//! ```
//!
//! `target_{-1}` is the executor's `start_vus`. A stage with a zero duration jumps
//! straight to its target.
pub mod stage;
pub use stage::{Stage, StageExecutor};

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::scenario::{RunContext, Scenario, Vu};

/// The runtime hook that executes a `Scenario`.
///
/// Implementations control concurrency and scheduling; the scenario only describes a
/// single iteration.
pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Error;
    /// Execute the scenario until completion or cancellation.
    ///
    /// Metrics are written to `ctx.run.collector` as the run progresses; the returned
    /// outcome only carries what the executor itself observed.
    fn exec(
        &self,
        scenario: &Scenario<F>,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<ExecOutcome, Self::Error>> + Send;
}

/// Lifecycle of a run as seen from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    /// The VU target is moving during this stage.
    Ramping { stage: usize },
    /// The VU target stays flat during this stage.
    Sustaining { stage: usize },
    /// No more VUs are started; running ones are finishing.
    Draining,
    Completed,
}

/// Everything an executor needs besides the scenario.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub run: Arc<RunContext>,
    /// Cancelling this token ends the run early. VUs still get their graceful stop.
    pub cancel: CancellationToken,
    pub state: Arc<watch::Sender<RunState>>,
}

impl ExecutionContext {
    pub fn new(run: Arc<RunContext>) -> (Self, watch::Receiver<RunState>) {
        let (tx, rx) = watch::channel(RunState::NotStarted);
        (
            Self {
                run,
                cancel: CancellationToken::new(),
                state: Arc::new(tx),
            },
            rx,
        )
    }

    pub(crate) fn publish(&self, state: RunState) {
        // send_replace never fails, even with no receiver left
        self.state.send_replace(state);
    }
}

/// What an executor observed while running.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// The run was cut short by cancellation.
    pub cancelled: bool,
    /// Iterations that ran to completion (including the ones that panicked).
    pub iterations: u64,
    /// Iterations aborted because their VU ran out of grace period.
    pub interrupted: u64,
    /// Highest number of simultaneously running VUs.
    pub max_vus: u64,
    /// VUs that were still running when the graceful stop expired.
    pub vus_at_end: u64,
    pub elapsed: Duration,
}
