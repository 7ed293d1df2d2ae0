//! Pipeline construction, lifecycle, and the public submission API.
//!
//! A [`Pipeline`] is built by adding stages in order: each `add_stage` call
//! allocates the stage's bounded output channel and wires the previous tail
//! (initially the submission channel) as its input. `start` spawns every
//! worker replica plus the result router; `stop` cancels them and fails any
//! still-blocked submitters.
//!
//! ```text
//! submit ─► ch[0] ─► stage 0 workers ─► ch[1] ─► ... ─► ch[N] ─► router
//!                        │ faults                                   ▲
//!                        └───────────── error channel ──────────────┘
//! ```

use crate::batcher::{run_worker, WorkerContext};
use crate::coordinator::{Coordinator, SlotMap};
use crate::envelope::{Envelope, FaultEnvelope};
use crate::error::PipelineError;
use crate::stage::{StageConfig, StageFn, StageHandle, DEFAULT_STAGE_CHANNEL_CAPACITY};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::{affinity, router};
use async_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A stage recorded during construction, before workers exist.
struct StageSpec<T> {
    stage_fn: StageFn<T>,
    config: StageConfig,
    input: Receiver<Envelope<T>>,
    output: Sender<Envelope<T>>,
}

/// Lifecycle state guarded by one mutex.
///
/// The channels needed for wiring live in `Building` and are moved into the
/// spawned tasks at start, so a running pipeline holds no receiver clones
/// that could keep channels artificially open.
enum State<T> {
    Building {
        stages: Vec<StageSpec<T>>,
        tail: Receiver<Envelope<T>>,
        err_tx: Sender<FaultEnvelope>,
        err_rx: Receiver<FaultEnvelope>,
    },
    Running,
    Stopped,
}

/// The multi-stage micro-batching pipeline.
///
/// Safe to share behind an `Arc` and to call [`Pipeline::submit`] from many
/// tasks concurrently.
pub struct Pipeline<T> {
    coordinator: Coordinator<T>,
    submit_tx: Sender<Envelope<T>>,
    slots: Arc<SlotMap<T>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    state: Mutex<State<T>>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Creates an empty pipeline.
    ///
    /// `submission_capacity` bounds the first channel: once it is full,
    /// `submit` callers block, which is the system's sole flow-control
    /// mechanism. The shared error channel uses the same capacity.
    pub fn new(submission_capacity: usize) -> Self {
        let (submit_tx, submit_rx) = async_channel::bounded(submission_capacity.max(1));
        let (err_tx, err_rx) = async_channel::bounded(submission_capacity.max(1));

        let slots = Arc::new(SlotMap::new());
        let stats = PipelineStats::new();
        let coordinator = Coordinator::new(slots.clone(), submit_tx.clone(), stats.clone());

        Self {
            coordinator,
            submit_tx,
            slots,
            stats,
            cancel: CancellationToken::new(),
            state: Mutex::new(State::Building {
                stages: Vec::new(),
                tail: submit_rx,
                err_tx,
                err_rx,
            }),
        }
    }

    /// Appends a stage to the pipeline.
    ///
    /// The stage reads from the previous stage's output channel (or the
    /// submission channel for the first stage) and writes singleton envelopes
    /// to a freshly allocated bounded channel.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a rejected config; `AlreadyStarted` when called
    /// after `start`.
    pub fn add_stage(
        &self,
        stage_fn: StageFn<T>,
        config: StageConfig,
    ) -> Result<StageHandle, PipelineError> {
        config.validate().map_err(PipelineError::InvalidConfig)?;

        let mut state = self.state.lock().unwrap();
        let State::Building { stages, tail, .. } = &mut *state else {
            return Err(PipelineError::AlreadyStarted);
        };

        let (out_tx, out_rx) = async_channel::bounded(config.channel_capacity);
        let input = std::mem::replace(tail, out_rx);

        let index = stages.len();
        stages.push(StageSpec {
            stage_fn,
            config: config.clone(),
            input,
            output: out_tx,
        });

        debug!(
            stage = index,
            workers = config.workers,
            batch_size = config.batch_size,
            "stage added"
        );
        Ok(StageHandle::new(index, config))
    }

    /// Starts all stage workers and the result router.
    ///
    /// Must be called from within a tokio runtime; stages with CPU pins
    /// additionally require a multi-thread runtime, since their dedicated
    /// worker threads drive the runtime through its handle. Calling twice is
    /// an error; a stopped pipeline cannot be restarted.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap();

        let prev = std::mem::replace(&mut *state, State::Running);
        let (stages, tail, err_tx, err_rx) = match prev {
            State::Building {
                stages,
                tail,
                err_tx,
                err_rx,
            } => {
                if stages.is_empty() {
                    *state = State::Building {
                        stages,
                        tail,
                        err_tx,
                        err_rx,
                    };
                    return Err(PipelineError::InvalidConfig(
                        "pipeline has no stages".into(),
                    ));
                }
                (stages, tail, err_tx, err_rx)
            }
            State::Running => {
                *state = State::Running;
                return Err(PipelineError::AlreadyRunning);
            }
            State::Stopped => {
                *state = State::Stopped;
                return Err(PipelineError::AlreadyStarted);
            }
        };

        let stage_count = stages.len();

        // Router drains the final stage's output plus the shared error
        // channel for the lifetime of the pipeline.
        tokio::spawn(router::run_router(
            tail,
            err_rx,
            self.slots.clone(),
            self.stats.clone(),
            self.cancel.clone(),
        ));

        let mut worker_count = 0;
        for (index, spec) in stages.into_iter().enumerate() {
            for worker in 0..spec.config.workers {
                let ctx = WorkerContext {
                    stage_index: index,
                    worker_index: worker,
                    stage_fn: spec.stage_fn.clone(),
                    batch_size: spec.config.batch_size,
                    batch_wait: spec.config.batch_wait,
                    input: spec.input.clone(),
                    output: spec.output.clone(),
                    errors: err_tx.clone(),
                    cancel: self.cancel.clone(),
                };

                if spec.config.cpu_pins.is_empty() {
                    tokio::spawn(run_worker(ctx));
                } else {
                    spawn_pinned_worker(index, worker, &spec.config.cpu_pins, ctx);
                }
                worker_count += 1;
            }
            // Dropping the spec here releases this stage's own channel
            // handles; only its workers keep them alive now.
        }

        info!(stages = stage_count, workers = worker_count, "pipeline started");
        Ok(())
    }

    /// Submits a payload and waits for its result.
    ///
    /// Fails fast with [`PipelineError::NotRunning`] before `start` or after
    /// `stop`. Otherwise blocks while the submission channel is full and
    /// until the result router resolves this request's slot.
    pub async fn submit(&self, payload: T) -> Result<T, PipelineError> {
        self.check_running()?;
        self.coordinator.submit(payload).await
    }

    /// Like [`Self::submit`], bounded by `timeout`.
    ///
    /// On expiry the caller is released and the request's slot is removed;
    /// the envelope already in flight is discarded by the router when its
    /// result surfaces.
    pub async fn submit_with_timeout(
        &self,
        payload: T,
        timeout: Duration,
    ) -> Result<T, PipelineError> {
        self.check_running()?;
        self.coordinator.submit_with_timeout(payload, timeout).await
    }

    /// Stops the pipeline.
    ///
    /// Cancels all workers and the router, closes the submission channel, and
    /// fails still-waiting submitters with [`PipelineError::Shutdown`].
    /// In-flight batches are not drained. Idempotent and non-blocking.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Stopped) {
            return;
        }
        *state = State::Stopped;
        drop(state);

        self.cancel.cancel();
        self.submit_tx.close();
        self.slots.clear();

        info!(stats = %self.stats.snapshot(), "pipeline stopped");
    }

    /// Returns true while the pipeline accepts submissions.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Running)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of requests currently awaiting resolution.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    fn check_running(&self) -> Result<(), PipelineError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PipelineError::NotRunning)
        }
    }
}

impl<T: Send + 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new(DEFAULT_STAGE_CHANNEL_CAPACITY)
    }
}

impl<T> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.submit_tx.close();
        self.slots.clear();
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("in_flight", &self.slots.len())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// Spawns one worker on a dedicated, pinned OS thread.
///
/// The thread drives the async worker loop to completion via the runtime
/// handle, so the worker's blocking stage invocations never contend with
/// runtime tasks for a core.
fn spawn_pinned_worker<T: Send + 'static>(
    stage: usize,
    worker: usize,
    cpu_pins: &[usize],
    ctx: WorkerContext<T>,
) {
    let core = cpu_pins[worker % cpu_pins.len()];
    let handle = tokio::runtime::Handle::current();

    std::thread::Builder::new()
        .name(format!("stage-{stage}-worker-{worker}"))
        .spawn(move || {
            affinity::pin_current_thread(core);
            handle.block_on(run_worker(ctx));
        })
        .expect("failed to spawn pinned worker thread");
}
