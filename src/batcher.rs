//! Worker loop and micro-batch collection policy.
//!
//! Each worker replica runs [`run_worker`]: an endless cycle of collecting a
//! batch from the stage's shared input channel, invoking the stage function,
//! and fanning the results back out as individual envelopes. Batching is
//! invisible outside the worker; output channels always carry singletons.
//!
//! # Collection policy
//!
//! The first envelope of a cycle is awaited with no deadline. Each subsequent
//! envelope is awaited for at most `batch_wait`, measured from the previous
//! arrival rather than from batch start. Worst-case latency added by a single
//! batch is therefore `batch_wait * batch_size`.
//!
//! A `batch_wait` of zero degrades to "take what is already queued": the
//! worker blocks for the first envelope, then drains without any artificial
//! delay.

use crate::envelope::{CorrelationId, Envelope, FaultEnvelope};
use crate::error::StageError;
use crate::stage::StageFn;
use async_channel::{Receiver, Sender, TryRecvError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Everything one worker replica needs to run.
pub(crate) struct WorkerContext<T> {
    pub stage_index: usize,
    pub worker_index: usize,
    pub stage_fn: StageFn<T>,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub input: Receiver<Envelope<T>>,
    pub output: Sender<Envelope<T>>,
    pub errors: Sender<FaultEnvelope>,
    pub cancel: CancellationToken,
}

/// Collects one batch from the input channel.
///
/// Returns `None` when the channel is closed and drained, which is the
/// worker's clean-termination signal. A batch collected before the close is
/// still returned and processed.
pub(crate) async fn collect_batch<T>(
    input: &Receiver<Envelope<T>>,
    batch_size: usize,
    batch_wait: Duration,
) -> Option<Vec<Envelope<T>>> {
    // First envelope: wait indefinitely.
    let first = input.recv().await.ok()?;

    let mut batch = Vec::with_capacity(batch_size);
    batch.push(first);

    while batch.len() < batch_size {
        if batch_wait.is_zero() {
            match input.try_recv() {
                Ok(env) => batch.push(env),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        } else {
            // Per-element deadline, relative to the previous arrival.
            match tokio::time::timeout(batch_wait, input.recv()).await {
                Ok(Ok(env)) => batch.push(env),
                Ok(Err(_)) => break, // closed; process what we have
                Err(_) => break,     // wait expired
            }
        }
    }

    Some(batch)
}

/// Runs one worker replica until the input channel closes or the pipeline is
/// cancelled.
pub(crate) async fn run_worker<T: Send + 'static>(ctx: WorkerContext<T>) {
    debug!(
        stage = ctx.stage_index,
        worker = ctx.worker_index,
        kind = ctx.stage_fn.kind(),
        batch_size = ctx.batch_size,
        "worker started"
    );

    loop {
        let batch = tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break,

            batch = collect_batch(&ctx.input, ctx.batch_size, ctx.batch_wait) => {
                match batch {
                    Some(batch) => batch,
                    None => break, // input closed: clean shutdown, not an error
                }
            }
        };

        trace!(
            stage = ctx.stage_index,
            worker = ctx.worker_index,
            size = batch.len(),
            "batch collected"
        );

        if !process_batch(&ctx, batch).await {
            break;
        }
    }

    debug!(
        stage = ctx.stage_index,
        worker = ctx.worker_index,
        "worker stopped"
    );
}

/// Invokes the stage function on one collected batch and routes the outcome.
///
/// Returns `false` when a downstream channel has gone away (shutdown).
async fn process_batch<T: Send + 'static>(ctx: &WorkerContext<T>, batch: Vec<Envelope<T>>) -> bool {
    let stage = ctx.stage_index;
    let mut ids = Vec::with_capacity(batch.len());
    let mut values = Vec::with_capacity(batch.len());
    for env in batch {
        ids.push(env.id);
        values.push(env.value);
    }

    match &ctx.stage_fn {
        StageFn::Batch(f) => {
            let f = f.clone();
            let expected = values.len();
            // Stage functions are ordinary blocking code; keep them off the
            // async runtime.
            let joined = tokio::task::spawn_blocking(move || f(values)).await;

            match joined {
                Ok(Ok(outputs)) if outputs.len() == expected => {
                    for (id, value) in ids.into_iter().zip(outputs) {
                        if !send_result(ctx, Envelope::new(id, value)).await {
                            return false;
                        }
                    }
                }
                Ok(Ok(outputs)) => {
                    let error = StageError::LengthMismatch {
                        stage,
                        expected,
                        actual: outputs.len(),
                    };
                    return fail_all(ctx, &ids, error).await;
                }
                Ok(Err(e)) => {
                    // All-or-nothing: one failing batch fails every request
                    // that was collected into it.
                    let error = StageError::function(stage, e.to_string());
                    return fail_all(ctx, &ids, error).await;
                }
                Err(join_err) => {
                    let error = StageError::Panicked {
                        stage,
                        message: join_err.to_string(),
                    };
                    return fail_all(ctx, &ids, error).await;
                }
            }
        }
        StageFn::Single(f) => {
            let f = f.clone();
            let joined = tokio::task::spawn_blocking(move || {
                values.into_iter().map(|v| f(v)).collect::<Vec<_>>()
            })
            .await;

            match joined {
                Ok(results) => {
                    // Per-item isolation: each item succeeds or fails alone.
                    for (id, result) in ids.into_iter().zip(results) {
                        let delivered = match result {
                            Ok(value) => send_result(ctx, Envelope::new(id, value)).await,
                            Err(e) => {
                                send_fault(
                                    ctx,
                                    FaultEnvelope::new(
                                        id,
                                        StageError::function(stage, e.to_string()),
                                    ),
                                )
                                .await
                            }
                        };
                        if !delivered {
                            return false;
                        }
                    }
                }
                Err(join_err) => {
                    let error = StageError::Panicked {
                        stage,
                        message: join_err.to_string(),
                    };
                    return fail_all(ctx, &ids, error).await;
                }
            }
        }
    }

    true
}

/// Pushes one fault envelope per affected id onto the error channel.
async fn fail_all<T>(ctx: &WorkerContext<T>, ids: &[CorrelationId], error: StageError) -> bool {
    debug!(
        stage = ctx.stage_index,
        worker = ctx.worker_index,
        affected = ids.len(),
        %error,
        "batch failed"
    );
    for &id in ids {
        if !send_fault(ctx, FaultEnvelope::new(id, error.clone())).await {
            return false;
        }
    }
    true
}

/// Sends a success envelope downstream, bailing out on cancellation.
async fn send_result<T>(ctx: &WorkerContext<T>, env: Envelope<T>) -> bool {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => false,
        sent = ctx.output.send(env) => sent.is_ok(),
    }
}

/// Sends a fault envelope to the shared error channel, bailing out on
/// cancellation.
async fn send_fault<T>(ctx: &WorkerContext<T>, fault: FaultEnvelope) -> bool {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => false,
        sent = ctx.errors.send(fault) => sent.is_ok(),
    }
}
