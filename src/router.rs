//! The result router: the single consumer of the pipeline's final output and
//! error channels.
//!
//! Runs for the lifetime of the pipeline. Each iteration drains the success
//! channel preferentially (the `biased` select arm order), falls back to the
//! error channel, and suspends when both are momentarily empty. Every
//! correlation id that reaches the router is resolved at most once; envelopes
//! with no registered slot (evicted by a submit timeout) are discarded with a
//! debug log, never an error.

use crate::coordinator::{Resolution, SlotMap};
use crate::envelope::{Envelope, FaultEnvelope};
use crate::error::PipelineError;
use crate::stats::PipelineStats;
use async_channel::Receiver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Runs the router until cancelled or until both source channels close.
pub(crate) async fn run_router<T>(
    output: Receiver<Envelope<T>>,
    errors: Receiver<FaultEnvelope>,
    slots: Arc<SlotMap<T>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    debug!("result router started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            // Success results take precedence when both channels are ready.
            result = output.recv() => match result {
                Ok(env) => deliver_success(&slots, &stats, env),
                Err(_) => break,
            },

            result = errors.recv() => match result {
                Ok(fault) => deliver_fault(&slots, &stats, fault),
                Err(_) => break,
            },
        }
    }

    debug!(in_flight = slots.len(), "result router stopped");
}

fn deliver_success<T>(slots: &SlotMap<T>, stats: &PipelineStats, env: Envelope<T>) {
    let id = env.id;
    match slots.resolve(id, Ok(env.value)) {
        Resolution::Delivered => {
            stats.add_resolved_ok();
            trace!(%id, "result delivered");
        }
        Resolution::NoSlot | Resolution::Abandoned => {
            stats.add_dropped_result();
            debug!(%id, "result discarded: no waiting caller");
        }
    }
}

fn deliver_fault<T>(slots: &SlotMap<T>, stats: &PipelineStats, fault: FaultEnvelope) {
    let id = fault.id;
    match slots.resolve(id, Err(PipelineError::Stage(fault.error))) {
        Resolution::Delivered => {
            stats.add_resolved_err();
            trace!(%id, "stage error delivered");
        }
        Resolution::NoSlot | Resolution::Abandoned => {
            stats.add_dropped_result();
            debug!(%id, "stage error discarded: no waiting caller");
        }
    }
}
