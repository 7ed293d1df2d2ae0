//! Request submission and the in-flight slot map.
//!
//! The coordinator owns the id counter and the id → slot map, the only shared
//! mutable state in the pipeline. A slot is a one-shot channel registered 1:1
//! with a correlation id at submission time; the result router resolves it
//! exactly once. Resolution removes the map entry before sending, so a second
//! resolution of the same id is structurally impossible — it surfaces as
//! [`Resolution::NoSlot`] and the duplicate result is discarded.

use crate::envelope::{CorrelationId, Envelope};
use crate::error::PipelineError;
use crate::stats::PipelineStats;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of attempting to resolve a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The waiting caller received the result.
    Delivered,

    /// No slot was registered for this id (evicted by a submit timeout, or
    /// already resolved). The result is discarded.
    NoSlot,

    /// A slot existed but its caller had already gone away.
    Abandoned,
}

/// The id → result-slot map.
pub(crate) struct SlotMap<T> {
    slots: DashMap<CorrelationId, oneshot::Sender<Result<T, PipelineError>>>,
}

impl<T> SlotMap<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Registers a slot for an in-flight request.
    pub(crate) fn register(
        &self,
        id: CorrelationId,
        slot: oneshot::Sender<Result<T, PipelineError>>,
    ) {
        self.slots.insert(id, slot);
    }

    /// Resolves the slot for `id` with `result`, consuming the slot.
    pub(crate) fn resolve(&self, id: CorrelationId, result: Result<T, PipelineError>) -> Resolution {
        match self.slots.remove(&id) {
            Some((_, slot)) => {
                if slot.send(result).is_ok() {
                    Resolution::Delivered
                } else {
                    Resolution::Abandoned
                }
            }
            None => Resolution::NoSlot,
        }
    }

    /// Removes a slot without resolving it (submit timeout eviction).
    pub(crate) fn evict(&self, id: CorrelationId) -> bool {
        self.slots.remove(&id).is_some()
    }

    /// Drops every registered slot.
    ///
    /// Receivers observe the drop as a closed channel, which `submit` maps to
    /// [`PipelineError::Shutdown`].
    pub(crate) fn clear(&self) {
        self.slots.clear();
    }

    /// Number of in-flight slots.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// The submission side of the pipeline.
///
/// Owned by [`crate::pipeline::Pipeline`], which gates `submit` on lifecycle
/// state before delegating here.
pub(crate) struct Coordinator<T> {
    next_id: AtomicU64,
    slots: Arc<SlotMap<T>>,
    input: async_channel::Sender<Envelope<T>>,
    stats: Arc<PipelineStats>,
}

impl<T> Coordinator<T> {
    pub(crate) fn new(
        slots: Arc<SlotMap<T>>,
        input: async_channel::Sender<Envelope<T>>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots,
            input,
            stats,
        }
    }

    /// Submits a payload and waits for its correlated result.
    ///
    /// Suspends while the first stage's channel is full (the sole caller
    /// backpressure signal) and while waiting on the slot.
    pub(crate) async fn submit(&self, payload: T) -> Result<T, PipelineError> {
        let (id, rx) = self.register_slot();

        if self.input.send(Envelope::new(id, payload)).await.is_err() {
            // The pipeline stopped while this caller was backpressured.
            self.slots.evict(id);
            return Err(PipelineError::NotRunning);
        }
        self.stats.add_submitted();
        debug!(%id, "request submitted");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Shutdown),
        }
    }

    /// Like [`Self::submit`], but releases the caller after `timeout`.
    ///
    /// On expiry the slot is evicted; the envelope already in flight is
    /// discarded by the router when its result eventually surfaces.
    pub(crate) async fn submit_with_timeout(
        &self,
        payload: T,
        timeout: Duration,
    ) -> Result<T, PipelineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (id, rx) = self.register_slot();

        match tokio::time::timeout_at(deadline, self.input.send(Envelope::new(id, payload))).await {
            Ok(Ok(())) => self.stats.add_submitted(),
            Ok(Err(_)) => {
                self.slots.evict(id);
                return Err(PipelineError::NotRunning);
            }
            // Timed out while backpressured: nothing entered the pipeline.
            Err(_) => {
                self.slots.evict(id);
                return Err(PipelineError::SubmitTimeout(timeout));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PipelineError::Shutdown),
            Err(_) => {
                self.slots.evict(id);
                debug!(%id, ?timeout, "submit timed out, slot evicted");
                Err(PipelineError::SubmitTimeout(timeout))
            }
        }
    }

    /// Allocates a fresh id and registers its result slot.
    ///
    /// `submitted` is counted by the caller only once the envelope enters the
    /// first stage's channel; a request that never got in leaves no trace in
    /// the stats.
    fn register_slot(
        &self,
    ) -> (
        CorrelationId,
        oneshot::Receiver<Result<T, PipelineError>>,
    ) {
        let id = CorrelationId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.slots.register(id, tx);
        (id, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> CorrelationId {
        CorrelationId::from_raw(raw)
    }

    #[tokio::test]
    async fn test_slot_resolves_exactly_once() {
        let slots: SlotMap<i64> = SlotMap::new();
        let (tx, rx) = oneshot::channel();
        slots.register(id(1), tx);
        assert_eq!(slots.len(), 1);

        assert_eq!(slots.resolve(id(1), Ok(42)), Resolution::Delivered);
        assert_eq!(rx.await.unwrap().unwrap(), 42);
        assert_eq!(slots.len(), 0);

        // A duplicate result has no slot to land in.
        assert_eq!(slots.resolve(id(1), Ok(43)), Resolution::NoSlot);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_no_slot() {
        let slots: SlotMap<i64> = SlotMap::new();
        assert_eq!(slots.resolve(id(99), Ok(1)), Resolution::NoSlot);
    }

    #[tokio::test]
    async fn test_evicted_slot_discards_result() {
        let slots: SlotMap<i64> = SlotMap::new();
        let (tx, _rx) = oneshot::channel();
        slots.register(id(7), tx);

        assert!(slots.evict(id(7)));
        assert!(!slots.evict(id(7)));
        assert_eq!(slots.resolve(id(7), Ok(1)), Resolution::NoSlot);
    }

    #[tokio::test]
    async fn test_abandoned_slot_detected() {
        let slots: SlotMap<i64> = SlotMap::new();
        let (tx, rx) = oneshot::channel();
        slots.register(id(3), tx);
        drop(rx);

        assert_eq!(slots.resolve(id(3), Ok(1)), Resolution::Abandoned);
    }

    #[tokio::test]
    async fn test_clear_wakes_waiters_with_closed_channel() {
        let slots: SlotMap<i64> = SlotMap::new();
        let (tx, rx) = oneshot::channel();
        slots.register(id(5), tx);

        slots.clear();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_coordinator_ids_are_unique_and_monotonic() {
        let slots = Arc::new(SlotMap::<i64>::new());
        let (in_tx, in_rx) = async_channel::bounded(8);
        let coord = Coordinator::new(slots.clone(), in_tx, PipelineStats::new());

        let submit_a = tokio::spawn(async move { coord.submit(1).await });

        let env = in_rx.recv().await.unwrap();
        assert_eq!(env.id.raw(), 0);
        assert_eq!(env.value, 1);

        // Resolve through the slot map, as the router would.
        assert_eq!(slots.resolve(env.id, Ok(100)), Resolution::Delivered);
        assert_eq!(submit_a.await.unwrap().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_submit_on_closed_channel_fails_fast() {
        let slots = Arc::new(SlotMap::<i64>::new());
        let (in_tx, in_rx) = async_channel::bounded(8);
        let coord = Coordinator::new(slots.clone(), in_tx, PipelineStats::new());

        in_rx.close();
        let err = coord.submit(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotRunning));
        assert_eq!(slots.len(), 0);
    }

    #[tokio::test]
    async fn test_submit_with_timeout_evicts_slot() {
        let slots = Arc::new(SlotMap::<i64>::new());
        let (in_tx, _in_rx) = async_channel::bounded(8);
        let coord = Coordinator::new(slots.clone(), in_tx, PipelineStats::new());

        // Nothing consumes the envelope, so the slot never resolves.
        let err = coord
            .submit_with_timeout(1, Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::SubmitTimeout(_)));
        assert_eq!(slots.len(), 0);
    }

    #[tokio::test]
    async fn test_timeout_while_backpressured_leaves_stats_balanced() {
        let slots = Arc::new(SlotMap::<i64>::new());
        let (in_tx, _in_rx) = async_channel::bounded(1);
        let stats = PipelineStats::new();
        let coord = Coordinator::new(slots.clone(), in_tx.clone(), stats.clone());

        // Fill the capacity-1 channel so the next send backpressures.
        in_tx
            .send(Envelope::new(id(1000), 0))
            .await
            .unwrap();

        let err = coord
            .submit_with_timeout(1, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SubmitTimeout(_)));

        // The envelope never entered the pipeline: no slot, no submitted
        // count, nothing for in_flight() to drift on.
        assert_eq!(slots.len(), 0);
        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 0);
        assert_eq!(snap.in_flight(), 0);
    }
}
