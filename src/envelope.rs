//! Envelope types flowing between pipeline stages.
//!
//! An [`Envelope`] is the unit of data moving through stage channels: a
//! correlation id plus the in-flight payload. Exactly one envelope exists per
//! in-flight request; it is moved (never cloned) from channel to channel and
//! consumed by the result router.

use crate::error::StageError;

/// Opaque token linking a request to its eventual result across stages and
/// worker replicas.
///
/// Ids are allocated from a per-pipeline monotonic counter, so they are unique
/// among in-flight requests. Stages attach the id they received to their
/// output and never fabricate new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Creates a correlation id from a raw counter value.
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value (for logging and diagnostics).
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A correlated payload in flight between stages.
#[derive(Debug)]
pub struct Envelope<T> {
    /// Correlation id, attached for the envelope's entire lifetime.
    pub id: CorrelationId,

    /// The current payload value, replaced by each stage.
    pub value: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope.
    pub fn new(id: CorrelationId, value: T) -> Self {
        Self { id, value }
    }

    /// Replaces the payload, keeping the correlation id.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            id: self.id,
            value: f(self.value),
        }
    }
}

/// A correlated stage failure, travelling on the shared error channel.
#[derive(Debug)]
pub struct FaultEnvelope {
    /// Correlation id of the failed request.
    pub id: CorrelationId,

    /// What went wrong in the stage.
    pub error: StageError,
}

impl FaultEnvelope {
    /// Creates a new fault envelope.
    pub fn new(id: CorrelationId, error: StageError) -> Self {
        Self { id, error }
    }
}
