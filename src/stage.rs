//! Stage definitions: processing functions and per-stage configuration.
//!
//! A stage is a plain function value plus a config struct; the two function
//! forms (per-item and whole-batch) are an explicit tagged union rather than
//! runtime type inspection.

use crate::error::BoxError;
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of a stage's bounded output channel.
pub const DEFAULT_STAGE_CHANNEL_CAPACITY: usize = 64;

/// A stage processing function.
///
/// Stage functions are ordinary synchronous code; workers run them off the
/// async runtime via `spawn_blocking`. Both forms transform an item into an
/// item of the same type. The batch form must return exactly one output per
/// input, in input order.
pub enum StageFn<T> {
    /// Applied to one item at a time. Failures are isolated per item.
    Single(Arc<dyn Fn(T) -> Result<T, BoxError> + Send + Sync>),

    /// Applied to a whole collected batch. A failure fails every request in
    /// the batch (all-or-nothing fault model).
    Batch(Arc<dyn Fn(Vec<T>) -> Result<Vec<T>, BoxError> + Send + Sync>),
}

// Manual impl: cloning shares the Arc and must not require `T: Clone`.
impl<T> Clone for StageFn<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(f) => Self::Single(f.clone()),
            Self::Batch(f) => Self::Batch(f.clone()),
        }
    }
}

impl<T> StageFn<T> {
    /// Wraps a per-item function.
    pub fn single(f: impl Fn(T) -> Result<T, BoxError> + Send + Sync + 'static) -> Self {
        Self::Single(Arc::new(f))
    }

    /// Wraps a whole-batch function.
    pub fn batch(f: impl Fn(Vec<T>) -> Result<Vec<T>, BoxError> + Send + Sync + 'static) -> Self {
        Self::Batch(Arc::new(f))
    }

    /// Returns a short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Batch(_) => "batch",
        }
    }
}

impl<T> std::fmt::Debug for StageFn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StageFn").field(&self.kind()).finish()
    }
}

/// Configuration for one stage, immutable once the pipeline is started.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Number of interchangeable worker replicas.
    pub workers: usize,

    /// CPU cores to pin workers to (round-robin over the list). Empty means
    /// no pinning; workers run as ordinary runtime tasks.
    pub cpu_pins: Vec<usize>,

    /// Maximum number of envelopes collected per worker invocation.
    /// `1` disables batching.
    pub batch_size: usize,

    /// Maximum wait for each envelope after the first, measured from the
    /// previous arrival. `Duration::ZERO` means: take only what is already
    /// queued once the first envelope is in.
    pub batch_wait: Duration,

    /// Capacity of this stage's bounded output channel.
    pub channel_capacity: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            cpu_pins: Vec::new(),
            batch_size: 1,
            batch_wait: Duration::ZERO,
            channel_capacity: DEFAULT_STAGE_CHANNEL_CAPACITY,
        }
    }
}

impl StageConfig {
    /// Sets the worker replica count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the batching policy.
    pub fn with_batch(mut self, batch_size: usize, batch_wait: Duration) -> Self {
        self.batch_size = batch_size;
        self.batch_wait = batch_wait;
        self
    }

    /// Sets the CPU pin list.
    pub fn with_cpu_pins(mut self, pins: Vec<usize>) -> Self {
        self.cpu_pins = pins;
        self
    }

    /// Sets the output channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Validates the configuration.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be >= 1".into());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be >= 1".into());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be >= 1".into());
        }
        Ok(())
    }
}

/// Handle describing a stage that was added to a pipeline.
#[derive(Debug, Clone)]
pub struct StageHandle {
    index: usize,
    config: StageConfig,
}

impl StageHandle {
    pub(crate) fn new(index: usize, config: StageConfig) -> Self {
        Self { index, config }
    }

    /// Position of the stage in the pipeline (0-based).
    pub fn index(&self) -> usize {
        self.index
    }

    /// The stage's configuration.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }
}
