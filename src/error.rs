//! Error types for the pipeline.
//!
//! Errors are split in two layers: [`StageError`] describes what went wrong
//! inside a stage invocation and travels on the error channel, while
//! [`PipelineError`] is what `submit` callers observe. Callers are never
//! exposed to internal channel or scheduling machinery.

use std::time::Duration;
use thiserror::Error;

/// Boxed error type returned by user stage functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A failure produced by one stage invocation.
///
/// Stage errors are soft: the worker that produced one keeps running, and the
/// failure is routed to the affected request(s) only.
#[derive(Debug, Error, Clone)]
pub enum StageError {
    /// The stage function returned an error.
    #[error("stage {stage} failed: {message}")]
    Function { stage: usize, message: String },

    /// A batch stage function returned a result of the wrong length.
    ///
    /// Positional correspondence between inputs and outputs is the contract
    /// that makes correlation-preserving fan-out possible, so a mismatch is a
    /// hard error for the whole batch.
    #[error("stage {stage} returned {actual} results for {expected} inputs")]
    LengthMismatch {
        stage: usize,
        expected: usize,
        actual: usize,
    },

    /// The stage function panicked.
    #[error("stage {stage} panicked: {message}")]
    Panicked { stage: usize, message: String },
}

impl StageError {
    /// Creates a stage function error.
    pub fn function(stage: usize, message: impl Into<String>) -> Self {
        Self::Function {
            stage,
            message: message.into(),
        }
    }

    /// Returns the index of the stage that produced this error.
    pub fn stage(&self) -> usize {
        match self {
            Self::Function { stage, .. }
            | Self::LengthMismatch { stage, .. }
            | Self::Panicked { stage, .. } => *stage,
        }
    }
}

/// Errors returned to `submit` callers and lifecycle API users.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `submit` was called before `start` or after `stop`.
    #[error("pipeline is not running")]
    NotRunning,

    /// `start` was called twice.
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// The pipeline has already been started (stages cannot be added, and a
    /// stopped pipeline cannot be restarted).
    #[error("pipeline has already been started")]
    AlreadyStarted,

    /// A stage configuration was rejected.
    #[error("invalid stage config: {0}")]
    InvalidConfig(String),

    /// A stage failed while processing this request.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// The per-submit timeout expired before a result arrived.
    ///
    /// The envelope already in flight cannot be retracted; the router
    /// discards its result when it eventually surfaces.
    #[error("no result within {0:?}")]
    SubmitTimeout(Duration),

    /// The pipeline was stopped while this request was in flight.
    #[error("pipeline shut down with request in flight")]
    Shutdown,
}
