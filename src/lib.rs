//! Batchline - micro-batching request pipeline
//!
//! This library accepts individually-submitted requests, funnels them through
//! an ordered sequence of processing stages (each running one or more parallel
//! worker replicas), opportunistically groups consecutive requests into
//! micro-batches for vectorized processing, and returns each request's result
//! to exactly the caller that submitted it.
//!
//! # Architecture
//!
//! ```text
//! caller ──► submit ──► ch[0] ──► Stage 1 workers ──► ch[1] ──► ... ──► ch[N]
//!    ▲                                │                                   │
//!    │                                └──── error channel ────┐           │
//!    │                                                        ▼           ▼
//!    └──────────── result slot ◄──────────────────────── Result Router ◄──┘
//! ```
//!
//! Each request is wrapped in an [`envelope::Envelope`] carrying a correlation
//! id. Batching is strictly internal to one worker invocation: stage output
//! channels always carry singletons, so ordering across worker replicas is
//! never assumed.
//!
//! # Example
//!
//! ```ignore
//! use batchline::{Pipeline, StageConfig, StageFn};
//! use std::time::Duration;
//!
//! let pipeline: Pipeline<i64> = Pipeline::new(64);
//!
//! pipeline.add_stage(
//!     StageFn::batch(|xs: Vec<i64>| Ok(xs.into_iter().map(|x| x * 2).collect())),
//!     StageConfig::default().with_batch(8, Duration::from_millis(5)),
//! )?;
//!
//! pipeline.start()?;
//! let doubled = pipeline.submit(21).await?; // 42
//! pipeline.stop();
//! ```

pub mod affinity;
pub mod batcher;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod router;
pub mod stage;
pub mod stats;

pub use envelope::{CorrelationId, Envelope, FaultEnvelope};
pub use error::{BoxError, PipelineError, StageError};
pub use pipeline::Pipeline;
pub use stage::{StageConfig, StageFn, StageHandle, DEFAULT_STAGE_CHANNEL_CAPACITY};
pub use stats::{PipelineStats, StatsSnapshot};

/// Version of the batchline library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
