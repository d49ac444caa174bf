//! Error types for pipeline construction and execution.

use std::io;

use thiserror::Error;

use crate::step::StepId;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure raised from inside a step's `process` or `finalize`.
///
/// `Abort` is a dedicated sentinel for steps that have already reported their
/// own diagnostics; the scheduler tears the pipeline down without logging
/// anything further. Every other failure travels as `Failed` and is surfaced
/// with the offending step's id.
#[derive(Error, Debug)]
pub enum StepError {
    /// Deliberate abort. The thrower owns any diagnostic output.
    #[error("step aborted")]
    Abort,

    /// Any other failure escaping a step.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Error type for pipeline configuration and execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A step id was registered twice.
    #[error("step id {step_id} is already registered")]
    DuplicateStepId {
        /// The offending id
        step_id: StepId,
    },

    /// `run` was called without a source step (id 0).
    #[error("no source step (id 0) registered")]
    MissingSource,

    /// `run` was called with zero worker threads.
    #[error("invalid thread count: {requested} (must be >= 1)")]
    InvalidThreadCount {
        /// The requested thread count
        requested: usize,
    },

    /// A step routed a chunk to an id that was never registered.
    #[error("step {step_id} routed a chunk to unregistered step id {target}")]
    UnknownTarget {
        /// The step that produced the chunk
        step_id: StepId,
        /// The unregistered destination
        target: StepId,
    },

    /// An ordered step received the same sequence number twice.
    #[error("ordered step {step_id} received sequence number {seq} twice")]
    DuplicateSequence {
        /// The receiving step
        step_id: StepId,
        /// The duplicated sequence number
        seq: u64,
    },

    /// The source is exhausted, nothing is runnable, yet chunks remain in
    /// flight. This is the signature of a step that swallowed a sequence
    /// number an ordered downstream was still waiting for.
    #[error("pipeline stalled with {live_chunks} chunks in flight and no runnable step")]
    Stalled {
        /// Chunks still queued or pending when the stall was detected
        live_chunks: usize,
    },

    /// A step raised the abort sentinel.
    #[error("step {step_id} aborted")]
    StepAbort {
        /// The aborting step
        step_id: StepId,
    },

    /// A step failed with an ordinary error, or panicked inside `process`.
    #[error("step {step_id} failed: {reason}")]
    StepFailed {
        /// The failing step
        step_id: StepId,
        /// The underlying failure
        reason: anyhow::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(io::Error),

    /// A worker thread died outside of a step invocation.
    #[error("worker thread panicked outside of a step")]
    WorkerPanic,
}
