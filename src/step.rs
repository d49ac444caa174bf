//! Analytical steps and the chunks that flow between them.
//!
//! A pipeline is assembled from implementations of [`AnalyticalStep`], each
//! registered under a unique id. Chunks are opaque to the scheduler: it only
//! moves them between steps and drops whatever is left at teardown. Steps
//! downcast their inputs back to the concrete payload types they expect.

use std::any::Any;

use crate::errors::StepError;

/// Identifier of a registered step. Ids must be unique but need not be dense.
pub type StepId = usize;

/// The step id reserved for the source.
pub const SOURCE_STEP_ID: StepId = 0;

/// An opaque, owned chunk payload.
///
/// The scheduler never inspects chunk contents. Ownership moves with the
/// chunk: from the producing step to the scheduler's queues, then to the
/// consuming step. Chunks still queued when the pipeline tears down are
/// dropped by the scheduler.
pub type ChunkBox = Box<dyn Any + Send>;

/// A chunk paired with the id of the step that must consume it next.
pub struct RoutedChunk {
    /// Id of the receiving step.
    pub target: StepId,
    /// The payload.
    pub chunk: ChunkBox,
}

impl RoutedChunk {
    /// Pair an already-boxed chunk with its destination.
    #[must_use]
    pub fn new(target: StepId, chunk: ChunkBox) -> Self {
        Self { target, chunk }
    }

    /// Box a payload and route it to `target`.
    #[must_use]
    pub fn to<T: Any + Send>(target: StepId, payload: T) -> Self {
        Self { target, chunk: Box::new(payload) }
    }
}

/// The outputs of one `process` invocation.
pub type StepOutput = std::result::Result<Vec<RoutedChunk>, StepError>;

/// Whether a step must consume its inputs in emission order.
///
/// Processing steps are typically unordered; writers are typically ordered so
/// that output order matches input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOrder {
    /// Inputs are delivered strictly in ascending sequence-number order.
    Ordered,
    /// Inputs are delivered in whatever order they become available.
    Unordered,
}

/// A unit of work in the pipeline.
///
/// The step registered under id 0 is the *source*: the scheduler pulls it to
/// inject new chunks, passing either `None` or a chunk that a downstream step
/// routed back to id 0 for reuse. The source signals end-of-stream by
/// returning an empty list, after which it is never called again.
///
/// Every other step receives exactly one chunk per call. Whenever an ordered
/// step sits downstream, a step must forward at least one chunk per call so
/// that sequence tracking stays contiguous; a step whose downstreams are all
/// unordered may consume chunks without producing any.
///
/// The scheduler runs at most one invocation of a given step at a time, so
/// step-local state needs no synchronisation. State shared *between* steps
/// (for example a [`StatisticsSink`](crate::sink::StatisticsSink)) must be
/// thread-safe.
pub trait AnalyticalStep: Send {
    /// The ordering constraint on this step's inputs.
    fn order(&self) -> StepOrder;

    /// True if the step performs filesystem I/O. At most one I/O step runs at
    /// any instant, pipeline-wide.
    fn file_io(&self) -> bool {
        false
    }

    /// Consume zero or one chunk and emit routed outputs.
    ///
    /// Returning `Err(StepError::Abort)` tears the pipeline down without any
    /// further logging from the scheduler; any other error is surfaced with
    /// this step's id attached.
    fn process(&mut self, input: Option<ChunkBox>) -> StepOutput;

    /// Called once per step after all chunks have been processed, in
    /// ascending step-id order, on a single thread. Not called when the run
    /// failed.
    fn finalize(&mut self) -> std::result::Result<(), StepError> {
        Ok(())
    }
}
