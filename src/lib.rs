#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! # chunkflow - Multi-threaded pipeline scheduler
//!
//! This library drives a user-assembled directed pipeline of *analytical steps*
//! over a stream of *data chunks*, executing work across a fixed thread pool
//! while honouring per-step ordering and I/O-exclusivity constraints.
//!
//! ## Overview
//!
//! - **[`step`]** - The [`AnalyticalStep`] trait, chunk ownership types, and
//!   step attributes (ordering mode, I/O flag)
//! - **[`scheduler`]** - The [`Scheduler`]: step registration, the worker
//!   pool, and the dispatch loop
//! - **[`sink`]** - [`StatisticsSink`], a reusable accumulator pool that lets
//!   many workers collect per-checkout state merged into one result at the end
//! - **[`progress`]** - Interval-based progress logging
//! - **[`errors`]** - Error types, including the silent abort sentinel
//!
//! ## Quick Start
//!
//! A pipeline is a set of steps keyed by id. The step with id 0 is the
//! *source*: it is called with no input (or with a recycled chunk) and emits
//! new chunks until it returns an empty list. Every other step consumes one
//! chunk per call and routes its outputs onward by step id.
//!
//! ```
//! use chunkflow::{
//!     AnalyticalStep, ChunkBox, RoutedChunk, Scheduler, StepOrder, StepOutput,
//! };
//!
//! /// Emits the integers 0..10.
//! struct Counter {
//!     remaining: u64,
//! }
//!
//! impl AnalyticalStep for Counter {
//!     fn order(&self) -> StepOrder {
//!         StepOrder::Unordered
//!     }
//!
//!     fn process(&mut self, _input: Option<ChunkBox>) -> StepOutput {
//!         if self.remaining == 0 {
//!             return Ok(Vec::new()); // end of stream
//!         }
//!         self.remaining -= 1;
//!         Ok(vec![RoutedChunk::to(1, self.remaining)])
//!     }
//! }
//!
//! /// Sums everything it receives.
//! struct Total {
//!     sum: u64,
//! }
//!
//! impl AnalyticalStep for Total {
//!     fn order(&self) -> StepOrder {
//!         StepOrder::Ordered
//!     }
//!
//!     fn process(&mut self, input: Option<ChunkBox>) -> StepOutput {
//!         if let Some(value) = input.and_then(|chunk| chunk.downcast::<u64>().ok()) {
//!             self.sum += *value;
//!         }
//!         Ok(Vec::new())
//!     }
//! }
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.add_step(0, Counter { remaining: 10 }).unwrap();
//! scheduler.add_step(1, Total { sum: 0 }).unwrap();
//! let summary = scheduler.run(4).unwrap();
//! assert_eq!(summary.chunks_emitted, 10);
//! ```

pub mod errors;
pub mod progress;
pub mod scheduler;
pub mod sink;
pub mod step;

pub use errors::{PipelineError, Result, StepError};
pub use progress::ProgressLogger;
pub use scheduler::{RunSummary, Scheduler};
pub use sink::{Merge, StatisticsSink};
pub use step::{
    AnalyticalStep, ChunkBox, RoutedChunk, StepId, StepOrder, StepOutput, SOURCE_STEP_ID,
};
