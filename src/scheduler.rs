//! Multi-threaded pipeline scheduler.
//!
//! The scheduler owns the registered steps, two queues of runnable steps
//! (calculation and I/O), and the worker threads. One dispatch mutex guards
//! all scheduling state; workers park on an associated condvar whenever
//! nothing is runnable.
//!
//! # Dispatch discipline
//!
//! - Runnable I/O steps take priority, but at most one I/O step executes at
//!   any instant (`io_active` head-of-line blocks the I/O queue).
//! - Ordered steps only become runnable when the chunk carrying their next
//!   expected sequence number has arrived; unordered steps whenever their
//!   FIFO is non-empty.
//! - When both queues are empty the idle worker pulls the source to inject
//!   a fresh chunk.
//! - At most one worker executes a given step at a time, so step-local state
//!   needs no locks.
//!
//! Shutdown is driven by chunk accounting: once the source reports
//! end-of-stream and the live-chunk counter reaches zero, workers exit and
//! the steps are finalized in ascending id order.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use anyhow::anyhow;
use log::{debug, info};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{PipelineError, Result, StepError};
use crate::progress::ProgressLogger;
use crate::step::{AnalyticalStep, ChunkBox, RoutedChunk, StepId, StepOrder, SOURCE_STEP_ID};

/// Multi-threaded scheduler for a pipeline of analytical steps.
///
/// Steps are registered under unique ids with [`add_step`](Self::add_step);
/// [`run`](Self::run) then drives the pipeline to completion. `run` consumes
/// the scheduler, so a pipeline cannot be mutated or rerun after it has
/// started.
pub struct Scheduler {
    /// Registered steps, in registration order.
    slots: Vec<SlotMeta>,
    /// Step id to slot index.
    by_id: AHashMap<StepId, usize>,
    /// Interval for the chunk progress logger.
    progress_interval: u64,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_id: AHashMap::new(),
            progress_interval: ProgressLogger::DEFAULT_INTERVAL,
        }
    }

    /// Set the interval at which chunk throughput is logged.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Register a step under `step_id`. Id 0 is the source.
    ///
    /// Duplicate ids are a configuration error reported immediately.
    pub fn add_step(&mut self, step_id: StepId, step: impl AnalyticalStep + 'static) -> Result<()> {
        if self.by_id.contains_key(&step_id) {
            return Err(PipelineError::DuplicateStepId { step_id });
        }
        let order = step.order();
        let file_io = step.file_io();
        self.by_id.insert(step_id, self.slots.len());
        self.slots.push(SlotMeta { id: step_id, order, file_io, step: Mutex::new(Box::new(step)) });
        Ok(())
    }

    /// Drive the pipeline to completion on `n_threads` worker threads.
    ///
    /// Returns a [`RunSummary`] iff no step signalled an error, no routing
    /// error occurred, and every step finalized cleanly. On failure the
    /// steps are *not* finalized and any chunks still in flight are dropped.
    pub fn run(self, n_threads: usize) -> Result<RunSummary> {
        if n_threads == 0 {
            return Err(PipelineError::InvalidThreadCount { requested: n_threads });
        }
        let Some(&source_slot) = self.by_id.get(&SOURCE_STEP_ID) else {
            return Err(PipelineError::MissingSource);
        };

        let started = Instant::now();
        info!("running pipeline: {} steps on {} worker threads", self.slots.len(), n_threads);

        let states = self.slots.iter().map(|_| SlotState::default()).collect();
        let shared = Arc::new(Shared {
            slots: self.slots,
            by_id: self.by_id,
            source_slot,
            dispatch: Mutex::new(DispatchState {
                states,
                queue_calc: VecDeque::new(),
                queue_io: VecDeque::new(),
                io_active: false,
                live_chunks: 0,
                seq_counter: 0,
                source_exhausted: false,
                executing_steps: 0,
                error: None,
                chunks_emitted: 0,
                process_calls: 0,
            }),
            work_ready: Condvar::new(),
            progress: ProgressLogger::new("chunks emitted").with_interval(self.progress_interval),
        });

        let mut workers = Vec::with_capacity(n_threads);
        for n in 0..n_threads {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("chunkflow-worker-{n}"))
                .spawn(move || worker_loop(&worker_shared));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.fail(PipelineError::ThreadSpawn(err));
                    break;
                }
            }
        }

        let mut worker_panicked = false;
        for handle in workers {
            worker_panicked |= handle.join().is_err();
        }
        shared.progress.log_complete();

        let (chunks_emitted, process_calls) = {
            let mut dispatch = shared.dispatch.lock();
            if let Some(error) = dispatch.error.take() {
                return Err(error);
            }
            (dispatch.chunks_emitted, dispatch.process_calls)
        };
        if worker_panicked {
            return Err(PipelineError::WorkerPanic);
        }

        // Finalize in ascending step-id order on this thread.
        let mut finalize_order: Vec<usize> = (0..shared.slots.len()).collect();
        finalize_order.sort_unstable_by_key(|&slot| shared.slots[slot].id);
        for slot in finalize_order {
            let meta = &shared.slots[slot];
            if let Err(err) = meta.step.lock().finalize() {
                return Err(match err {
                    StepError::Abort => PipelineError::StepAbort { step_id: meta.id },
                    StepError::Failed(reason) => PipelineError::StepFailed { step_id: meta.id, reason },
                });
            }
        }

        let summary = RunSummary { chunks_emitted, process_calls, elapsed: started.elapsed() };
        info!("pipeline complete: {summary}");
        Ok(summary)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics from a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Chunks emitted by the source.
    pub chunks_emitted: u64,
    /// Total `process` invocations across all steps.
    pub process_calls: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} chunks in {} process calls over {:.2}s",
            self.chunks_emitted,
            self.process_calls,
            self.elapsed.as_secs_f64()
        )
    }
}

/// A registered step plus its cached attributes.
///
/// The attributes are read once at registration so that dispatch decisions
/// never need the step's own lock.
struct SlotMeta {
    id: StepId,
    order: StepOrder,
    file_io: bool,
    step: Mutex<Box<dyn AnalyticalStep>>,
}

/// State shared between the coordinator and the workers.
struct Shared {
    slots: Vec<SlotMeta>,
    by_id: AHashMap<StepId, usize>,
    /// Slot index of the source step.
    source_slot: usize,
    dispatch: Mutex<DispatchState>,
    /// Signalled whenever work may have become available.
    work_ready: Condvar,
    progress: ProgressLogger,
}

impl Shared {
    /// Record `error` unless one is already set, and wake every worker.
    fn fail(&self, error: PipelineError) {
        let mut dispatch = self.dispatch.lock();
        if dispatch.error.is_none() {
            dispatch.error = Some(error);
        }
        drop(dispatch);
        self.work_ready.notify_all();
    }
}

/// Per-step scheduling state, guarded by the dispatch mutex.
#[derive(Default)]
struct SlotState {
    /// A worker is currently inside this step's `process`.
    executing: bool,
    /// The step sits on one of the runnable queues.
    queued: bool,
    /// Next sequence number an ordered step will consume.
    next_expected: u64,
    /// Out-of-order chunks awaiting in-order delivery (ordered steps).
    pending: BTreeMap<u64, ChunkBox>,
    /// Awaiting inputs (unordered steps, and recycled chunks for the source).
    fifo: VecDeque<(u64, ChunkBox)>,
}

impl SlotState {
    /// True if the step has an input it could consume right now.
    fn input_ready(&self, order: StepOrder, is_source: bool) -> bool {
        if is_source || order == StepOrder::Unordered {
            !self.fifo.is_empty()
        } else {
            self.pending.contains_key(&self.next_expected)
        }
    }
}

/// A claimed step invocation: prepared under the dispatch lock, executed
/// outside it.
struct Task {
    slot: usize,
    /// Sequence number carried by the input (fresh for the source).
    seq: u64,
    input: Option<ChunkBox>,
}

/// All mutable scheduler state, guarded by the dispatch mutex.
struct DispatchState {
    states: Vec<SlotState>,
    /// Runnable steps without file I/O.
    queue_calc: VecDeque<usize>,
    /// Runnable steps with file I/O.
    queue_io: VecDeque<usize>,
    /// A worker is currently executing an I/O step.
    io_active: bool,
    /// Chunks sitting in pending maps or FIFOs, or being processed.
    live_chunks: usize,
    /// Allocator for source sequence numbers.
    seq_counter: u64,
    source_exhausted: bool,
    /// Steps currently inside `process` (for stall detection).
    executing_steps: usize,
    /// First error observed; never cleared once set.
    error: Option<PipelineError>,
    chunks_emitted: u64,
    process_calls: u64,
}

impl DispatchState {
    /// Pick the next step to execute and pull its input, per the dispatch
    /// discipline. Returns `None` when nothing is currently runnable.
    fn select_task(&mut self, shared: &Shared) -> Option<Task> {
        if !self.io_active {
            while let Some(slot) = self.queue_io.pop_front() {
                self.states[slot].queued = false;
                if let Some(task) = self.start_step(shared, slot) {
                    self.io_active = true;
                    return Some(task);
                }
            }
        }
        while let Some(slot) = self.queue_calc.pop_front() {
            self.states[slot].queued = false;
            if let Some(task) = self.start_step(shared, slot) {
                return Some(task);
            }
        }

        // Nothing queued: pull the source to inject a fresh chunk.
        if !self.source_exhausted && self.queue_calc.is_empty() && self.queue_io.is_empty() {
            let slot = shared.source_slot;
            let file_io = shared.slots[slot].file_io;
            let state = &self.states[slot];
            if !state.executing && !state.queued && !(file_io && self.io_active) {
                if let Some(task) = self.start_step(shared, slot) {
                    if file_io {
                        self.io_active = true;
                    }
                    return Some(task);
                }
            }
        }
        None
    }

    /// Claim `slot` for execution if it has a consumable input, marking it
    /// executing and popping the input.
    fn start_step(&mut self, shared: &Shared, slot: usize) -> Option<Task> {
        if self.states[slot].executing {
            return None;
        }
        let is_source = slot == shared.source_slot;
        let (seq, input) = if is_source {
            if self.source_exhausted {
                return None;
            }
            let seq = self.seq_counter;
            self.seq_counter += 1;
            (seq, self.states[slot].fifo.pop_front().map(|(_, chunk)| chunk))
        } else {
            let state = &mut self.states[slot];
            match shared.slots[slot].order {
                StepOrder::Unordered => {
                    let (seq, chunk) = state.fifo.pop_front()?;
                    (seq, Some(chunk))
                }
                StepOrder::Ordered => {
                    let seq = state.next_expected;
                    let chunk = state.pending.remove(&seq)?;
                    state.next_expected += 1;
                    (seq, Some(chunk))
                }
            }
        };
        self.states[slot].executing = true;
        self.executing_steps += 1;
        self.process_calls += 1;
        Some(Task { slot, seq, input })
    }

    /// Route one output chunk to its target step, waking it if it became
    /// runnable.
    fn enqueue_routed(
        &mut self,
        shared: &Shared,
        from: StepId,
        seq: u64,
        routed: RoutedChunk,
    ) -> Result<()> {
        let RoutedChunk { target, chunk } = routed;
        let Some(&slot) = shared.by_id.get(&target) else {
            return Err(PipelineError::UnknownTarget { step_id: from, target });
        };
        let is_source = slot == shared.source_slot;
        if is_source && self.source_exhausted {
            // Recycled chunk with nobody left to reuse it.
            drop(chunk);
            return Ok(());
        }

        let order = shared.slots[slot].order;
        let is_ordered = !is_source && order == StepOrder::Ordered;
        if is_ordered && self.states[slot].pending.contains_key(&seq) {
            // An insert would silently replace the queued chunk; the
            // duplicate must be rejected before it is counted live.
            return Err(PipelineError::DuplicateSequence { step_id: target, seq });
        }

        self.live_chunks += 1;
        let state = &mut self.states[slot];
        let ready = if is_ordered {
            state.pending.insert(seq, chunk);
            seq == state.next_expected
        } else {
            state.fifo.push_back((seq, chunk));
            true
        };
        if ready && !state.executing && !state.queued {
            state.queued = true;
            if shared.slots[slot].file_io {
                self.queue_io.push_back(slot);
            } else {
                self.queue_calc.push_back(slot);
            }
        }
        Ok(())
    }

    /// Book-keeping after a `process` invocation: chunk accounting, output
    /// routing, source exhaustion, and re-queueing.
    fn complete_task(
        &mut self,
        shared: &Shared,
        slot: usize,
        seq: u64,
        consumed_input: bool,
        outcome: StepOutcome,
    ) {
        let meta = &shared.slots[slot];
        self.executing_steps -= 1;
        self.states[slot].executing = false;
        if meta.file_io {
            self.io_active = false;
        }
        if consumed_input {
            self.live_chunks -= 1;
        }

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(StepError::Abort) => {
                if self.error.is_none() {
                    self.error = Some(PipelineError::StepAbort { step_id: meta.id });
                }
                return;
            }
            Err(StepError::Failed(reason)) => {
                if self.error.is_none() {
                    self.error = Some(PipelineError::StepFailed { step_id: meta.id, reason });
                }
                return;
            }
        };

        let is_source = slot == shared.source_slot;
        if is_source && outputs.is_empty() {
            // End of stream: recycled chunks still queued for the source can
            // never be consumed, so the scheduler frees them here.
            self.source_exhausted = true;
            let state = &mut self.states[slot];
            let discarded = state.fifo.len();
            state.fifo.clear();
            self.live_chunks -= discarded;
            debug!("source exhausted after {} chunks", self.chunks_emitted);
            return;
        }

        if is_source {
            self.chunks_emitted += outputs.len() as u64;
            shared.progress.record(outputs.len() as u64);
        }
        for routed in outputs {
            if let Err(error) = self.enqueue_routed(shared, meta.id, seq, routed) {
                if self.error.is_none() {
                    self.error = Some(error);
                }
                return;
            }
        }

        // More input already waiting: put the step straight back on a queue.
        let state = &self.states[slot];
        if state.input_ready(meta.order, is_source) && !state.queued {
            self.states[slot].queued = true;
            if meta.file_io {
                self.queue_io.push_back(slot);
            } else {
                self.queue_calc.push_back(slot);
            }
        }
    }

    /// True when no state transition can ever happen again yet chunks remain:
    /// the source is done, nothing is executing, nothing is queued, but the
    /// live-chunk counter is non-zero. Some step must have swallowed a
    /// sequence number an ordered downstream was waiting for.
    fn is_stalled(&self) -> bool {
        self.source_exhausted
            && self.executing_steps == 0
            && self.live_chunks > 0
            && self.queue_calc.is_empty()
            && self.queue_io.is_empty()
    }
}

type StepOutcome = std::result::Result<Vec<RoutedChunk>, StepError>;

/// The loop each worker thread runs until shutdown or error.
fn worker_loop(shared: &Shared) {
    let mut dispatch = shared.dispatch.lock();
    loop {
        if dispatch.error.is_some() {
            break;
        }
        if dispatch.source_exhausted && dispatch.live_chunks == 0 {
            shared.work_ready.notify_all();
            break;
        }

        let Some(task) = dispatch.select_task(shared) else {
            if dispatch.is_stalled() {
                let live_chunks = dispatch.live_chunks;
                dispatch.error = Some(PipelineError::Stalled { live_chunks });
                shared.work_ready.notify_all();
                break;
            }
            shared.work_ready.wait(&mut dispatch);
            continue;
        };

        let Task { slot, seq, input } = task;
        let consumed_input = input.is_some();
        let step_id = shared.slots[slot].id;
        let outcome = MutexGuard::unlocked(&mut dispatch, || {
            let mut step = shared.slots[slot].step.lock();
            panic::catch_unwind(AssertUnwindSafe(|| step.process(input))).unwrap_or_else(|_| {
                Err(StepError::Failed(anyhow!("step {step_id} panicked during process")))
            })
        });

        dispatch.complete_task(shared, slot, seq, consumed_input, outcome);
        shared.work_ready.notify_all();
    }
}
