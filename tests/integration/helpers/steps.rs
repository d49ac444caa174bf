//! Reusable test steps.
//!
//! The payloads carry a plain integer plus optional drop instrumentation so
//! tests can assert that every chunk the source created was eventually freed,
//! whether by a step or by the scheduler's teardown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use chunkflow::{AnalyticalStep, ChunkBox, RoutedChunk, StepError, StepId, StepOrder, StepOutput};

/// Integer payload with optional drop counting.
pub struct Payload {
    pub value: u64,
    dropped: Option<Arc<AtomicUsize>>,
}

impl Payload {
    pub fn new(value: u64) -> Self {
        Self { value, dropped: None }
    }

    pub fn tracked(value: u64, dropped: &Arc<AtomicUsize>) -> Self {
        Self { value, dropped: Some(Arc::clone(dropped)) }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(counter) = &self.dropped {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Source emitting the integers `1..=limit`, one call per value, with a copy
/// routed to every target.
pub struct NumberSource {
    next: u64,
    limit: u64,
    targets: Vec<StepId>,
    counters: Option<(Arc<AtomicUsize>, Arc<AtomicUsize>)>,
}

impl NumberSource {
    pub fn new(limit: u64, target: StepId) -> Self {
        Self { next: 0, limit, targets: vec![target], counters: None }
    }

    pub fn fanning_out(limit: u64, targets: Vec<StepId>) -> Self {
        Self { next: 0, limit, targets, counters: None }
    }

    /// Count every payload constructed and every payload dropped, for
    /// conservation assertions.
    pub fn with_chunk_counters(
        mut self,
        created: &Arc<AtomicUsize>,
        dropped: &Arc<AtomicUsize>,
    ) -> Self {
        self.counters = Some((Arc::clone(created), Arc::clone(dropped)));
        self
    }
}

impl AnalyticalStep for NumberSource {
    fn order(&self) -> StepOrder {
        StepOrder::Unordered
    }

    fn process(&mut self, _input: Option<ChunkBox>) -> StepOutput {
        if self.next == self.limit {
            return Ok(Vec::new());
        }
        self.next += 1;
        let outputs = self
            .targets
            .iter()
            .map(|&target| {
                let payload = match &self.counters {
                    Some((created, dropped)) => {
                        created.fetch_add(1, Ordering::SeqCst);
                        Payload::tracked(self.next, dropped)
                    }
                    None => Payload::new(self.next),
                };
                RoutedChunk::to(target, payload)
            })
            .collect();
        Ok(outputs)
    }
}

/// Terminal step recording every value it receives. Optionally hands the
/// spent chunk onward (e.g. back to the source for reuse).
pub struct CollectStep {
    order: StepOrder,
    values: Arc<Mutex<Vec<u64>>>,
    forward: Option<StepId>,
    finalized: Arc<AtomicBool>,
}

impl CollectStep {
    pub fn new(order: StepOrder) -> Self {
        Self {
            order,
            values: Arc::new(Mutex::new(Vec::new())),
            forward: None,
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn forwarding_to(mut self, target: StepId) -> Self {
        self.forward = Some(target);
        self
    }

    pub fn values(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.values)
    }

    pub fn finalized_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finalized)
    }
}

impl AnalyticalStep for CollectStep {
    fn order(&self) -> StepOrder {
        self.order
    }

    fn process(&mut self, input: Option<ChunkBox>) -> StepOutput {
        let Some(chunk) = input else { return Ok(Vec::new()) };
        let payload = chunk.downcast::<Payload>().expect("collect step expects Payload chunks");
        self.values.lock().push(payload.value);
        match self.forward {
            Some(target) => Ok(vec![RoutedChunk::new(target, payload)]),
            None => Ok(Vec::new()),
        }
    }

    fn finalize(&mut self) -> Result<(), StepError> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Tracks how many threads are inside instrumented sections at once.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Pass-through step that records its concurrency in a shared gauge and can
/// hold chunks for a fixed duration to widen race windows.
pub struct GaugedStep {
    order: StepOrder,
    io: bool,
    target: Option<StepId>,
    hold: Duration,
    gauge: Arc<ConcurrencyGauge>,
}

impl GaugedStep {
    pub fn new(order: StepOrder, gauge: Arc<ConcurrencyGauge>) -> Self {
        Self { order, io: false, target: None, hold: Duration::ZERO, gauge }
    }

    pub fn with_io(mut self) -> Self {
        self.io = true;
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_target(mut self, target: StepId) -> Self {
        self.target = Some(target);
        self
    }
}

impl AnalyticalStep for GaugedStep {
    fn order(&self) -> StepOrder {
        self.order
    }

    fn file_io(&self) -> bool {
        self.io
    }

    fn process(&mut self, input: Option<ChunkBox>) -> StepOutput {
        let Some(chunk) = input else { return Ok(Vec::new()) };
        self.gauge.enter();
        if !self.hold.is_zero() {
            thread::sleep(self.hold);
        }
        self.gauge.exit();
        match self.target {
            Some(target) => Ok(vec![RoutedChunk::new(target, chunk)]),
            None => Ok(Vec::new()),
        }
    }
}
