//! Run lifecycle: finalize ordering and the run summary.

use std::sync::Arc;

use chunkflow::{AnalyticalStep, ChunkBox, Scheduler, StepId, StepOrder, StepOutput};
use parking_lot::Mutex;

use crate::helpers::{CollectStep, NumberSource};

/// Records the order in which `finalize` reaches it.
struct FinalizeProbe {
    id: StepId,
    log: Arc<Mutex<Vec<StepId>>>,
}

impl AnalyticalStep for FinalizeProbe {
    fn order(&self) -> StepOrder {
        StepOrder::Unordered
    }

    fn process(&mut self, _input: Option<ChunkBox>) -> StepOutput {
        Ok(Vec::new())
    }

    fn finalize(&mut self) -> Result<(), chunkflow::StepError> {
        self.log.lock().push(self.id);
        Ok(())
    }
}

#[test]
fn test_finalize_runs_in_ascending_id_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::new();
    // Register out of order, with sparse ids.
    scheduler.add_step(9, FinalizeProbe { id: 9, log: Arc::clone(&log) }).unwrap();
    scheduler.add_step(0, NumberSource::new(0, 2)).unwrap();
    scheduler.add_step(5, FinalizeProbe { id: 5, log: Arc::clone(&log) }).unwrap();
    scheduler.add_step(2, FinalizeProbe { id: 2, log: Arc::clone(&log) }).unwrap();
    scheduler.run(2).unwrap();

    assert_eq!(log.lock().clone(), vec![2, 5, 9]);
}

#[test]
fn test_run_summary_counts_and_display() {
    let collect = CollectStep::new(StepOrder::Unordered);
    let mut scheduler = Scheduler::new().with_progress_interval(10);
    scheduler.add_step(0, NumberSource::new(50, 1)).unwrap();
    scheduler.add_step(1, collect).unwrap();
    let summary = scheduler.run(2).unwrap();

    assert_eq!(summary.chunks_emitted, 50);
    // 51 source calls (50 emissions + end-of-stream) and 50 collector calls.
    assert_eq!(summary.process_calls, 101);
    assert!(summary.to_string().contains("50 chunks"));
}
