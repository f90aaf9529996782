//! Cycle harness: runs a thread's executables on the calling thread.
//!
//! Used by tests and benches to drive cycles deterministically, without
//! spawning workers.

use crate::application::RealTimeApplication;
use crate::error::ExecutionError;
use crate::executable::{execute_single_cycle, stages_for, Executable};
use crate::gam::Gam;
use crate::object::ReferenceT;
use std::time::Instant;

pub struct CycleHarness {
    executables: Vec<Box<dyn Executable>>,
    cycles: u64,
    failures: u64,
}

impl CycleHarness {
    /// Read, execute and write stages for `gams`, in order.
    pub fn from_gams(gams: &[ReferenceT<Gam>]) -> Self {
        Self::from_executables(stages_for(gams, None))
    }

    pub fn from_executables(executables: Vec<Box<dyn Executable>>) -> Self {
        Self {
            executables,
            cycles: 0,
            failures: 0,
        }
    }

    /// Harness for `thread` of `state` in a configured application.
    pub fn for_thread(app: &RealTimeApplication, state: &str, thread: &str) -> Option<Self> {
        let thread = app.state(state)?.thread(thread)?;
        Some(Self::from_gams(thread.gams()))
    }

    pub fn executables(&self) -> &[Box<dyn Executable>] {
        &self.executables
    }

    /// One cycle on `buffer`.
    pub fn run_cycle(&mut self, buffer: usize) -> Result<(), ExecutionError> {
        self.cycles += 1;
        let result = execute_single_cycle(&self.executables, buffer, Instant::now());
        if result.is_err() {
            self.failures += 1;
        }
        result
    }

    /// `n` cycles; failures do not stop the run. Returns the first failure.
    pub fn run_cycles(&mut self, n: usize, buffer: usize) -> Option<ExecutionError> {
        let mut first = None;
        for _ in 0..n {
            if let Err(e) = self.run_cycle(buffer) {
                first.get_or_insert(e);
            }
        }
        first
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GamParams, SignalConfig};
    use crate::gam::CounterGam;

    #[test]
    fn harness_basic() {
        let params = GamParams {
            input_signals: vec![],
            output_signals: vec![SignalConfig::new("n", "DDB", "uint32")],
            timeout_ms: None,
        };
        let gam = ReferenceT::new(Gam::new("C", "CounterGam", &params, Box::new(CounterGam::new(1))).unwrap());
        let mut harness = CycleHarness::from_gams(&[gam]);
        assert_eq!(harness.executables().len(), 3);
        // Unconnected brokers fail in the read stage.
        let err = harness.run_cycles(4, 0).unwrap();
        assert_eq!(err.slot, 0);
        assert_eq!((harness.cycles(), harness.failures()), (4, 4));
    }
}
