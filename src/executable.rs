//! Flattened per-thread execution list.
//!
//! Each GAM contributes three executables: its input brokers, its logic and
//! its output brokers. A cycle runs them in order and records, for each,
//! the microseconds elapsed since the cycle began.

use crate::datasource::DataSource;
use crate::error::{ExecutionError, StepError};
use crate::gam::Gam;
use crate::object::ReferenceT;
use crate::sync::elapsed_micros;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One `uint32` timing value, optionally mirrored into a data source.
pub struct TimingSlot {
    name: String,
    value: AtomicU32,
    sink: Option<(Arc<dyn DataSource>, usize)>,
}

impl TimingSlot {
    /// Mirrors into `sink` when it declares a signal named `name`.
    pub fn new(name: String, sink: Option<&Arc<dyn DataSource>>) -> Self {
        let sink = sink.and_then(|ds| match ds.signal_index(&name) {
            Some(index) => Some((Arc::clone(ds), index)),
            None => {
                log::warn!("timing signal `{}` not declared in `{}`", name, ds.name());
                None
            }
        });
        Self {
            name,
            value: AtomicU32::new(0),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    #[inline]
    pub fn record(&self, micros: u32) {
        self.value.store(micros, Ordering::Relaxed);
        if let Some((ds, index)) = &self.sink {
            if let Some(memory) = ds.signal_memory(*index, 0) {
                let _ = memory.write_from(0, &micros.to_ne_bytes());
            }
        }
    }

    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TimingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingSlot")
            .field("name", &self.name)
            .field("value", &self.get())
            .field("sink", &self.sink.as_ref().map(|(ds, _)| ds.name().to_string()))
            .finish()
    }
}

pub trait Executable: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, buffer: usize) -> Result<(), StepError>;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    fn timing(&self) -> &TimingSlot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Execute,
    Write,
}

impl Stage {
    pub const fn suffix(self) -> &'static str {
        match self {
            Stage::Read => "ReadTime",
            Stage::Execute => "ExecTime",
            Stage::Write => "WriteTime",
        }
    }
}

/// Timing signal name of a GAM stage.
pub fn timing_signal_name(gam: &str, stage: Stage) -> String {
    format!("{}_{}", gam, stage.suffix())
}

/// Timing signal name of a thread's whole cycle.
pub fn cycle_time_signal_name(state: &str, thread: &str) -> String {
    format!("{}.{}_CycleTime", state, thread)
}

#[derive(Debug)]
pub struct GamStage {
    gam: ReferenceT<Gam>,
    stage: Stage,
    name: String,
    enabled: AtomicBool,
    timing: TimingSlot,
}

impl GamStage {
    pub fn new(gam: ReferenceT<Gam>, stage: Stage, sink: Option<&Arc<dyn DataSource>>) -> Self {
        let gam_name = crate::object::Object::name(&*gam).to_string();
        let name = timing_signal_name(&gam_name, stage);
        Self {
            timing: TimingSlot::new(name.clone(), sink),
            gam,
            stage,
            name,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn gam(&self) -> &ReferenceT<Gam> {
        &self.gam
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

impl Executable for GamStage {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn execute(&self, buffer: usize) -> Result<(), StepError> {
        match self.stage {
            Stage::Read => Ok(self.gam.read_inputs(buffer)?),
            Stage::Execute => {
                if self.gam.execute_logic() {
                    Ok(())
                } else {
                    Err(StepError::Logic)
                }
            }
            Stage::Write => Ok(self.gam.write_outputs(buffer)?),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn timing(&self) -> &TimingSlot {
        &self.timing
    }
}

/// Read, execute and write stages for each GAM, in order.
pub fn stages_for(gams: &[ReferenceT<Gam>], sink: Option<&Arc<dyn DataSource>>) -> Vec<Box<dyn Executable>> {
    let mut out: Vec<Box<dyn Executable>> = Vec::with_capacity(gams.len() * 3);
    for gam in gams {
        for stage in [Stage::Read, Stage::Execute, Stage::Write] {
            out.push(Box::new(GamStage::new(gam.clone(), stage, sink)));
        }
    }
    out
}

/// Run `executables` once, in order, on `buffer`.
///
/// Disabled executables are skipped. Each executed one records the
/// microseconds since `cycle_start`. The first failure ends the cycle and
/// is returned with its slot; it is not recorded.
#[inline]
pub fn execute_single_cycle(
    executables: &[Box<dyn Executable>],
    buffer: usize,
    cycle_start: Instant,
) -> Result<(), ExecutionError> {
    for (slot, executable) in executables.iter().enumerate() {
        if !executable.is_enabled() {
            continue;
        }
        executable
            .execute(buffer)
            .map_err(|cause| ExecutionError { slot, cause })?;
        executable.timing().record(elapsed_micros(cycle_start));
    }
    Ok(())
}
