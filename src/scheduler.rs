//! GAM schedulers.
//!
//! `MultiThreadScheduler` keeps one OS thread per `RealTimeThread` name.
//! A worker reads the published buffer index at the top of every cycle and
//! runs the thread list that the state prepared on that index gives it, or
//! idles when that state has no thread of its name. Switching states only
//! spawns the threads the new state adds and retires the ones it drops.
//! Workers report through `RtEvent` queues only; the controlling thread
//! drains and logs them.

use crate::config::{ObjectConfig, SchedulerParams};
use crate::datasource::{DataSource, STATE_BUFFERS};
use crate::error::{BrokerError, ConfigurationError, SchedulerError, StepError};
use crate::executable::{cycle_time_signal_name, execute_single_cycle, stages_for, Executable, TimingSlot};
use crate::invariant_rt::{
    drain_events, event_name, new_event_queue, signal_event, RtEvent, EV_COPY_FAILED,
    EV_EXECUTABLE_FAILED, EV_FIRST_CYCLE, EV_NOT_FINALISED, EV_OUTPUT_OVERRUN, EV_SYNC_TIMEOUT, EV_THREAD_EXIT,
    EV_THREAD_STARTED,
};
use crate::object::{Object, Reference, ReferenceT};
use crate::realtime::RealTimeState;
use crate::sync::elapsed_micros;
use parking_lot::{Mutex, RwLock};
use rtrb::{Consumer, Producer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Dispatches the GAMs of a state onto threads.
pub trait GamScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the data source receiving timing values, if any.
    fn timing_data_source(&self) -> Option<&str>;

    /// Build the execution lists of every state. Called once.
    fn configure(
        &self,
        states: &[ReferenceT<RealTimeState>],
        timing: Option<Arc<dyn DataSource>>,
    ) -> Result<(), SchedulerError>;

    /// Whether `configure` built an execution list for every thread of
    /// `state`.
    fn is_configured_for(&self, state: &str) -> bool;

    /// Bind `state` to `next_buffer` for the next `start_execution`.
    fn prepare_next_state(&self, state: &str, next_buffer: usize) -> Result<(), SchedulerError>;

    /// Run the state prepared on `buffer`. While another state runs this
    /// is a switch: the running threads move over to `buffer`.
    fn start_execution(&self, buffer: usize) -> Result<(), SchedulerError>;

    /// Stop every worker and wait for it to exit.
    fn stop_execution(&self) -> Result<(), SchedulerError>;

    fn is_running(&self) -> bool;

    /// State currently executing.
    fn current_state(&self) -> Option<String>;
}

/// Execution list of one thread in one state.
pub struct ScheduledThread {
    name: String,
    cpus: u64,
    stack_size: usize,
    executables: Vec<Box<dyn Executable>>,
    cycle_time: TimingSlot,
    cycles: AtomicU64,
    failures: AtomicU64,
}

impl ScheduledThread {
    pub fn new(
        name: &str,
        cpus: u64,
        stack_size: usize,
        executables: Vec<Box<dyn Executable>>,
        cycle_time: TimingSlot,
    ) -> Self {
        Self {
            name: name.to_string(),
            cpus,
            stack_size,
            executables,
            cycle_time,
            cycles: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executables(&self) -> &[Box<dyn Executable>] {
        &self.executables
    }

    pub fn cycle_time(&self) -> &TimingSlot {
        &self.cycle_time
    }

    /// Cycles completed, failed ones included.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

fn event_for(cause: StepError) -> u8 {
    match cause {
        StepError::Broker(BrokerError::SyncTimeout) => EV_SYNC_TIMEOUT,
        StepError::Broker(BrokerError::NotFinalised) => EV_NOT_FINALISED,
        StepError::Broker(BrokerError::Copy(_)) | StepError::Broker(BrokerError::BufferIndex(_)) => {
            EV_COPY_FAILED
        }
        StepError::Broker(BrokerError::Overrun) | StepError::Broker(BrokerError::Busy) => EV_OUTPUT_OVERRUN,
        StepError::Logic => EV_EXECUTABLE_FAILED,
    }
}

/// What a worker does in its next iteration.
pub enum Next<'a> {
    /// One cycle of the thread on the buffer index.
    Run(&'a ScheduledThread, usize),
    /// Nothing to run in the current state.
    Idle,
    Exit,
}

const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Worker loop: ask `next` what to do until it answers `Exit`.
///
/// A failed cycle is reported as an event and the loop moves on to the
/// next cycle. Idle iterations park the thread briefly.
pub fn cycle_loop<'a>(mut next: impl FnMut() -> Next<'a>, events: &mut Producer<RtEvent>, thread_id: u16) {
    signal_event(events, RtEvent::new(EV_THREAD_STARTED, thread_id, 0));
    let mut first = true;
    loop {
        let (thread, buffer) = match next() {
            Next::Run(thread, buffer) => (thread, buffer),
            Next::Idle => {
                thread::park_timeout(IDLE_WAIT);
                continue;
            }
            Next::Exit => break,
        };
        let start = Instant::now();
        match execute_single_cycle(&thread.executables, buffer, start) {
            Ok(()) => {
                if first {
                    signal_event(events, RtEvent::new(EV_FIRST_CYCLE, thread_id, 0));
                    first = false;
                }
            }
            Err(e) => {
                thread.failures.fetch_add(1, Ordering::Relaxed);
                let slot = u16::try_from(e.slot).unwrap_or(u16::MAX);
                signal_event(events, RtEvent::new(event_for(e.cause), thread_id, slot));
            }
        }
        thread.cycle_time.record(elapsed_micros(start));
        thread.cycles.fetch_add(1, Ordering::Relaxed);
    }
    signal_event(events, RtEvent::new(EV_THREAD_EXIT, thread_id, 0));
}

/// Cycle `thread` on a fixed `buffer` until `spin` is nonzero.
pub fn run_until_stopped(
    thread: &ScheduledThread,
    buffer: usize,
    spin: &AtomicU32,
    events: &mut Producer<RtEvent>,
    thread_id: u16,
) {
    let next = move || {
        if spin.load(Ordering::Acquire) == 0 {
            Next::Run(thread, buffer)
        } else {
            Next::Exit
        }
    };
    cycle_loop(next, events, thread_id);
}

const NO_STATE: usize = usize::MAX;

/// State index bound to each buffer index, and the index workers run on.
struct StateSwitch {
    active: AtomicUsize,
    states: [AtomicUsize; STATE_BUFFERS],
}

impl StateSwitch {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            states: std::array::from_fn(|_| AtomicUsize::new(NO_STATE)),
        }
    }

    fn state_on(&self, buffer: usize) -> usize {
        self.states
            .get(buffer)
            .map_or(NO_STATE, |s| s.load(Ordering::Acquire))
    }
}

struct ScheduledState {
    name: String,
    threads: Vec<Arc<ScheduledThread>>,
}

/// Every state's list for one thread name. `threads[s]` is `None` when
/// state `s` has no thread of that name.
struct WorkerPlan {
    name: String,
    id: u16,
    threads: Vec<Option<Arc<ScheduledThread>>>,
}

impl WorkerPlan {
    fn runs_in(&self, state: usize) -> bool {
        matches!(self.threads.get(state), Some(Some(_)))
    }
}

fn plans_for(states: &[ScheduledState]) -> Vec<Arc<WorkerPlan>> {
    let mut plans: Vec<WorkerPlan> = Vec::new();
    for (index, state) in states.iter().enumerate() {
        for thread in &state.threads {
            let position = match plans.iter().position(|p| p.name == thread.name) {
                Some(position) => position,
                None => {
                    plans.push(WorkerPlan {
                        name: thread.name.clone(),
                        id: u16::try_from(plans.len()).unwrap_or(u16::MAX),
                        threads: vec![None; states.len()],
                    });
                    plans.len() - 1
                }
            };
            plans[position].threads[index] = Some(Arc::clone(thread));
        }
    }
    plans.into_iter().map(Arc::new).collect()
}

struct Worker {
    plan: Arc<WorkerPlan>,
    retire: Arc<AtomicBool>,
    /// Buffer index read at the top of the latest iteration.
    seen: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
    events: Consumer<RtEvent>,
}

struct Running {
    buffer: usize,
    workers: Vec<Worker>,
}

pub struct MultiThreadScheduler {
    name: String,
    params: SchedulerParams,
    states: RwLock<Vec<ScheduledState>>,
    plans: RwLock<Vec<Arc<WorkerPlan>>>,
    switch: Arc<StateSwitch>,
    running: Mutex<Option<Running>>,
    spin: Arc<AtomicU32>,
    spawned: AtomicU64,
}

impl MultiThreadScheduler {
    pub fn new(name: &str, params: SchedulerParams) -> Self {
        Self {
            name: name.to_string(),
            params,
            states: RwLock::new(Vec::new()),
            plans: RwLock::new(Vec::new()),
            switch: Arc::new(StateSwitch::new()),
            running: Mutex::new(None),
            spin: Arc::new(AtomicU32::new(0)),
            spawned: AtomicU64::new(0),
        }
    }

    /// Shared stop token. Zero while workers may run.
    pub fn spin_flag(&self) -> u32 {
        self.spin.load(Ordering::Acquire)
    }

    /// Thread of a configured state.
    pub fn thread(&self, state: &str, thread: &str) -> Option<Arc<ScheduledThread>> {
        let states = self.states.read();
        let s = states.iter().find(|s| s.name == state)?;
        s.threads.iter().find(|t| t.name == thread).cloned()
    }

    /// Names of the live worker threads.
    pub fn workers(&self) -> Vec<String> {
        let running = self.running.lock();
        running
            .as_ref()
            .map(|r| r.workers.iter().map(|w| w.plan.name.clone()).collect())
            .unwrap_or_default()
    }

    /// OS threads spawned since construction.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Latest value of any timing slot, by timing signal name.
    pub fn timing(&self, name: &str) -> Option<u32> {
        let states = self.states.read();
        states.iter().flat_map(|s| &s.threads).find_map(|t| {
            if t.cycle_time.name() == name {
                return Some(t.cycle_time.get());
            }
            t.executables
                .iter()
                .find(|e| e.timing().name() == name)
                .map(|e| e.timing().get())
        })
    }

    /// Collect pending worker events and log them.
    pub fn drain_events(&self) -> Vec<RtEvent> {
        let mut running = self.running.lock();
        let Some(run) = running.as_mut() else {
            return Vec::new();
        };
        let mut all = Vec::new();
        for worker in &mut run.workers {
            let events = drain_events(&mut worker.events);
            self.log_events(&worker.plan.name, &events);
            all.extend(events);
        }
        all
    }

    fn state_name(&self, index: usize) -> String {
        self.states
            .read()
            .get(index)
            .map_or_else(String::new, |s| s.name.clone())
    }

    fn log_events(&self, worker: &str, events: &[RtEvent]) {
        let mut counts: HashMap<(u8, u16), usize> = HashMap::new();
        for e in events {
            *counts.entry((e.id, e.slot)).or_default() += 1;
        }
        for ((id, slot), n) in counts {
            match id {
                EV_THREAD_STARTED | EV_FIRST_CYCLE | EV_THREAD_EXIT => {
                    log::debug!("{}: thread `{}`: {}", self.name, worker, event_name(id))
                }
                _ => log::warn!(
                    "{}: thread `{}` slot {}: {} x{}",
                    self.name,
                    worker,
                    slot,
                    event_name(id),
                    n
                ),
            }
        }
    }

    /// Spawn the worker for `plan`, sized after its thread in `state`.
    fn spawn_worker(&self, plan: &Arc<WorkerPlan>, state: usize) -> Result<Worker, SchedulerError> {
        let template = plan.threads.get(state).and_then(Option::as_ref).ok_or_else(|| {
            SchedulerError::NotConfigured(state)
        })?;
        let (mut tx, rx) = new_event_queue();
        let retire = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicUsize::new(NO_STATE));
        let worker_plan = Arc::clone(plan);
        let worker_retire = Arc::clone(&retire);
        let worker_seen = Arc::clone(&seen);
        let switch = Arc::clone(&self.switch);
        let spin = Arc::clone(&self.spin);
        if template.cpus != 0 {
            log::debug!("{}: affinity mask {:#x} recorded, not applied", plan.name, template.cpus);
        }
        let spawned = thread::Builder::new()
            .name(plan.name.clone())
            .stack_size(template.stack_size)
            .spawn(move || {
                let plan: &WorkerPlan = &worker_plan;
                let next = move || {
                    if spin.load(Ordering::Acquire) != 0 || worker_retire.load(Ordering::Acquire) {
                        return Next::Exit;
                    }
                    let buffer = switch.active.load(Ordering::Acquire);
                    worker_seen.store(buffer, Ordering::Release);
                    match plan.threads.get(switch.state_on(buffer)) {
                        Some(Some(thread)) => Next::Run(&**thread, buffer),
                        _ => Next::Idle,
                    }
                };
                cycle_loop(next, &mut tx, plan.id);
            })
            .map_err(|e| SchedulerError::Spawn {
                thread: plan.name.clone(),
                reason: e.to_string(),
            })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(Worker {
            plan: Arc::clone(plan),
            retire,
            seen,
            handle: spawned,
            events: rx,
        })
    }

    fn deadline(&self) -> Option<Instant> {
        self.params
            .stop_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms))
    }

    /// Wait until every worker has read `buffer` as the active index.
    fn wait_for_handover(&self, workers: &[Worker], buffer: usize) {
        let deadline = self.deadline();
        while !workers.iter().all(|w| w.seen.load(Ordering::Acquire) == buffer) {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                log::warn!("{}: handover to buffer {} still pending", self.name, buffer);
                return;
            }
            for w in workers {
                w.handle.thread().unpark();
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    /// Stop and join workers that have no thread in the running state.
    /// Returns the label of the first one that panicked.
    fn retire(&self, workers: Vec<Worker>) -> Option<String> {
        for w in &workers {
            w.retire.store(true, Ordering::Release);
            w.handle.thread().unpark();
        }
        let deadline = self.deadline();
        let mut panicked = None;
        for mut w in workers {
            while !w.handle.is_finished() && deadline.map_or(true, |d| Instant::now() < d) {
                thread::sleep(Duration::from_millis(1));
            }
            let events = drain_events(&mut w.events);
            self.log_events(&w.plan.name, &events);
            if !w.handle.is_finished() {
                log::error!("{}: thread `{}` detached while still running", self.name, w.plan.name);
                continue;
            }
            if w.handle.join().is_err() {
                log::error!("{}: worker `{}` panicked", self.name, w.plan.name);
                panicked.get_or_insert_with(|| w.plan.name.clone());
            } else {
                log::debug!("{}: thread `{}` retired", self.name, w.plan.name);
            }
        }
        panicked
    }

    fn switch_to(&self, run: &mut Running, buffer: usize, state: usize) -> Result<(), SchedulerError> {
        let plans = self.plans.read();
        let mut fresh = Vec::new();
        for plan in plans.iter() {
            if plan.runs_in(state) && !run.workers.iter().any(|w| w.plan.id == plan.id) {
                match self.spawn_worker(plan, state) {
                    Ok(worker) => fresh.push(worker),
                    Err(e) => {
                        self.retire(fresh);
                        return Err(e);
                    }
                }
            }
        }
        self.switch.active.store(buffer, Ordering::SeqCst);
        run.buffer = buffer;
        run.workers.extend(fresh);
        self.wait_for_handover(&run.workers, buffer);

        let (keep, gone): (Vec<Worker>, Vec<Worker>) =
            run.workers.drain(..).partition(|w| w.plan.runs_in(state));
        run.workers = keep;
        match self.retire(gone) {
            Some(label) => Err(SchedulerError::ThreadPanicked(label)),
            None => Ok(()),
        }
    }
}

impl GamScheduler for MultiThreadScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn timing_data_source(&self) -> Option<&str> {
        self.params.timing_data_source.as_deref()
    }

    fn configure(
        &self,
        states: &[ReferenceT<RealTimeState>],
        timing: Option<Arc<dyn DataSource>>,
    ) -> Result<(), SchedulerError> {
        let mut scheduled = Vec::with_capacity(states.len());
        for state in states {
            let state_name = Object::name(&**state).to_string();
            let threads = state
                .threads()
                .iter()
                .map(|t| {
                    let thread_name = Object::name(&**t);
                    let cycle_time = TimingSlot::new(
                        cycle_time_signal_name(&state_name, thread_name),
                        timing.as_ref(),
                    );
                    Arc::new(ScheduledThread::new(
                        thread_name,
                        t.cpus(),
                        t.stack_size(),
                        stages_for(t.gams(), timing.as_ref()),
                        cycle_time,
                    ))
                })
                .collect();
            scheduled.push(ScheduledState {
                name: state_name,
                threads,
            });
        }
        let plans = plans_for(&scheduled);
        log::info!(
            "{}: configured {} states over {} worker threads",
            self.name,
            scheduled.len(),
            plans.len()
        );
        *self.states.write() = scheduled;
        *self.plans.write() = plans;
        Ok(())
    }

    fn is_configured_for(&self, state: &str) -> bool {
        let states = self.states.read();
        let plans = self.plans.read();
        states.iter().enumerate().any(|(i, s)| {
            s.name == state && plans.iter().filter(|p| p.runs_in(i)).count() == s.threads.len()
        })
    }

    fn prepare_next_state(&self, state: &str, next_buffer: usize) -> Result<(), SchedulerError> {
        let index = self
            .states
            .read()
            .iter()
            .position(|s| s.name == state)
            .ok_or_else(|| SchedulerError::UnknownState(state.to_string()))?;
        let slot = self
            .switch
            .states
            .get(next_buffer)
            .ok_or(SchedulerError::InvalidBuffer(next_buffer))?;
        let running = self.running.lock();
        if running.as_ref().map_or(false, |r| r.buffer == next_buffer) {
            return Err(SchedulerError::BufferInUse(next_buffer));
        }
        slot.store(index, Ordering::Release);
        log::debug!("{}: state `{}` prepared on buffer {}", self.name, state, next_buffer);
        Ok(())
    }

    fn start_execution(&self, buffer: usize) -> Result<(), SchedulerError> {
        let mut running = self.running.lock();
        let index = self.switch.state_on(buffer);
        let state_name = {
            let states = self.states.read();
            states
                .get(index)
                .map(|s| s.name.clone())
                .ok_or(SchedulerError::NotConfigured(buffer))?
        };

        if let Some(run) = running.as_mut() {
            if run.buffer == buffer {
                return Err(SchedulerError::AlreadyRunning);
            }
            self.switch_to(run, buffer, index)?;
            log::info!(
                "{}: switched to state `{}` on buffer {} with {} threads",
                self.name,
                state_name,
                buffer,
                run.workers.len()
            );
            return Ok(());
        }

        self.spin.store(0, Ordering::Release);
        self.switch.active.store(buffer, Ordering::SeqCst);
        let plans = self.plans.read();
        let mut workers = Vec::new();
        for plan in plans.iter().filter(|p| p.runs_in(index)) {
            match self.spawn_worker(plan, index) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    self.retire(workers);
                    return Err(e);
                }
            }
        }
        log::info!(
            "{}: state `{}` started on buffer {} with {} threads",
            self.name,
            state_name,
            buffer,
            workers.len()
        );
        *running = Some(Running { buffer, workers });
        Ok(())
    }

    fn stop_execution(&self) -> Result<(), SchedulerError> {
        let mut guard = self.running.lock();
        let mut run = guard.take().ok_or(SchedulerError::NotRunning)?;
        self.spin.fetch_add(1, Ordering::AcqRel);
        for w in &run.workers {
            w.handle.thread().unpark();
        }

        let deadline = self.deadline();
        while !run.workers.iter().all(|w| w.handle.is_finished()) {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                let ms = self.params.stop_timeout_ms.unwrap_or(0);
                log::error!("{}: workers still running after {} ms", self.name, ms);
                *guard = Some(run);
                return Err(SchedulerError::StopTimeout(ms));
            }
            thread::sleep(Duration::from_millis(1));
        }

        let state = self.state_name(self.switch.state_on(run.buffer));
        let mut panicked = None;
        for mut w in run.workers.drain(..) {
            let events = drain_events(&mut w.events);
            self.log_events(&w.plan.name, &events);
            if w.handle.join().is_err() {
                log::error!("{}: worker `{}` panicked", self.name, w.plan.name);
                panicked.get_or_insert(w.plan.name.clone());
            }
        }
        self.spin.store(0, Ordering::Release);
        log::info!("{}: state `{}` stopped (buffer {})", self.name, state, run.buffer);

        match panicked {
            Some(label) => Err(SchedulerError::ThreadPanicked(label)),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn current_state(&self) -> Option<String> {
        let running = self.running.lock();
        running
            .as_ref()
            .map(|r| self.state_name(self.switch.state_on(r.buffer)))
    }
}

impl Object for MultiThreadScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "MultiThreadScheduler"
    }

    fn into_scheduler(self: Arc<Self>) -> Option<Arc<dyn GamScheduler>> {
        Some(self)
    }
}

impl Drop for MultiThreadScheduler {
    fn drop(&mut self) {
        if self.running.get_mut().is_some() {
            if let Err(e) = GamScheduler::stop_execution(self) {
                log::error!("{}: stop on drop failed: {}", self.name, e);
            }
        }
    }
}

pub(crate) fn build_multi_thread_scheduler(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: SchedulerParams = config.parse()?;
    Ok(Reference::new(MultiThreadScheduler::new(&config.name, params)))
}
