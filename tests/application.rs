use rtbroker::application::RealTimeApplication;
use rtbroker::config::ObjectConfig;
use rtbroker::datasource::{DataSource, TimingDataSource};
use rtbroker::error::{ApplicationError, ConfigurationError, SchedulerError};
use rtbroker::object::{Object, Reference, ReferenceT};
use rtbroker::realtime::RealTimeState;
use rtbroker::registry::register_class;
use rtbroker::scheduler::{GamScheduler, MultiThreadScheduler};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn app() -> RealTimeApplication {
    RealTimeApplication::from_value(json!({
        "name": "Pipeline",
        "data_sources": [
            {"name": "DDB", "class": "MemoryDataSource",
             "signals": [{"name": "offset", "type": "uint32", "default": 5}]},
            {"name": "Timings", "class": "TimingDataSource"}
        ],
        "functions": [
            {"name": "Count", "class": "CounterGam",
             "output_signals": [{"name": "count", "data_source": "DDB", "type": "uint32"}]},
            {"name": "Scale", "class": "GainGam", "gain": 2.0,
             "input_signals": [{"name": "count", "data_source": "DDB", "type": "uint32"}],
             "output_signals": [{"name": "scaled", "data_source": "DDB", "type": "float64"}]},
            {"name": "Offset", "class": "CopyGam",
             "input_signals": [{"name": "offset", "data_source": "DDB", "type": "uint32"}],
             "output_signals": [{"name": "offset_copy", "data_source": "DDB", "type": "uint32"}]}
        ],
        "states": [
            {"name": "Idle", "threads": [{"name": "T1", "functions": ["Count"]}]},
            {"name": "Run", "threads": [
                {"name": "T1", "functions": ["Count", "Scale"]},
                {"name": "T2", "functions": ["Offset"]}
            ]}
        ],
        "scheduler": {"name": "Sched", "class": "MultiThreadScheduler",
                      "timing_data_source": "Timings", "stop_timeout_ms": 2000}
    }))
    .unwrap()
}

fn read(ds: &Arc<dyn DataSource>, name: &str, buffer: usize) -> [u8; 8] {
    let index = ds.signal_index(name).unwrap();
    let memory = ds.signal_memory(index, buffer).unwrap();
    let mut raw = [0u8; 8];
    memory.read_into(0, &mut raw[..memory.len()]).unwrap();
    raw
}

fn read_u32(ds: &Arc<dyn DataSource>, name: &str, buffer: usize) -> u32 {
    let raw = read(ds, name, buffer);
    u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn switching_states_applies_defaults_and_records_timing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut app = app();
    let ddb = app.data_source("DDB").unwrap();

    let scheduler = app
        .find("Scheduler.Sched")
        .and_then(|r| r.downcast::<MultiThreadScheduler>())
        .unwrap();

    app.prepare_next_state("Idle").unwrap();
    app.start_next_state_execution().unwrap();
    assert_eq!(app.current_state(), Some("Idle"));
    assert_eq!(scheduler.workers(), vec!["T1"]);
    assert_eq!(scheduler.spawned(), 1);
    assert_eq!(ddb.current_state_buffer(), app.index());
    wait_for("count", || read_u32(&ddb, "count", app.index()) > 0);
    assert_eq!(read_u32(&ddb, "offset_copy", app.index()), 0);

    let idle_buffer = app.index();
    app.prepare_next_state("Run").unwrap();
    assert_ne!(app.index(), idle_buffer);
    assert_eq!(ddb.current_state_buffer(), idle_buffer);
    app.start_next_state_execution().unwrap();
    assert_eq!(app.current_state(), Some("Run"));
    assert_eq!(app.scheduler().current_state().as_deref(), Some("Run"));
    assert_eq!(ddb.current_state_buffer(), app.index());
    // T1 carries over from Idle; only T2 is new.
    assert_eq!(scheduler.workers(), vec!["T1", "T2"]);
    assert_eq!(scheduler.spawned(), 2);

    let buffer = app.index();
    wait_for("offset copy", || read_u32(&ddb, "offset_copy", buffer) == 5);
    wait_for("scaled count", || f64::from_ne_bytes(read(&ddb, "scaled", buffer)) > 0.0);

    let timings = app
        .find("Data.Timings")
        .and_then(|r| r.downcast::<TimingDataSource>())
        .unwrap();
    assert!(timings.value("Count_ExecTime").is_some());
    assert!(timings.value("Run.T2_CycleTime").is_some());
    assert!(timings.value("Idle.T1_CycleTime").is_some());

    app.prepare_next_state("Idle").unwrap();
    app.start_next_state_execution().unwrap();
    assert_eq!(scheduler.workers(), vec!["T1"]);
    assert_eq!(scheduler.spawned(), 2);
    let idle_cycles = scheduler.thread("Idle", "T1").unwrap().cycles();
    wait_for("idle cycles", || scheduler.thread("Idle", "T1").unwrap().cycles() > idle_cycles);

    app.stop_current_state_execution().unwrap();
    assert_eq!(scheduler.spin_flag(), 0);
    assert!(scheduler.workers().is_empty());
    assert!(scheduler.thread("Run", "T2").unwrap().cycles() > 0);
    assert_eq!(scheduler.thread("Run", "T1").unwrap().failures(), 0);
}

struct RefusingScheduler;

impl GamScheduler for RefusingScheduler {
    fn name(&self) -> &str {
        "Refusing"
    }

    fn timing_data_source(&self) -> Option<&str> {
        None
    }

    fn configure(
        &self,
        _states: &[ReferenceT<RealTimeState>],
        _timing: Option<Arc<dyn DataSource>>,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    fn is_configured_for(&self, _state: &str) -> bool {
        true
    }

    fn prepare_next_state(&self, _state: &str, _next_buffer: usize) -> Result<(), SchedulerError> {
        Ok(())
    }

    fn start_execution(&self, _buffer: usize) -> Result<(), SchedulerError> {
        Err(SchedulerError::Spawn {
            thread: "T".into(),
            reason: "refused".into(),
        })
    }

    fn stop_execution(&self) -> Result<(), SchedulerError> {
        Err(SchedulerError::NotRunning)
    }

    fn is_running(&self) -> bool {
        false
    }

    fn current_state(&self) -> Option<String> {
        None
    }
}

impl Object for RefusingScheduler {
    fn name(&self) -> &str {
        "Refusing"
    }

    fn class_name(&self) -> &'static str {
        "RefusingScheduler"
    }

    fn into_scheduler(self: Arc<Self>) -> Option<Arc<dyn GamScheduler>> {
        Some(self)
    }
}

fn build_refusing_scheduler(_config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    Ok(Reference::new(RefusingScheduler))
}

#[test]
fn failed_start_restores_the_active_buffer() {
    register_class("RefusingScheduler", build_refusing_scheduler);
    let mut app = RealTimeApplication::from_value(json!({
        "name": "Refused",
        "data_sources": [{"name": "DDB", "class": "MemoryDataSource"}],
        "functions": [{"name": "Count", "class": "CounterGam",
                       "output_signals": [{"name": "n", "data_source": "DDB", "type": "uint32"}]}],
        "states": [{"name": "S", "threads": [{"name": "T", "functions": ["Count"]}]}],
        "scheduler": {"name": "Sched", "class": "RefusingScheduler"}
    }))
    .unwrap();
    let ddb = app.data_source("DDB").unwrap();

    app.prepare_next_state("S").unwrap();
    assert_eq!(app.index(), 1);
    assert!(matches!(
        app.start_next_state_execution(),
        Err(ApplicationError::Scheduler(SchedulerError::Spawn { .. }))
    ));
    assert_eq!(ddb.current_state_buffer(), 0);
    assert_eq!(app.current_state(), None);
    assert_eq!(app.pending_state(), Some("S"));
}

#[test]
fn start_without_prepare_is_rejected() {
    let mut app = app();
    assert!(matches!(
        app.start_next_state_execution(),
        Err(ApplicationError::InvalidTransition(_))
    ));
    assert!(matches!(
        app.stop_current_state_execution(),
        Err(ApplicationError::Scheduler(_))
    ));
}

#[test]
fn unknown_data_source_fails_configuration() {
    let err = RealTimeApplication::from_value(json!({
        "states": [{"name": "S", "threads": [{"name": "T", "functions": ["G"]}]}],
        "functions": [{"name": "G", "class": "CounterGam",
                       "output_signals": [{"name": "n", "data_source": "Nowhere", "type": "uint32"}]}],
        "scheduler": {"name": "Sched", "class": "MultiThreadScheduler"}
    }))
    .unwrap_err();
    assert!(err.to_string().contains("Nowhere"));
}
