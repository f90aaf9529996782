use parking_lot::Mutex;
use rtbroker::config::{GamParams, SchedulerParams, StateConfig, ThreadConfig};
use rtbroker::container::ReferenceContainer;
use rtbroker::error::SchedulerError;
use rtbroker::gam::{Gam, GamIo, GamLogic};
use rtbroker::harness::CycleHarness;
use rtbroker::object::ReferenceT;
use rtbroker::realtime::RealTimeState;
use rtbroker::scheduler::{GamScheduler, MultiThreadScheduler};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Recorder {
    id: u8,
    log: Arc<Mutex<Vec<u8>>>,
}

impl GamLogic for Recorder {
    fn execute(&mut self, _io: &GamIo<'_>) -> bool {
        self.log.lock().push(self.id);
        true
    }
}

fn recorders(log: &Arc<Mutex<Vec<u8>>>) -> Vec<ReferenceT<Gam>> {
    let params = GamParams {
        input_signals: vec![],
        output_signals: vec![],
        timeout_ms: None,
    };
    (1..=3u8)
        .map(|id| {
            let logic = Recorder {
                id,
                log: Arc::clone(log),
            };
            let gam = Gam::new(&format!("G{}", id), "Recorder", &params, Box::new(logic)).unwrap();
            gam.connect(|_| None).unwrap();
            ReferenceT::new(gam)
        })
        .collect()
}

fn assert_passes_in_order(log: &[u8]) {
    assert_eq!(log.len() % 3, 0, "partial pass in {:?}", log);
    for pass in log.chunks(3) {
        assert_eq!(pass, [1u8, 2, 3]);
    }
}

#[test]
fn harness_runs_gams_in_declared_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut harness = CycleHarness::from_gams(&recorders(&log));
    assert!(harness.run_cycles(5, 0).is_none());
    assert_eq!(harness.failures(), 0);
    assert_eq!(log.lock().len(), 15);
    assert_passes_in_order(&log.lock());
}

#[test]
fn worker_thread_completes_passes_and_stops() {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = Arc::new(Mutex::new(Vec::new()));
    let functions = ReferenceContainer::new("Functions");
    for gam in recorders(&log) {
        functions.insert(gam.to_reference()).unwrap();
    }
    let config = StateConfig {
        name: "Run".to_string(),
        threads: vec![ThreadConfig {
            name: "T".to_string(),
            functions: vec!["G1".into(), "G2".into(), "G3".into()],
            cpus: 0,
            stack_size: 256 * 1024,
        }],
    };
    let state = ReferenceT::new(RealTimeState::new(&config, &functions).unwrap());

    let scheduler = MultiThreadScheduler::new("Scheduler", SchedulerParams::default());
    scheduler.configure(&[state], None).unwrap();
    scheduler.prepare_next_state("Run", 0).unwrap();
    scheduler.start_execution(0).unwrap();
    assert!(scheduler.is_running());
    assert_eq!(scheduler.current_state().as_deref(), Some("Run"));

    let deadline = Instant::now() + Duration::from_secs(1);
    while log.lock().len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(log.lock().len() >= 3, "no full pass within one second");

    scheduler.stop_execution().unwrap();
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.spin_flag(), 0);

    let after_stop = log.lock().clone();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(*log.lock(), after_stop, "worker ran after stop");
    assert_passes_in_order(&after_stop);

    let worker = scheduler.thread("Run", "T").unwrap();
    assert_eq!(worker.failures(), 0);
    assert_eq!(worker.cycles() as usize, after_stop.len() / 3);
}

fn thread_config(name: &str, functions: &[&str]) -> ThreadConfig {
    ThreadConfig {
        name: name.to_string(),
        functions: functions.iter().map(|f| f.to_string()).collect(),
        cpus: 0,
        stack_size: 256 * 1024,
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn switching_states_keeps_shared_threads_alive() {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = Arc::new(Mutex::new(Vec::new()));
    let functions = ReferenceContainer::new("Functions");
    for gam in recorders(&log) {
        functions.insert(gam.to_reference()).unwrap();
    }
    let a = StateConfig {
        name: "A".to_string(),
        threads: vec![thread_config("T", &["G1"])],
    };
    let b = StateConfig {
        name: "B".to_string(),
        threads: vec![thread_config("T", &["G1", "G2"]), thread_config("U", &["G3"])],
    };
    let states = [
        ReferenceT::new(RealTimeState::new(&a, &functions).unwrap()),
        ReferenceT::new(RealTimeState::new(&b, &functions).unwrap()),
    ];

    let scheduler = MultiThreadScheduler::new("Scheduler", SchedulerParams::default());
    scheduler.configure(&states, None).unwrap();
    assert!(scheduler.is_configured_for("B"));
    scheduler.prepare_next_state("A", 0).unwrap();
    scheduler.start_execution(0).unwrap();
    assert_eq!(scheduler.workers(), vec!["T"]);
    wait_until("A.T cycles", || scheduler.thread("A", "T").unwrap().cycles() > 0);

    assert_eq!(scheduler.prepare_next_state("B", 0), Err(SchedulerError::BufferInUse(0)));
    scheduler.prepare_next_state("B", 1).unwrap();
    scheduler.start_execution(1).unwrap();
    assert_eq!(scheduler.current_state().as_deref(), Some("B"));
    assert_eq!(scheduler.workers(), vec!["T", "U"]);
    assert_eq!(scheduler.spawned(), 2);
    assert_eq!(scheduler.start_execution(1), Err(SchedulerError::AlreadyRunning));

    // Every worker has moved to buffer 1, so A's list no longer runs.
    let a_cycles = scheduler.thread("A", "T").unwrap().cycles();
    wait_until("B.U cycles", || scheduler.thread("B", "U").unwrap().cycles() > 2);
    wait_until("B.T cycles", || scheduler.thread("B", "T").unwrap().cycles() > 2);
    assert_eq!(scheduler.thread("A", "T").unwrap().cycles(), a_cycles);

    scheduler.prepare_next_state("A", 0).unwrap();
    scheduler.start_execution(0).unwrap();
    assert_eq!(scheduler.workers(), vec!["T"]);
    assert_eq!(scheduler.spawned(), 2);
    let u_cycles = scheduler.thread("B", "U").unwrap().cycles();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(scheduler.thread("B", "U").unwrap().cycles(), u_cycles);

    scheduler.stop_execution().unwrap();
    assert!(scheduler.workers().is_empty());
    for (state, thread) in [("A", "T"), ("B", "T"), ("B", "U")] {
        assert_eq!(scheduler.thread(state, thread).unwrap().failures(), 0);
    }
}
