//! Two-state pipeline
//!
//! Builds an application with the DSL: a counter feeds a gain stage, and a
//! setpoint with a default value is only used once the `Run` state starts.
//! The demo switches from `Idle` to `Run` and prints what the data source
//! and the timing data source hold.

use rtbroker::application::RealTimeApplication;
use rtbroker::config::{DataSourceSignalConfig, DefaultValue, SignalConfig};
use rtbroker::datasource::{DataSource, TimingDataSource};
use rtbroker::dsl::ApplicationBuilder;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn read_u32(ds: &Arc<dyn DataSource>, name: &str) -> u32 {
    let index = ds.signal_index(name).unwrap();
    let mut raw = [0u8; 4];
    ds.signal_memory(index, ds.current_state_buffer())
        .unwrap()
        .read_into(0, &mut raw)
        .unwrap();
    u32::from_ne_bytes(raw)
}

fn read_f64(ds: &Arc<dyn DataSource>, name: &str) -> f64 {
    let index = ds.signal_index(name).unwrap();
    let mut raw = [0u8; 8];
    ds.signal_memory(index, ds.current_state_buffer())
        .unwrap()
        .read_into(0, &mut raw)
        .unwrap();
    f64::from_ne_bytes(raw)
}

fn main() {
    env_logger::init();

    let mut builder = ApplicationBuilder::new("Pipeline");
    let ddb = builder.data_source("DDB", "MemoryDataSource");
    let mut setpoint = DataSourceSignalConfig::new("setpoint", "uint32");
    setpoint.default = Some(DefaultValue::Scalar(42.0));
    builder.data_source_signal(ddb, setpoint);
    let timings = builder.data_source("Timings", "TimingDataSource");

    let count = builder.gam("Count", "CounterGam");
    builder.output(count, SignalConfig::new("count", "DDB", "uint32"));

    let scale = builder.gam("Scale", "GainGam");
    builder
        .input(scale, SignalConfig::new("count", "DDB", "uint32"))
        .output(scale, SignalConfig::new("scaled", "DDB", "float64"))
        .gam_param(scale, "gain", json!(0.5));

    let hold = builder.gam("Hold", "CopyGam");
    builder
        .input(hold, SignalConfig::new("setpoint", "DDB", "uint32"))
        .output(hold, SignalConfig::new("target", "DDB", "uint32"));

    let idle = builder.state("Idle");
    builder.thread(idle, "Main", &[count]).unwrap();
    let run = builder.state("Run");
    builder.thread(run, "Main", &[count, scale]).unwrap();
    builder.thread(run, "Aux", &[hold]).unwrap();
    builder.scheduler("Scheduler", "MultiThreadScheduler");
    builder.timing_data_source(timings).unwrap();

    let config = builder.build().unwrap();
    let mut app = RealTimeApplication::configure(&config).unwrap();
    let ddb = app.data_source("DDB").unwrap();

    app.prepare_next_state("Idle").unwrap();
    app.start_next_state_execution().unwrap();
    thread::sleep(Duration::from_millis(50));
    println!("Idle: count = {}, target = {}", read_u32(&ddb, "count"), read_u32(&ddb, "target"));

    app.prepare_next_state("Run").unwrap();
    app.start_next_state_execution().unwrap();
    thread::sleep(Duration::from_millis(50));
    println!(
        "Run:  count = {}, scaled = {:.1}, target = {}",
        read_u32(&ddb, "count"),
        read_f64(&ddb, "scaled"),
        read_u32(&ddb, "target")
    );

    let timings = app
        .find("Data.Timings")
        .and_then(|r| r.downcast::<TimingDataSource>())
        .unwrap();
    for name in ["Count_ExecTime", "Scale_ExecTime", "Run.Main_CycleTime", "Run.Aux_CycleTime"] {
        println!("{:>20}: {} us", name, timings.value(name).unwrap_or(0));
    }

    app.stop_current_state_execution().unwrap();
}
