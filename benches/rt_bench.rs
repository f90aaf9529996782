use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rtbroker::application::RealTimeApplication;
use rtbroker::broker::{Direction, MemoryMapBroker};
use rtbroker::config::{DataSourceSignalConfig, SignalConfig};
use rtbroker::datasource::{DataSource, MemoryDataSource};
use rtbroker::harness::CycleHarness;
use rtbroker::memory::SharedBuffer;
use rtbroker::signal::{DataSourceSignal, SignalDescriptor};
use rtbroker::sync::Timeout;
use serde_json::json;
use std::sync::Arc;

fn bench_broker_read(c: &mut Criterion) {
    let mut cfg = DataSourceSignalConfig::new("samples", "float32");
    cfg.number_of_elements = 256;
    cfg.samples = 4;
    let signal = DataSourceSignal::from_config("DDB", &cfg).unwrap();
    let ds: Arc<dyn DataSource> = Arc::new(MemoryDataSource::new("DDB", vec![signal], 2).unwrap());

    let descriptor = SignalDescriptor::from_config(
        &SignalConfig::new("samples", "DDB", "float32")
            .elements(128)
            .signal_block([0, 63])
            .signal_block([192, 255])
            .samples(4),
    )
    .unwrap();
    let memory = Arc::new(SharedBuffer::new(descriptor.footprint()));
    let mut broker = MemoryMapBroker::new(Direction::Input, "Bench", ds, Arc::clone(&memory));
    broker.add_signal(&descriptor, 0).unwrap();
    broker.finalise().unwrap();

    c.bench_function("broker_read_2x64x4_float32", |b| {
        b.iter(|| {
            broker.read(black_box(0), Timeout::Infinite).unwrap();
            black_box(&memory);
        })
    });
}

fn bench_cycle(c: &mut Criterion) {
    // Worst case: a chain of ten gains on one thread.
    let mut functions = vec![json!({
        "name": "Count", "class": "CounterGam",
        "output_signals": [{"name": "s0", "data_source": "DDB", "type": "uint32", "number_of_elements": 64}]
    })];
    let mut names = vec![json!("Count")];
    for i in 0..10 {
        let input_type = if i == 0 { "uint32" } else { "float64" };
        functions.push(json!({
            "name": format!("Gain{}", i), "class": "GainGam", "gain": 1.0,
            "input_signals": [{"name": format!("s{}", i), "data_source": "DDB",
                               "type": input_type, "number_of_elements": 64}],
            "output_signals": [{"name": format!("s{}", i + 1), "data_source": "DDB",
                                "type": "float64", "number_of_elements": 64}]
        }));
        names.push(json!(format!("Gain{}", i)));
    }
    let app = RealTimeApplication::from_value(json!({
        "data_sources": [{"name": "DDB", "class": "MemoryDataSource"}],
        "functions": functions,
        "states": [{"name": "Run", "threads": [{"name": "T", "functions": names}]}],
        "scheduler": {"name": "Sched", "class": "MultiThreadScheduler"}
    }))
    .unwrap();
    let mut harness = CycleHarness::for_thread(&app, "Run", "T").unwrap();

    c.bench_function("cycle_gain_chain_10", |b| {
        b.iter(|| {
            harness.run_cycle(black_box(0)).unwrap();
        })
    });
}

criterion_group!(benches, bench_broker_read, bench_cycle);
criterion_main!(benches);
