use rtbroker::broker::{Direction, MemoryMapBroker};
use rtbroker::config::{DataSourceSignalConfig, SignalConfig};
use rtbroker::datasource::{DataSource, EventDataSource};
use rtbroker::error::BrokerError;
use rtbroker::memory::SharedBuffer;
use rtbroker::signal::{DataSourceSignal, SignalDescriptor};
use rtbroker::sync::Timeout;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn event_source() -> Arc<EventDataSource> {
    let signal = DataSourceSignal::from_config("Events", &DataSourceSignalConfig::new("tick", "uint32")).unwrap();
    Arc::new(EventDataSource::new("Events", vec![signal], 2).unwrap())
}

fn broker(ds: &Arc<EventDataSource>, direction: Direction) -> (MemoryMapBroker, Arc<SharedBuffer>) {
    let ds: Arc<dyn DataSource> = ds.clone();
    let descriptor = SignalDescriptor::from_config(&SignalConfig::new("tick", "Events", "uint32").cycles(1)).unwrap();
    let memory = Arc::new(SharedBuffer::new(4));
    let mut broker = MemoryMapBroker::new(direction, "G", ds, Arc::clone(&memory));
    broker.add_signal(&descriptor, 0).unwrap();
    broker.finalise().unwrap();
    (broker, memory)
}

#[test]
fn zero_timeout_returns_without_blocking() {
    let ds = event_source();
    ds.signal_memory(0, 0).unwrap().write_from(0, &3u32.to_ne_bytes()).unwrap();
    let (reader, memory) = broker(&ds, Direction::Input);
    assert!(reader.is_synchronising());

    let start = Instant::now();
    assert_eq!(reader.read(0, Timeout::ZERO), Err(BrokerError::SyncTimeout));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(memory.to_vec(), vec![0u8; 4]);
}

#[test]
fn bounded_timeout_waits_about_that_long() {
    let ds = event_source();
    let (reader, _) = broker(&ds, Direction::Input);
    let start = Instant::now();
    assert_eq!(reader.read(0, Timeout::from_millis(20)), Err(BrokerError::SyncTimeout));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(20));
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn post_releases_one_read() {
    let ds = event_source();
    ds.signal_memory(0, 0).unwrap().write_from(0, &11u32.to_ne_bytes()).unwrap();
    let (reader, memory) = broker(&ds, Direction::Input);

    let producer = Arc::clone(&ds);
    let posting = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        producer.post();
    });
    reader.read(0, Timeout::from_millis(5_000)).unwrap();
    posting.join().unwrap();
    assert_eq!(memory.to_vec(), 11u32.to_ne_bytes());

    // The post was consumed.
    assert_eq!(reader.read(0, Timeout::ZERO), Err(BrokerError::SyncTimeout));
}

#[test]
fn writer_completion_releases_the_reader() {
    let ds = event_source();
    let (writer, out) = broker(&ds, Direction::Output);
    let (reader, input) = broker(&ds, Direction::Input);

    ds.post();
    out.write_from(0, &21u32.to_ne_bytes()).unwrap();
    writer.write(0, Timeout::ZERO).unwrap();
    reader.read(0, Timeout::ZERO).unwrap();
    assert_eq!(input.to_vec(), 21u32.to_ne_bytes());
    assert_eq!(ds.posts(), 2);
}
