//! Data sources and their multi-buffered signal memory.
//!
//! Each signal owns `N` physical buffers and a route table mapping each of
//! the [`STATE_BUFFERS`] buffer indices to one of them. Brokers always address memory through an
//! explicit buffer index, so the outgoing state keeps reading its buffer
//! while the next state's buffer is being prepared. Publishing the new
//! active index is a single Release store.

use crate::config::{CircularBufferParams, DataSourceParams, ObjectConfig, OutputMode};
use crate::error::{BrokerError, ConfigurationError};
use crate::invariant_ppt::{assert_invariant, BUFFER_ROUTE_VALID, DEFAULT_VALUE_APPLIED};
use crate::memory::SharedBuffer;
use crate::object::{Object, Reference};
use crate::signal::DataSourceSignal;
use crate::sync::{EventSem, Timeout};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Buffer indices a state can run on: the running state owns one, the
/// state being prepared the other.
pub const STATE_BUFFERS: usize = 2;

/// The state change a data source is asked to prepare for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition<'a> {
    /// Buffer index the running state uses.
    pub active_buffer: usize,
    /// Buffer index the next state will run on.
    pub next_buffer: usize,
    pub current_state: Option<&'a str>,
    pub next_state: &'a str,
}

impl<'a> StateTransition<'a> {
    /// Transition to the index following `active_buffer` in a two-index
    /// rotation.
    pub fn new(active_buffer: usize, current_state: Option<&'a str>, next_state: &'a str) -> Self {
        Self {
            active_buffer,
            next_buffer: (active_buffer + 1) % STATE_BUFFERS,
            current_state,
            next_state,
        }
    }
}

/// Signal definitions plus their buffers and routes.
#[derive(Debug)]
pub struct SignalStore {
    signals: Vec<DataSourceSignal>,
    buffers: Vec<Vec<SharedBuffer>>,
    routes: Vec<Vec<AtomicUsize>>,
    number_of_buffers: usize,
    active: AtomicUsize,
}

impl SignalStore {
    /// Allocate `number_of_buffers` buffers per signal, each initialised
    /// with the signal default when one is declared.
    pub fn new(
        owner: &str,
        signals: Vec<DataSourceSignal>,
        number_of_buffers: usize,
    ) -> Result<Self, ConfigurationError> {
        if number_of_buffers == 0 {
            return Err(ConfigurationError::InvalidParameter {
                object: owner.to_string(),
                reason: "number_of_buffers must be at least 1".to_string(),
            });
        }
        for (i, s) in signals.iter().enumerate() {
            if signals[..i].iter().any(|p| p.name == s.name) {
                return Err(ConfigurationError::DuplicateName(format!("{}.{}", owner, s.name)));
            }
        }
        let buffers: Vec<Vec<SharedBuffer>> = signals
            .iter()
            .map(|s| {
                let initial = s.encoded_default().unwrap_or_else(|| vec![0; s.byte_size()]);
                (0..number_of_buffers)
                    .map(|_| SharedBuffer::from_bytes(&initial))
                    .collect()
            })
            .collect();
        let routes: Vec<Vec<AtomicUsize>> = signals
            .iter()
            .map(|_| (0..STATE_BUFFERS).map(|_| AtomicUsize::new(0)).collect())
            .collect();
        Ok(Self {
            signals,
            buffers,
            routes,
            number_of_buffers,
            active: AtomicUsize::new(0),
        })
    }

    pub fn signals(&self) -> &[DataSourceSignal] {
        &self.signals
    }

    pub fn number_of_buffers(&self) -> usize {
        self.number_of_buffers
    }

    pub fn current_state_buffer(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active_buffer(&self, buffer: usize) -> Result<(), BrokerError> {
        if buffer >= STATE_BUFFERS {
            return Err(BrokerError::BufferIndex(buffer));
        }
        self.active.store(buffer, Ordering::Release);
        Ok(())
    }

    /// Physical buffer currently routed for `buffer`. `None` for an unknown
    /// signal or a buffer index outside `0..STATE_BUFFERS`.
    pub fn route(&self, signal: usize, buffer: usize) -> Option<usize> {
        let slot = self.routes.get(signal)?.get(buffer)?;
        Some(slot.load(Ordering::Acquire))
    }

    /// Memory a broker running on `buffer` should use for `signal`.
    #[inline]
    pub fn memory(&self, signal: usize, buffer: usize) -> Option<&SharedBuffer> {
        let physical = self.route(signal, buffer)?;
        self.buffers.get(signal)?.get(physical)
    }

    /// Physical buffer, bypassing the route table.
    pub fn physical(&self, signal: usize, physical: usize) -> Option<&SharedBuffer> {
        self.buffers.get(signal)?.get(physical)
    }

    /// Route every signal for the next buffer index.
    ///
    /// The next index keeps using the physical buffer of the running state,
    /// except for signals unused in the current state but used in the next
    /// one: when they declare a default, it is written into a physical
    /// buffer other than the one the running state uses and the next index
    /// is routed there. Only the next index's route changes; the active one
    /// is left untouched.
    pub fn prepare_next_state(
        &self,
        owner: &str,
        transition: &StateTransition<'_>,
    ) -> Result<(), ConfigurationError> {
        let (active, next) = (transition.active_buffer, transition.next_buffer);
        if active >= STATE_BUFFERS || next >= STATE_BUFFERS || active == next {
            return Err(ConfigurationError::InvalidParameter {
                object: owner.to_string(),
                reason: format!("cannot prepare buffer {} while {} is active", next, active),
            });
        }
        for (i, signal) in self.signals.iter().enumerate() {
            let current_route = self.routes[i][active].load(Ordering::Acquire);
            let mut target = current_route;

            let used_now = transition
                .current_state
                .map_or(false, |s| signal.is_used_in(s));
            if !used_now && signal.is_used_in(transition.next_state) {
                match signal.encoded_default() {
                    Some(bytes) => {
                        target = (current_route + 1) % self.number_of_buffers;
                        let buffer = &self.buffers[i][target];
                        buffer.write_from(0, &bytes).map_err(|e| {
                            ConfigurationError::InvalidParameter {
                                object: format!("{}.{}", owner, signal.name),
                                reason: e.to_string(),
                            }
                        })?;
                        assert_invariant(
                            DEFAULT_VALUE_APPLIED,
                            buffer.to_vec() == bytes,
                            "default written before the switch",
                            Some(&signal.name),
                        );
                    }
                    None => log::warn!(
                        "{}: no default for `{}`, value carried into state `{}`",
                        owner,
                        signal.name,
                        transition.next_state
                    ),
                }
            }

            assert_invariant(
                BUFFER_ROUTE_VALID,
                target < self.number_of_buffers,
                "route points at an allocated buffer",
                Some(&signal.name),
            );
            self.routes[i][next].store(target, Ordering::Release);
        }
        Ok(())
    }
}

/// Memory shared between GAMs, addressed by signal index and buffer index.
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn signal_store(&self) -> &SignalStore;

    fn signals(&self) -> &[DataSourceSignal] {
        self.signal_store().signals()
    }

    fn signal_index(&self, name: &str) -> Option<usize> {
        self.signals().iter().position(|s| s.name == name)
    }

    fn number_of_buffers(&self) -> usize {
        self.signal_store().number_of_buffers()
    }

    /// Buffer index readers should use now.
    fn current_state_buffer(&self) -> usize {
        self.signal_store().current_state_buffer()
    }

    /// Publish `buffer` as the active index.
    fn set_active_buffer(&self, buffer: usize) -> Result<(), BrokerError> {
        self.signal_store().set_active_buffer(buffer)
    }

    #[inline]
    fn signal_memory(&self, signal: usize, buffer: usize) -> Option<&SharedBuffer> {
        self.signal_store().memory(signal, buffer)
    }

    /// Block until new data is available. Returns false on timeout.
    fn synchronise(&self, _timeout: Timeout) -> bool {
        true
    }

    fn read_start(&self) {}

    fn read_end(&self) {}

    fn write_start(&self) {}

    fn write_end(&self) {}

    fn prepare_next_state(&self, transition: &StateTransition<'_>) -> Result<(), ConfigurationError> {
        self.signal_store().prepare_next_state(self.name(), transition)
    }

    /// How GAM outputs reach this data source.
    fn output_mode(&self) -> OutputMode {
        OutputMode::Direct
    }
}

fn build_store(
    config: &ObjectConfig,
    params: &DataSourceParams,
    min_buffers: Option<usize>,
) -> Result<SignalStore, ConfigurationError> {
    let signals = params
        .signals
        .iter()
        .map(|s| DataSourceSignal::from_config(&config.name, s))
        .collect::<Result<Vec<_>, _>>()?;
    let buffers = min_buffers.unwrap_or(params.number_of_buffers as usize);
    SignalStore::new(&config.name, signals, buffers)
}

/// Only plain memory can take asynchronous output.
fn direct_output_only(config: &ObjectConfig, params: &DataSourceParams) -> Result<(), ConfigurationError> {
    if params.output != OutputMode::Direct {
        return Err(ConfigurationError::InvalidParameter {
            object: config.name.clone(),
            reason: format!("{} takes direct output only", config.class),
        });
    }
    Ok(())
}

/// Plain multi-buffered memory; never blocks.
#[derive(Debug)]
pub struct MemoryDataSource {
    name: String,
    store: SignalStore,
    output: OutputMode,
}

impl MemoryDataSource {
    pub fn new(name: &str, signals: Vec<DataSourceSignal>, number_of_buffers: usize) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: name.to_string(),
            store: SignalStore::new(name, signals, number_of_buffers)?,
            output: OutputMode::Direct,
        })
    }

    pub fn with_output_mode(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}

impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal_store(&self) -> &SignalStore {
        &self.store
    }

    fn output_mode(&self) -> OutputMode {
        self.output
    }
}

impl Object for MemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "MemoryDataSource"
    }

    fn into_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }
}

pub(crate) fn build_memory_data_source(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: DataSourceParams = config.parse()?;
    Ok(Reference::new(MemoryDataSource {
        name: config.name.clone(),
        store: build_store(config, &params, None)?,
        output: params.output,
    }))
}

/// Data source gated by an event.
///
/// A writer finishing its copy (`write_end`) or an external producer calling
/// `post` releases one synchronising reader, which consumes the event.
#[derive(Debug)]
pub struct EventDataSource {
    name: String,
    store: SignalStore,
    event: EventSem,
}

impl EventDataSource {
    pub fn new(name: &str, signals: Vec<DataSourceSignal>, number_of_buffers: usize) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: name.to_string(),
            store: SignalStore::new(name, signals, number_of_buffers)?,
            event: EventSem::new(),
        })
    }

    /// Signal that new data is available.
    pub fn post(&self) {
        self.event.post();
    }

    pub fn posts(&self) -> u64 {
        self.event.posts()
    }
}

impl DataSource for EventDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal_store(&self) -> &SignalStore {
        &self.store
    }

    fn synchronise(&self, timeout: Timeout) -> bool {
        self.event.wait_and_reset(timeout)
    }

    fn write_end(&self) {
        self.event.post();
    }
}

impl Object for EventDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "EventDataSource"
    }

    fn into_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }
}

pub(crate) fn build_event_data_source(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: DataSourceParams = config.parse()?;
    direct_output_only(config, &params)?;
    Ok(Reference::new(EventDataSource {
        name: config.name.clone(),
        store: build_store(config, &params, None)?,
        event: EventSem::new(),
    }))
}

/// Single-buffered `uint32` signals holding execution times in µs.
#[derive(Debug)]
pub struct TimingDataSource {
    name: String,
    store: SignalStore,
}

impl TimingDataSource {
    pub fn new(name: &str, signals: Vec<DataSourceSignal>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: name.to_string(),
            store: SignalStore::new(name, signals, 1)?,
        })
    }

    /// Latest value of a timing signal.
    pub fn value(&self, signal: &str) -> Option<u32> {
        let index = self.signal_index(signal)?;
        let mut raw = [0u8; 4];
        self.store.physical(index, 0)?.read_into(0, &mut raw).ok()?;
        Some(u32::from_ne_bytes(raw))
    }
}

impl DataSource for TimingDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal_store(&self) -> &SignalStore {
        &self.store
    }
}

impl Object for TimingDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "TimingDataSource"
    }

    fn into_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }
}

pub(crate) fn build_timing_data_source(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: DataSourceParams = config.parse()?;
    direct_output_only(config, &params)?;
    let store = build_store(config, &params, Some(1))?;
    if let Some(bad) = store.signals().iter().find(|s| s.type_descriptor.name() != "uint32") {
        return Err(ConfigurationError::TypeMismatch {
            signal: bad.name.clone(),
            gam_type: bad.type_descriptor.name().to_string(),
            data_source_type: "uint32".to_string(),
        });
    }
    Ok(Reference::new(TimingDataSource {
        name: config.name.clone(),
        store,
    }))
}

/// Produces the samples of a [`CircularBufferDataSource`].
///
/// `fill` receives one frame: every signal's bytes back to back, in signal
/// order. It may block until the device has data and returns false when no
/// sample was produced.
pub trait SampleSource: Send + 'static {
    fn fill(&mut self, frame: &mut [u8]) -> bool;
}

impl<F> SampleSource for F
where
    F: FnMut(&mut [u8]) -> bool + Send + 'static,
{
    fn fill(&mut self, frame: &mut [u8]) -> bool {
        self(frame)
    }
}

const PRODUCER_IDLE: Duration = Duration::from_millis(1);

/// Bit set in the error check signal when samples were dropped before
/// the frame.
pub const SAMPLES_DROPPED: u32 = 1;

#[derive(Debug, Default)]
struct ProducerState {
    stop: AtomicBool,
    produced: AtomicU64,
    dropped: AtomicU64,
    ready: EventSem,
}

struct ReaderEnds {
    filled: Consumer<Vec<u8>>,
    free: Producer<Vec<u8>>,
}

/// Input data source fed by its own producer thread.
///
/// The producer fills pre-allocated sample frames from a [`SampleSource`]
/// and queues them; a synchronising reader takes the oldest queued frame,
/// which becomes the signal values every reader sees. When the reader falls
/// `slots` frames behind, new samples are dropped and the next frame is
/// flagged in the error check signal.
pub struct CircularBufferDataSource {
    name: String,
    store: SignalStore,
    /// Frame offset of each signal.
    offsets: Vec<usize>,
    reader: Mutex<ReaderEnds>,
    state: Arc<ProducerState>,
    consumed: AtomicU64,
    producer: Option<JoinHandle<()>>,
}

impl CircularBufferDataSource {
    pub fn new(
        name: &str,
        signals: Vec<DataSourceSignal>,
        params: &CircularBufferParams,
        source: Box<dyn SampleSource>,
    ) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidParameter {
            object: name.to_string(),
            reason,
        };
        let slots = params.slots as usize;
        if slots == 0 {
            return Err(invalid("slots must be at least 1".to_string()));
        }
        let store = SignalStore::new(name, signals, 1)?;
        let mut offsets = Vec::with_capacity(store.signals().len());
        let mut frame_size = 0;
        for s in store.signals() {
            offsets.push(frame_size);
            frame_size += s.byte_size();
        }
        let stamp = special_signal(&store, &offsets, params.time_stamp_signal.as_deref(), "uint64")
            .map_err(&invalid)?;
        let error_check = special_signal(&store, &offsets, params.error_check_signal.as_deref(), "uint32")
            .map_err(&invalid)?;

        let (mut free_tx, free_rx) = RingBuffer::<Vec<u8>>::new(slots);
        let (filled_tx, filled_rx) = RingBuffer::<Vec<u8>>::new(slots);
        for _ in 0..slots {
            if free_tx.push(vec![0; frame_size]).is_err() {
                return Err(invalid("frame queue too small".to_string()));
            }
        }
        let state = Arc::new(ProducerState::default());
        let producer = SampleProducer {
            source,
            free: free_rx,
            filled: filled_tx,
            scratch: vec![0; frame_size],
            stamp,
            error_check,
            state: Arc::clone(&state),
        };
        let handle = thread::Builder::new()
            .name(format!("{}:producer", name))
            .spawn(move || producer.run())
            .map_err(|e| invalid(format!("cannot spawn producer thread: {}", e)))?;
        log::debug!(
            "{}: circular buffer of {} frames, {} bytes each",
            name,
            slots,
            frame_size
        );
        Ok(Self {
            name: name.to_string(),
            store,
            offsets,
            reader: Mutex::new(ReaderEnds {
                filled: filled_rx,
                free: free_tx,
            }),
            state,
            consumed: AtomicU64::new(0),
            producer: Some(handle),
        })
    }

    /// Build from a configuration object; `source` supplies the samples.
    pub fn from_config(config: &ObjectConfig, source: Box<dyn SampleSource>) -> Result<Self, ConfigurationError> {
        let params: CircularBufferParams = config.parse()?;
        let signals = params
            .signals
            .iter()
            .map(|s| DataSourceSignal::from_config(&config.name, s))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&config.name, signals, &params, source)
    }

    /// Samples queued by the producer.
    pub fn produced(&self) -> u64 {
        self.state.produced.load(Ordering::Acquire)
    }

    /// Samples lost because every slot was full.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Acquire)
    }

    /// Frames taken by synchronising readers.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Queued frames not yet read.
    pub fn backlog(&self) -> u64 {
        self.produced().saturating_sub(self.consumed())
    }

    /// Pop the oldest frame into signal memory.
    fn take_frame(&self, ends: &mut ReaderEnds) -> bool {
        let Ok(frame) = ends.filled.pop() else {
            return false;
        };
        for (i, &offset) in self.offsets.iter().enumerate() {
            let len = self.store.signals()[i].byte_size();
            if let (Some(memory), Some(bytes)) = (self.store.physical(i, 0), frame.get(offset..offset + len)) {
                // Same length by construction.
                let _ = memory.write_from(0, bytes);
            }
        }
        let _ = ends.free.push(frame);
        self.consumed.fetch_add(1, Ordering::AcqRel);
        true
    }
}

/// Frame offset of an optional bookkeeping signal of `type_name`.
fn special_signal(
    store: &SignalStore,
    offsets: &[usize],
    name: Option<&str>,
    type_name: &str,
) -> Result<Option<usize>, String> {
    let Some(name) = name else {
        return Ok(None);
    };
    let index = store
        .signals()
        .iter()
        .position(|s| s.name == name)
        .ok_or_else(|| format!("signal `{}` not found", name))?;
    let signal = &store.signals()[index];
    if signal.type_descriptor.name() != type_name || signal.number_of_elements * signal.samples != 1 {
        return Err(format!("signal `{}` must be a single {}", name, type_name));
    }
    Ok(Some(offsets[index]))
}

/// State owned by the producer thread.
struct SampleProducer {
    source: Box<dyn SampleSource>,
    free: Consumer<Vec<u8>>,
    filled: Producer<Vec<u8>>,
    scratch: Vec<u8>,
    stamp: Option<usize>,
    error_check: Option<usize>,
    state: Arc<ProducerState>,
}

impl SampleProducer {
    fn run(mut self) {
        let start = Instant::now();
        let mut spare: Option<Vec<u8>> = None;
        let mut dropped_before = false;
        while !self.state.stop.load(Ordering::Acquire) {
            let Some(mut frame) = spare.take().or_else(|| self.free.pop().ok()) else {
                // Reader is behind: sample anyway so the device keeps pace.
                if self.source.fill(&mut self.scratch) {
                    self.state.dropped.fetch_add(1, Ordering::AcqRel);
                    dropped_before = true;
                } else {
                    thread::park_timeout(PRODUCER_IDLE);
                }
                continue;
            };
            if !self.source.fill(&mut frame) {
                spare = Some(frame);
                thread::park_timeout(PRODUCER_IDLE);
                continue;
            }
            if let Some(slot) = self.stamp.and_then(|o| frame.get_mut(o..o + 8)) {
                let micros = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
                slot.copy_from_slice(&micros.to_ne_bytes());
            }
            if let Some(slot) = self.error_check.and_then(|o| frame.get_mut(o..o + 4)) {
                let flags = if dropped_before { SAMPLES_DROPPED } else { 0 };
                slot.copy_from_slice(&flags.to_ne_bytes());
            }
            dropped_before = false;
            match self.filled.push(frame) {
                Ok(()) => {
                    self.state.produced.fetch_add(1, Ordering::AcqRel);
                    self.state.ready.post();
                }
                Err(PushError::Full(frame)) => spare = Some(frame),
            }
        }
    }
}

impl DataSource for CircularBufferDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal_store(&self) -> &SignalStore {
        &self.store
    }

    /// Take the oldest queued frame, waiting for the producer when none is
    /// queued. Returns false on timeout.
    fn synchronise(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline_from(Instant::now());
        let mut ends = self.reader.lock();
        loop {
            if self.take_frame(&mut ends) {
                return true;
            }
            let remaining = match deadline {
                None => Timeout::Infinite,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Timeout::After(left),
                    _ => return self.take_frame(&mut ends),
                },
            };
            if !self.state.ready.wait_and_reset(remaining) {
                return self.take_frame(&mut ends);
            }
        }
    }
}

impl Object for CircularBufferDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "CircularBufferDataSource"
    }

    fn into_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }
}

impl Drop for CircularBufferDataSource {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(handle) = self.producer.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("{}: producer thread panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for CircularBufferDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularBufferDataSource")
            .field("name", &self.name)
            .field("signals", &self.store.signals().len())
            .field("produced", &self.produced())
            .field("consumed", &self.consumed())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSourceSignalConfig, DefaultValue};

    fn signal(name: &str, default: Option<f64>, states: &[&str]) -> DataSourceSignal {
        let mut cfg = DataSourceSignalConfig::new(name, "uint32");
        cfg.default = default.map(DefaultValue::Scalar);
        cfg.states = states.iter().map(|s| s.to_string()).collect();
        DataSourceSignal::from_config("DS", &cfg).unwrap()
    }

    fn read_u32(ds: &dyn DataSource, signal: usize, buffer: usize) -> u32 {
        let mut raw = [0u8; 4];
        ds.signal_memory(signal, buffer).unwrap().read_into(0, &mut raw).unwrap();
        u32::from_ne_bytes(raw)
    }

    #[test]
    fn defaults_initialise_every_buffer() {
        let ds = MemoryDataSource::new("DS", vec![signal("a", Some(7.0), &[])], 2).unwrap();
        assert_eq!(read_u32(&ds, 0, 0), 7);
        assert_eq!(read_u32(&ds, 0, 1), 7);
    }

    #[test]
    fn next_buffer_aliases_current_without_reset() {
        let ds = MemoryDataSource::new("DS", vec![signal("a", None, &["A", "B"])], 2).unwrap();
        ds.signal_memory(0, 0).unwrap().write_from(0, &5u32.to_ne_bytes()).unwrap();
        ds.prepare_next_state(&StateTransition::new(0, Some("A"), "B")).unwrap();
        assert_eq!(ds.signal_store().route(0, 1), Some(0));
        assert_eq!(read_u32(&ds, 0, 1), 5);
    }

    #[test]
    fn default_is_written_into_next_buffer_only() {
        let ds = MemoryDataSource::new("DS", vec![signal("a", Some(1.0), &["B"])], 2).unwrap();
        ds.signal_memory(0, 0).unwrap().write_from(0, &9u32.to_ne_bytes()).unwrap();
        ds.prepare_next_state(&StateTransition::new(0, Some("A"), "B")).unwrap();
        assert_eq!(read_u32(&ds, 0, 0), 9);
        assert_eq!(read_u32(&ds, 0, 1), 1);
        assert_eq!(ds.signal_store().route(0, 1), Some(1));
    }

    #[test]
    fn switch_is_a_single_index_store() {
        let ds = MemoryDataSource::new("DS", vec![signal("a", None, &[])], 2).unwrap();
        assert_eq!(ds.current_state_buffer(), 0);
        ds.set_active_buffer(1).unwrap();
        assert_eq!(ds.current_state_buffer(), 1);
    }

    #[test]
    fn buffer_indices_outside_the_state_range_do_not_wrap() {
        let ds = MemoryDataSource::new("DS", vec![signal("a", None, &[])], 2).unwrap();
        assert_eq!(ds.set_active_buffer(3), Err(BrokerError::BufferIndex(3)));
        assert_eq!(ds.current_state_buffer(), 0);
        assert_eq!(ds.signal_store().route(0, 2), None);
        assert!(ds.signal_memory(0, 7).is_none());
        assert!(ds
            .prepare_next_state(&StateTransition { next_buffer: 0, ..StateTransition::new(0, None, "A") })
            .is_err());
    }

    #[test]
    fn default_never_lands_in_the_running_buffer() {
        let ds = MemoryDataSource::new("DS", vec![signal("a", Some(1.0), &["B"])], 2).unwrap();
        // A -> B routes index 1 to physical 1, which then runs.
        ds.prepare_next_state(&StateTransition::new(0, Some("A"), "B")).unwrap();
        ds.set_active_buffer(1).unwrap();
        ds.signal_memory(0, 1).unwrap().write_from(0, &8u32.to_ne_bytes()).unwrap();
        // B -> A: the signal is unused in A, nothing is touched.
        ds.prepare_next_state(&StateTransition::new(1, Some("B"), "A")).unwrap();
        ds.set_active_buffer(0).unwrap();
        // A -> B from index 0: the default goes next to index 0's buffer.
        ds.prepare_next_state(&StateTransition::new(0, Some("A"), "B")).unwrap();
        let running = ds.signal_store().route(0, 0).unwrap();
        let next = ds.signal_store().route(0, 1).unwrap();
        assert_ne!(running, next);
        assert_eq!(read_u32(&ds, 0, 1), 1);
    }

    #[test]
    fn zero_buffers_are_rejected() {
        assert!(MemoryDataSource::new("DS", vec![], 0).is_err());
    }

    #[test]
    fn duplicate_signal_names_are_rejected() {
        let err = MemoryDataSource::new("DS", vec![signal("a", None, &[]), signal("a", None, &[])], 2)
            .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateName("DS.a".into()));
    }

    #[test]
    fn event_source_synchronises_on_write_end() {
        let ds = EventDataSource::new("EV", vec![signal("t", None, &[])], 1).unwrap();
        assert!(!ds.synchronise(Timeout::ZERO));
        ds.write_end();
        assert!(ds.synchronise(Timeout::ZERO));
        assert!(!ds.synchronise(Timeout::ZERO));
    }

    fn circular_params(slots: u32) -> CircularBufferParams {
        CircularBufferParams {
            slots,
            time_stamp_signal: None,
            error_check_signal: None,
            signals: Vec::new(),
        }
    }

    fn typed(name: &str, type_name: &str) -> DataSourceSignal {
        DataSourceSignal::from_config("CB", &DataSourceSignalConfig::new(name, type_name)).unwrap()
    }

    /// Counts 1, 2, ... into the first four bytes, up to `limit`.
    fn counting_source(limit: Arc<AtomicU64>) -> Box<dyn SampleSource> {
        let mut next = 0u32;
        Box::new(move |frame: &mut [u8]| {
            if u64::from(next) >= limit.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
                return false;
            }
            next += 1;
            frame[..4].copy_from_slice(&next.to_ne_bytes());
            true
        })
    }

    fn wait_for(done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(done());
    }

    #[test]
    fn circular_buffer_delivers_samples_in_order() {
        let limit = Arc::new(AtomicU64::new(5));
        let ds = CircularBufferDataSource::new(
            "CB",
            vec![typed("v", "uint32")],
            &circular_params(8),
            counting_source(limit),
        )
        .unwrap();
        for expected in 1..=5 {
            assert!(ds.synchronise(Timeout::from_millis(5_000)));
            assert_eq!(read_u32(&ds, 0, 0), expected);
            assert_eq!(read_u32(&ds, 0, 1), expected);
        }
        assert!(!ds.synchronise(Timeout::from_millis(20)));
        assert_eq!(ds.consumed(), 5);
        assert_eq!(ds.dropped(), 0);
        assert_eq!(ds.backlog(), 0);
    }

    #[test]
    fn full_circular_buffer_drops_and_flags_samples() {
        let mut params = circular_params(2);
        params.time_stamp_signal = Some("stamp".into());
        params.error_check_signal = Some("errors".into());
        let limit = Arc::new(AtomicU64::new(6));
        let ds = CircularBufferDataSource::new(
            "CB",
            vec![typed("v", "uint32"), typed("stamp", "uint64"), typed("errors", "uint32")],
            &params,
            counting_source(Arc::clone(&limit)),
        )
        .unwrap();
        wait_for(|| ds.produced() + ds.dropped() == 6);
        assert_eq!((ds.produced(), ds.dropped()), (2, 4));

        for expected in 1..=2 {
            assert!(ds.synchronise(Timeout::from_millis(5_000)));
            assert_eq!(read_u32(&ds, 0, 0), expected);
            assert_eq!(read_u32(&ds, 2, 0), 0);
        }
        limit.store(7, Ordering::Release);
        assert!(ds.synchronise(Timeout::from_millis(5_000)));
        assert_eq!(read_u32(&ds, 0, 0), 7);
        assert_eq!(read_u32(&ds, 2, 0), SAMPLES_DROPPED);
        let mut stamp = [0u8; 8];
        ds.signal_memory(1, 0).unwrap().read_into(0, &mut stamp).unwrap();
        assert!(u64::from_ne_bytes(stamp) > 0);
    }

    #[test]
    fn circular_buffer_checks_its_parameters() {
        let limit = Arc::new(AtomicU64::new(0));
        assert!(CircularBufferDataSource::new(
            "CB",
            vec![typed("v", "uint32")],
            &circular_params(0),
            counting_source(Arc::clone(&limit)),
        )
        .is_err());

        let mut params = circular_params(4);
        params.time_stamp_signal = Some("v".into());
        let err = CircularBufferDataSource::new("CB", vec![typed("v", "uint32")], &params, counting_source(limit))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidParameter { .. }));
    }

    #[test]
    fn only_memory_sources_take_asynchronous_output() {
        let config = ObjectConfig::new("EV", "EventDataSource")
            .with_param("output", serde_json::json!({"mode": "asynchronous", "buffers": 4}));
        assert!(build_event_data_source(&config).is_err());
        let config = ObjectConfig::new("DDB", "MemoryDataSource")
            .with_param("output", serde_json::json!({"mode": "asynchronous", "buffers": 4}));
        let ds = build_memory_data_source(&config).unwrap().data_source().unwrap();
        assert_eq!(
            ds.output_mode(),
            OutputMode::Asynchronous {
                buffers: 4,
                ignore_buffer_overrun: false
            }
        );
    }

    #[test]
    fn timing_source_reads_back_values() {
        let ds = TimingDataSource::new("Timings", vec![signal("G_ExecTime", None, &[])]).unwrap();
        ds.signal_memory(0, 1).unwrap().write_from(0, &42u32.to_ne_bytes()).unwrap();
        assert_eq!(ds.value("G_ExecTime"), Some(42));
        assert_eq!(ds.value("missing"), None);
    }
}
