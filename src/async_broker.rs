//! Asynchronous output brokers.
//!
//! On the GAM's thread a write only snapshots the output memory into one of
//! a fixed set of pre-allocated frames and queues it. A flush thread owns the
//! copy table and replays each queued frame into the data source, so a slow
//! data source never stretches the cycle. Frames travel between the two
//! threads through a pair of `rtrb` queues: `free` towards the GAM and
//! `filled` towards the flusher.
//!
//! The triggered variant writes only the frames around a trigger: the
//! first output signal is a `uint8` and a non-zero value marks the frame.
//! Up to `pre` untriggered frames before it and `post` frames after it are
//! written too; everything else is discarded.

use crate::broker::{Direction, MemoryMapBroker};
use crate::config::OutputMode;
use crate::copy_table::CopyTable;
use crate::datasource::{DataSource, STATE_BUFFERS};
use crate::error::{BrokerError, ConfigurationError};
use crate::memory::SharedBuffer;
use crate::sync::Timeout;
use crate::types::{BasicType, TypeDescriptor};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FLUSH_POLL: Duration = Duration::from_millis(10);
const WAIT_STEP: Duration = Duration::from_micros(200);

/// Frames kept around a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerWindow {
    pub pre: usize,
    pub post: usize,
    /// Byte of the trigger signal in GAM output memory.
    pub offset: usize,
}

struct Frame {
    bytes: Vec<u8>,
    buffer: usize,
    triggered: bool,
    valid: bool,
}

struct RtEnds {
    free: Consumer<Frame>,
    filled: Producer<Frame>,
}

#[derive(Debug, Default)]
struct Counters {
    stop: AtomicBool,
    reset_history: AtomicBool,
    queued: AtomicU64,
    processed: AtomicU64,
    written: AtomicU64,
    discarded: AtomicU64,
    overruns: AtomicU64,
    failures: AtomicU64,
}

pub struct AsyncOutputBroker {
    owner: String,
    source: Arc<SharedBuffer>,
    inner: Arc<MemoryMapBroker>,
    buffers: usize,
    ignore_overrun: bool,
    trigger: Option<TriggerWindow>,
    rt: Mutex<RtEnds>,
    counters: Arc<Counters>,
    flusher: Option<JoinHandle<()>>,
}

impl AsyncOutputBroker {
    /// Take over a finalised output broker and start its flush thread.
    pub fn start(mut broker: MemoryMapBroker, mode: OutputMode) -> Result<Self, ConfigurationError> {
        let owner = broker.owner().to_string();
        let object = format!("{}:{}", owner, broker.data_source().name());
        let invalid = |reason: String| ConfigurationError::InvalidParameter {
            object: object.clone(),
            reason,
        };
        if broker.direction() != Direction::Output || !broker.is_finalised() {
            return Err(invalid("needs a finalised output broker".to_string()));
        }
        let (buffers, ignore_overrun, window) = match mode {
            OutputMode::Direct => return Err(invalid("data source is not asynchronous".to_string())),
            OutputMode::Asynchronous {
                buffers,
                ignore_buffer_overrun,
            } => (buffers as usize, ignore_buffer_overrun, None),
            OutputMode::Triggered {
                buffers,
                pre_trigger_buffers,
                post_trigger_buffers,
                ignore_buffer_overrun,
            } => (
                buffers as usize,
                ignore_buffer_overrun,
                Some((pre_trigger_buffers as usize, post_trigger_buffers as usize)),
            ),
        };
        if buffers == 0 {
            return Err(invalid("buffers must be at least 1".to_string()));
        }
        let trigger = match window {
            None => None,
            Some((pre, post)) => {
                if pre >= buffers || post >= buffers || pre + post >= buffers {
                    return Err(invalid(format!(
                        "{} pre and {} post trigger buffers do not fit in {}",
                        pre, post, buffers
                    )));
                }
                let offset = trigger_offset(&broker).ok_or_else(|| {
                    invalid("the first output signal must be a single uint8 trigger".to_string())
                })?;
                Some(TriggerWindow { pre, post, offset })
            }
        };

        let frame_size = broker.gam_memory_len();
        let staging = Arc::new(SharedBuffer::new(frame_size));
        let source = broker
            .swap_gam_memory(Arc::clone(&staging))
            .ok_or_else(|| invalid("staging memory does not match the GAM output".to_string()))?;
        let inner = Arc::new(broker);

        let (mut free_tx, free_rx) = RingBuffer::<Frame>::new(buffers);
        let (filled_tx, filled_rx) = RingBuffer::<Frame>::new(buffers);
        for _ in 0..buffers {
            let frame = Frame {
                bytes: vec![0; frame_size],
                buffer: 0,
                triggered: false,
                valid: false,
            };
            if free_tx.push(frame).is_err() {
                return Err(invalid("frame queue too small".to_string()));
            }
        }

        let counters = Arc::new(Counters::default());
        let flusher = Flusher {
            owner: owner.clone(),
            inner: Arc::clone(&inner),
            staging,
            free: free_tx,
            filled: filled_rx,
            trigger,
            history: VecDeque::with_capacity(trigger.map_or(0, |t| t.pre)),
            post_left: 0,
            counters: Arc::clone(&counters),
        };
        let handle = thread::Builder::new()
            .name(format!("{}:flush", owner))
            .spawn(move || flusher.run())
            .map_err(|e| invalid(format!("cannot spawn flush thread: {}", e)))?;
        log::debug!(
            "{}: asynchronous output to `{}` with {} buffers{}",
            owner,
            inner.data_source().name(),
            buffers,
            trigger.map_or(String::new(), |t| format!(", trigger window -{}/+{}", t.pre, t.post))
        );
        Ok(Self {
            owner,
            source,
            inner,
            buffers,
            ignore_overrun,
            trigger,
            rt: Mutex::new(RtEnds {
                free: free_rx,
                filled: filled_tx,
            }),
            counters,
            flusher: Some(handle),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        self.inner.data_source()
    }

    pub fn table(&self) -> &CopyTable {
        self.inner.table()
    }

    pub fn buffers(&self) -> usize {
        self.buffers
    }

    pub fn trigger(&self) -> Option<TriggerWindow> {
        self.trigger
    }

    /// Frames written to the data source.
    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::Acquire)
    }

    /// Frames dropped outside a trigger window.
    pub fn discarded(&self) -> u64 {
        self.counters.discarded.load(Ordering::Acquire)
    }

    /// Cycles that found no free frame.
    pub fn overruns(&self) -> u64 {
        self.counters.overruns.load(Ordering::Acquire)
    }

    /// Frames whose write to the data source failed.
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Acquire)
    }

    /// Frames queued but not yet seen by the flush thread.
    pub fn pending(&self) -> u64 {
        let queued = self.counters.queued.load(Ordering::Acquire);
        queued.saturating_sub(self.counters.processed.load(Ordering::Acquire))
    }

    /// Queue the current output memory for `buffer`.
    ///
    /// Never waits: with every frame in flight the cycle's output is
    /// dropped and `Overrun` is reported unless overruns are ignored.
    #[inline]
    pub fn write(&self, buffer: usize, _timeout: Timeout) -> Result<(), BrokerError> {
        if buffer >= STATE_BUFFERS {
            return Err(BrokerError::BufferIndex(buffer));
        }
        // One GAM writes from one thread at a time.
        let Some(mut rt) = self.rt.try_lock() else {
            return Err(BrokerError::Busy);
        };
        let Ok(mut frame) = rt.free.pop() else {
            self.counters.overruns.fetch_add(1, Ordering::AcqRel);
            return if self.ignore_overrun {
                Ok(())
            } else {
                Err(BrokerError::Overrun)
            };
        };
        let copied = self.source.read_into(0, &mut frame.bytes);
        frame.buffer = buffer;
        frame.valid = copied.is_ok();
        frame.triggered = match self.trigger {
            Some(t) => frame.bytes.get(t.offset).map_or(false, |b| *b != 0),
            None => true,
        };
        if rt.filled.push(frame).is_err() {
            self.counters.overruns.fetch_add(1, Ordering::AcqRel);
            return Err(BrokerError::Overrun);
        }
        self.counters.queued.fetch_add(1, Ordering::AcqRel);
        self.wake_flusher();
        copied.map_err(BrokerError::Copy)
    }

    /// Wait until the flush thread has taken every queued frame. Triggered
    /// frames are written as soon as they are taken; untriggered ones may
    /// stay in the pre-trigger history. Returns false on timeout.
    pub fn flush(&self, timeout: Timeout) -> bool {
        self.wait_until(timeout, || self.pending() == 0)
    }

    /// Discard the frames held as pre-trigger history.
    pub fn reset_pre_trigger_buffers(&self) {
        self.counters.reset_history.store(true, Ordering::Release);
        self.wake_flusher();
        self.wait_until(Timeout::Infinite, || {
            !self.counters.reset_history.load(Ordering::Acquire)
        });
    }

    fn wake_flusher(&self) {
        if let Some(handle) = &self.flusher {
            handle.thread().unpark();
        }
    }

    fn wait_until(&self, timeout: Timeout, done: impl Fn() -> bool) -> bool {
        let deadline = timeout.deadline_from(Instant::now());
        loop {
            if done() {
                return true;
            }
            let finished = self.flusher.as_ref().map_or(true, JoinHandle::is_finished);
            if finished || deadline.map_or(false, |d| Instant::now() >= d) {
                return done();
            }
            self.wake_flusher();
            thread::sleep(WAIT_STEP);
        }
    }
}

impl Drop for AsyncOutputBroker {
    fn drop(&mut self) {
        self.counters.stop.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("{}: flush thread panicked", self.owner);
            }
        }
    }
}

impl fmt::Debug for AsyncOutputBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOutputBroker")
            .field("owner", &self.owner)
            .field("data_source", &self.inner.data_source().name())
            .field("buffers", &self.buffers)
            .field("trigger", &self.trigger)
            .field("pending", &self.pending())
            .finish()
    }
}

/// GAM offset of the trigger byte: the first compiled signal must be a
/// single `uint8`.
fn trigger_offset(broker: &MemoryMapBroker) -> Option<usize> {
    let first = broker.table().signals().first()?;
    let ds_signal = broker.data_source().signals().get(first.ds_index)?;
    let is_trigger = ds_signal.type_descriptor == TypeDescriptor::Basic(BasicType::UInt8)
        && ds_signal.byte_size() == 1
        && first.cycles == 1;
    if !is_trigger {
        return None;
    }
    first.descriptors.first().map(|d| d.gam_offset)
}

/// State owned by the flush thread.
struct Flusher {
    owner: String,
    inner: Arc<MemoryMapBroker>,
    staging: Arc<SharedBuffer>,
    free: Producer<Frame>,
    filled: Consumer<Frame>,
    trigger: Option<TriggerWindow>,
    history: VecDeque<Frame>,
    post_left: usize,
    counters: Arc<Counters>,
}

impl Flusher {
    fn run(mut self) {
        loop {
            if self.counters.reset_history.load(Ordering::Acquire) {
                while let Some(frame) = self.history.pop_front() {
                    self.discard(frame);
                }
                self.counters.reset_history.store(false, Ordering::Release);
            }
            match self.filled.pop() {
                Ok(frame) => {
                    self.handle(frame);
                    self.counters.processed.fetch_add(1, Ordering::AcqRel);
                }
                Err(_) => {
                    if self.counters.stop.load(Ordering::Acquire) {
                        break;
                    }
                    thread::park_timeout(FLUSH_POLL);
                }
            }
        }
        let left = self.history.len();
        if left > 0 {
            log::debug!("{}: {} pre-trigger frames dropped at stop", self.owner, left);
        }
    }

    fn handle(&mut self, frame: Frame) {
        if !frame.valid {
            self.counters.failures.fetch_add(1, Ordering::AcqRel);
            self.recycle(frame);
            return;
        }
        let Some(window) = self.trigger else {
            self.write(frame);
            return;
        };
        if frame.triggered {
            while let Some(earlier) = self.history.pop_front() {
                self.write(earlier);
            }
            self.write(frame);
            self.post_left = window.post;
        } else if self.post_left > 0 {
            self.post_left -= 1;
            self.write(frame);
        } else if window.pre == 0 {
            self.discard(frame);
        } else {
            if self.history.len() == window.pre {
                if let Some(oldest) = self.history.pop_front() {
                    self.discard(oldest);
                }
            }
            self.history.push_back(frame);
        }
    }

    fn write(&mut self, frame: Frame) {
        let result = self
            .staging
            .write_from(0, &frame.bytes)
            .map_err(BrokerError::Copy)
            .and_then(|()| self.inner.write(frame.buffer, Timeout::Infinite));
        match result {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::AcqRel);
                log::warn!(
                    "{}: asynchronous write to `{}` failed: {}",
                    self.owner,
                    self.inner.data_source().name(),
                    e
                );
            }
        }
        self.recycle(frame);
    }

    fn discard(&mut self, frame: Frame) {
        self.counters.discarded.fetch_add(1, Ordering::AcqRel);
        self.recycle(frame);
    }

    fn recycle(&mut self, frame: Frame) {
        // Every frame comes from `free`, so there is always room for it.
        let _ = self.free.push(frame);
    }
}
