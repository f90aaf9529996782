//! RT-safe event signalling for the scheduler worker threads.
//!
//! Worker threads never log, lock or allocate. They push fixed-size
//! `RtEvent` values into a lock-free SPSC queue; the controlling thread
//! drains the queue and turns events into log records or contract checks.
//! When the queue is full the event is dropped rather than blocking.

use rtrb::{Consumer, Producer, RingBuffer};

/// Worker thread entered its loop.
pub const EV_THREAD_STARTED: u8 = 1;

/// First full cycle completed after start.
pub const EV_FIRST_CYCLE: u8 = 2;

/// An executable failed; the rest of its cycle was skipped.
pub const EV_EXECUTABLE_FAILED: u8 = 3;

/// A synchronising wait timed out.
pub const EV_SYNC_TIMEOUT: u8 = 4;

/// A bounds-checked copy was rejected.
pub const EV_COPY_FAILED: u8 = 5;

/// A broker was used before it was finalised.
pub const EV_NOT_FINALISED: u8 = 6;

/// Worker thread observed the stop flag and left its loop.
pub const EV_THREAD_EXIT: u8 = 7;

/// An asynchronous output broker had no free buffer for the cycle.
pub const EV_OUTPUT_OVERRUN: u8 = 8;

/// Fixed-size event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtEvent {
    pub id: u8,
    /// Thread index inside the running state.
    pub thread: u16,
    /// Executable slot, or 0 when not applicable.
    pub slot: u16,
}

impl RtEvent {
    pub const fn new(id: u8, thread: u16, slot: u16) -> Self {
        Self { id, thread, slot }
    }
}

pub const RT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Returns (producer for the worker, consumer for the controller).
pub fn new_event_queue() -> (Producer<RtEvent>, Consumer<RtEvent>) {
    RingBuffer::new(RT_EVENT_QUEUE_CAPACITY)
}

#[inline]
pub fn signal_event(tx: &mut Producer<RtEvent>, event: RtEvent) {
    let _ = tx.push(event);
}

pub fn drain_events(rx: &mut Consumer<RtEvent>) -> Vec<RtEvent> {
    let mut events = Vec::with_capacity(rx.slots());
    while let Ok(event) = rx.pop() {
        events.push(event);
    }
    events
}

/// Occurrences of each event id.
pub fn count_events(events: &[RtEvent]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for event in events {
        counts[event.id as usize] += 1;
    }
    counts
}

/// Panics if any `required` id is absent from `events`.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, events: &[RtEvent], required: &[u8]) {
    let counts = count_events(events);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| event_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            events.iter().map(|e| event_name(e.id)).collect();
        panic!(
            "RT Contract '{}' missing events: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

pub const fn event_name(id: u8) -> &'static str {
    match id {
        EV_THREAD_STARTED => "THREAD_STARTED",
        EV_FIRST_CYCLE => "FIRST_CYCLE",
        EV_EXECUTABLE_FAILED => "EXECUTABLE_FAILED",
        EV_SYNC_TIMEOUT => "SYNC_TIMEOUT",
        EV_COPY_FAILED => "COPY_FAILED",
        EV_NOT_FINALISED => "NOT_FINALISED",
        EV_THREAD_EXIT => "THREAD_EXIT",
        EV_OUTPUT_OVERRUN => "OUTPUT_OVERRUN",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_order() {
        let (mut tx, mut rx) = new_event_queue();
        signal_event(&mut tx, RtEvent::new(EV_THREAD_STARTED, 0, 0));
        signal_event(&mut tx, RtEvent::new(EV_SYNC_TIMEOUT, 0, 2));
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], RtEvent::new(EV_SYNC_TIMEOUT, 0, 2));
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn overflow_drops_events() {
        let (mut tx, mut rx) = new_event_queue();
        for _ in 0..RT_EVENT_QUEUE_CAPACITY + 10 {
            signal_event(&mut tx, RtEvent::new(EV_COPY_FAILED, 1, 1));
        }
        assert_eq!(drain_events(&mut rx).len(), RT_EVENT_QUEUE_CAPACITY);
    }

    #[test]
    #[should_panic(expected = "missing events")]
    fn contract_fails_when_missing() {
        let events = [RtEvent::new(EV_THREAD_STARTED, 0, 0)];
        contract_test_rt("start and exit", &events, &[EV_THREAD_STARTED, EV_THREAD_EXIT]);
    }

    #[test]
    fn names() {
        assert_eq!(event_name(EV_THREAD_EXIT), "THREAD_EXIT");
        assert_eq!(event_name(200), "UNKNOWN");
    }
}
