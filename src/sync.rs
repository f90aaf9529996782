//! Timeouts and the event semaphore used by synchronising data sources.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    #[default]
    Infinite,
    After(Duration),
}

impl Timeout {
    pub const ZERO: Timeout = Timeout::After(Duration::ZERO);

    pub const fn from_millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    /// Absolute deadline measured from `now`, or `None` for infinite waits.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(d) => Some(now + *d),
        }
    }
}

impl From<Option<u64>> for Timeout {
    fn from(ms: Option<u64>) -> Self {
        ms.map_or(Timeout::Infinite, Timeout::from_millis)
    }
}

#[derive(Debug, Default)]
struct EventState {
    posted: bool,
    posts: u64,
}

/// Broadcast event: `post` releases every waiter and stays set until
/// `reset`.
#[derive(Debug, Default)]
pub struct EventSem {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventSem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut state = self.state.lock();
        state.posted = true;
        state.posts += 1;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        self.state.lock().posted = false;
    }

    /// Number of posts since creation.
    pub fn posts(&self) -> u64 {
        self.state.lock().posts
    }

    /// Wait until posted. Returns false on timeout.
    pub fn wait(&self, timeout: Timeout) -> bool {
        let mut state = self.state.lock();
        self.wait_locked(&mut state, timeout)
    }

    /// Wait until posted, then consume the post. Returns false on timeout.
    pub fn wait_and_reset(&self, timeout: Timeout) -> bool {
        let mut state = self.state.lock();
        let posted = self.wait_locked(&mut state, timeout);
        if posted {
            state.posted = false;
        }
        posted
    }

    fn wait_locked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, EventState>,
        timeout: Timeout,
    ) -> bool {
        let deadline = timeout.deadline_from(Instant::now());
        while !state.posted {
            match deadline {
                None => self.cond.wait(state),
                Some(deadline) => {
                    if self.cond.wait_until(state, deadline).timed_out() {
                        return state.posted;
                    }
                }
            }
        }
        true
    }
}

/// Microseconds elapsed since `start`, saturating at `u32::MAX`.
#[inline]
pub fn elapsed_micros(start: Instant) -> u32 {
    u32::try_from(start.elapsed().as_micros()).unwrap_or(u32::MAX)
}
