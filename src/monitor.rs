use crate::types::Overflow;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Stopped,
    Running,
}

/// Ring cursors and stream state shared by the capture worker and the consumer.
#[derive(Debug)]
pub(crate) struct Cursors {
    pub state: StreamState,
    /// Written by the controlling thread, observed by the worker.
    pub requested: StreamState,
    /// Frames finalized since start. Written only by the worker.
    pub record: u64,
    /// Frames consumed since start. Written only by the consumer.
    pub read: u64,
    /// Cursor of the leased frame.
    pub lease: Option<u64>,
    pub xruns: u64,
    pub overflow: Overflow,
    /// Fatal capture error not yet reported to the caller.
    pub fault: Option<String>,
    /// Bumped by every start; a worker only acts while it owns the current value.
    pub generation: u64,
    /// Set to `record` once the worker has begun overwriting the slot at the
    /// record cursor; cleared when that frame is finalized.
    pub partial: Option<u64>,
    /// Generation whose start left the hardware streams running.
    pub streaming: Option<u64>,
}

impl Cursors {
    fn new() -> Self {
        Self {
            state: StreamState::Stopped,
            requested: StreamState::Stopped,
            record: 0,
            read: 0,
            lease: None,
            xruns: 0,
            overflow: Overflow::Stall,
            fault: None,
            generation: 0,
            partial: None,
            streaming: None,
        }
    }

    pub fn pending(&self) -> u64 {
        debug_assert!(self.read <= self.record);
        self.record - self.read
    }

    /// Oldest cursor whose slot still holds a complete frame in a ring of
    /// `slots`. Under the overwrite policy `read` can fall behind it.
    pub fn oldest_readable(&self, slots: u64) -> u64 {
        let live = if self.partial == Some(self.record) {
            slots.saturating_sub(1)
        } else {
            slots
        };
        self.read.max(self.record.saturating_sub(live))
    }

    /// Complete frames the consumer can still lease.
    pub fn available(&self, slots: u64) -> u64 {
        self.record - self.oldest_readable(slots)
    }

    pub fn reset(&mut self, overflow: Overflow) {
        self.record = 0;
        self.read = 0;
        self.lease = None;
        self.xruns = 0;
        self.fault = None;
        self.overflow = overflow;
        self.partial = None;
        self.generation += 1;
    }
}

/// One mutex plus one condition variable, signaled per finalized frame.
pub(crate) struct Monitor {
    cursors: Mutex<Cursors>,
    changed: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(Cursors::new()),
            changed: Condvar::new(),
        }
    }

    /// Lock the cursors. A panic on another thread never leaves them
    /// half-updated, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for a change notification for at most `timeout`.
    pub fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Cursors>,
        timeout: Duration,
    ) -> MutexGuard<'a, Cursors> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        }
    }

    /// Must be called with the cursors locked to avoid missed wakeups.
    pub fn notify(&self) {
        self.changed.notify_all();
    }
}
