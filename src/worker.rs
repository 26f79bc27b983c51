use crate::driver::{CaptureDevice, FrameSink};
use crate::monitor::{Monitor, StreamState};
use crate::pool::{FramePool, FrameSlot};
use crate::types::Overflow;
use crate::{DepthcamError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// State shared between a session and its capture worker.
pub(crate) struct Shared {
    pub monitor: Monitor,
    pub pool: FramePool,
    /// Clock origin for host timestamps.
    pub epoch: Instant,
}

pub(crate) type SharedDevice = Arc<Mutex<Box<dyn CaptureDevice>>>;

pub(crate) fn lock_device(device: &SharedDevice) -> Result<MutexGuard<'_, Box<dyn CaptureDevice>>> {
    device
        .lock()
        .map_err(|_| DepthcamError::Hardware("capture device lock poisoned".into()))
}

bitflags::bitflags! {
    /// Which halves of the in-progress frame have been handled this cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Parts: u8 {
        const DEPTH = 1 << 0;
        const COLOR = 1 << 1;
    }
}

enum Claim<'a> {
    Write(RwLockWriteGuard<'a, FrameSlot>),
    /// Slot is leased or being read; the frame is lost.
    Busy,
    /// Capture is shutting down or superseded.
    Ignore,
}

/// The worker's [`FrameSink`]: copies images into the slot at the record cursor.
struct SlotWriter<'a> {
    shared: &'a Shared,
    generation: u64,
    received: Parts,
    skipped: Parts,
}

impl<'a> SlotWriter<'a> {
    fn new(shared: &'a Shared, generation: u64) -> Self {
        Self {
            shared,
            generation,
            received: Parts::empty(),
            skipped: Parts::empty(),
        }
    }

    fn settled(&self) -> Parts {
        self.received | self.skipped
    }

    fn claim(&self) -> Claim<'a> {
        let shared: &'a Shared = self.shared;
        let mut cursors = shared.monitor.lock();
        if cursors.generation != self.generation || cursors.requested != StreamState::Running {
            return Claim::Ignore;
        }
        let target = shared.pool.index(cursors.record);
        if cursors.lease.map(|leased| shared.pool.index(leased)) == Some(target) {
            return Claim::Busy;
        }
        let Ok(slot) = shared.pool.slot(cursors.record).try_write() else {
            return Claim::Busy;
        };
        if cursors.partial != Some(cursors.record) {
            // Overwrite policy: the oldest unread frame is being replaced.
            if cursors.pending() >= shared.pool.len() as u64 {
                cursors.xruns += 1;
            }
            cursors.partial = Some(cursors.record);
        }
        Claim::Write(slot)
    }

    /// Finalize the in-progress frame once both parts have been handled.
    fn finish_round(&mut self) {
        if self.settled() != Parts::all() {
            return;
        }

        let mut cursors = self.shared.monitor.lock();
        if cursors.generation != self.generation {
            // Superseded by a restart; the cursors belong to the new worker.
        } else if !self.skipped.is_empty() {
            cursors.xruns += 1;
            log::warn!("Frame {} dropped: target slot is leased", cursors.record);
        } else {
            cursors.record += 1;
            cursors.partial = None;
            self.shared.monitor.notify();
        }
        drop(cursors);

        self.received = Parts::empty();
        self.skipped = Parts::empty();
    }
}

impl FrameSink for SlotWriter<'_> {
    fn on_depth(&mut self, data: &[u16], _timestamp: u32) {
        if self.settled().contains(Parts::DEPTH) {
            return;
        }
        if !self.skipped.is_empty() {
            // The other half was dropped; never complete a torn frame.
            self.skipped |= Parts::DEPTH;
            return;
        }
        match self.claim() {
            Claim::Write(mut slot) => {
                slot.write_depth(data);
                self.received |= Parts::DEPTH;
            }
            Claim::Busy => self.skipped |= Parts::DEPTH,
            Claim::Ignore => {}
        }
    }

    fn on_video(&mut self, data: &[u8], timestamp: u32) {
        if self.settled().contains(Parts::COLOR) {
            return;
        }
        if !self.skipped.is_empty() {
            self.skipped |= Parts::COLOR;
            return;
        }
        match self.claim() {
            Claim::Write(mut slot) => {
                let host_time = self.shared.epoch.elapsed().as_secs_f64();
                slot.write_color(data, host_time, timestamp);
                self.received |= Parts::COLOR;
            }
            Claim::Busy => self.skipped |= Parts::COLOR,
            Claim::Ignore => {}
        }
    }
}

/// Handle to the background capture thread of one session.
///
/// The thread drives the device's event processing and fills the frame pool
/// until the session requests a stop or the device fails.
pub(crate) struct CaptureWorker {
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureWorker {
    /// Spawn the capture thread. The caller has already set the cursors to
    /// `Running` for `generation` and started the device streams.
    pub fn spawn(
        shared: Arc<Shared>,
        device: SharedDevice,
        generation: u64,
        idle_interval: Duration,
    ) -> Result<CaptureWorker> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name("depthcam-capture".into())
            .spawn(move || {
                capture_loop(&shared, &device, &stop_clone, generation, idle_interval);
            })
            .map_err(|e| DepthcamError::Hardware(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(CaptureWorker {
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait up to `grace` for it to exit.
    ///
    /// Returns `false` if the thread had to be detached.
    pub fn shutdown(&mut self, grace: Duration) -> bool {
        self.stop_flag.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + grace;
        while !thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        if thread.is_finished() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
            true
        } else {
            log::warn!(
                "Capture thread still busy after {:?}, detaching it",
                grace
            );
            false
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown(crate::config::DEFAULT_STOP_GRACE);
    }
}

fn capture_loop(
    shared: &Shared,
    device: &SharedDevice,
    stop_flag: &AtomicBool,
    generation: u64,
    idle_interval: Duration,
) {
    let n = shared.pool.len() as u64;
    let mut writer = SlotWriter::new(shared, generation);

    log::info!("Capture worker started ({} slots)", n);

    loop {
        if stop_flag.load(Ordering::Acquire) {
            log::info!("Capture worker stopping (stop flag set)");
            break;
        }

        let accept = {
            let cursors = shared.monitor.lock();
            if cursors.generation != generation || cursors.requested != StreamState::Running {
                log::info!("Capture worker stopping (stop requested)");
                break;
            }
            cursors.pending() < n || cursors.overflow == Overflow::Overwrite
        };

        let round = if accept {
            lock_device(device).and_then(|mut dev| dev.process_events(&mut writer))
        } else {
            // Ring full under the stall policy: idle until the consumer catches up.
            std::thread::sleep(idle_interval);
            lock_device(device)
                .and_then(|mut dev| dev.discard_pending())
                .map(|lost| {
                    if lost > 0 {
                        shared.monitor.lock().xruns += lost;
                        log::trace!("Ring full, {} frame(s) lost", lost);
                    }
                })
        };

        match round {
            Ok(()) => writer.finish_round(),
            Err(e) => {
                log::error!("Capture aborted: {}", e);
                let mut cursors = shared.monitor.lock();
                if cursors.generation == generation {
                    cursors.fault = Some(e.to_string());
                }
                break;
            }
        }
    }

    let mut cursors = shared.monitor.lock();
    // A detached worker still owns the streams unless a newer start took them over.
    if cursors.streaming == Some(generation) {
        if let Err(e) = lock_device(device).and_then(|mut dev| dev.stop_streams()) {
            log::warn!("Failed to stop device streams: {}", e);
        }
        cursors.streaming = None;
    }
    if cursors.generation == generation {
        cursors.state = StreamState::Stopped;
        cursors.requested = StreamState::Stopped;
        shared.monitor.notify();
    }
    drop(cursors);

    log::info!("Capture worker exited");
}
