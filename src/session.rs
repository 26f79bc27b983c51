use crate::config::SessionConfig;
use crate::context::Registration;
use crate::depth::{self, DepthScratch};
use crate::driver::CaptureDevice;
use crate::monitor::{Monitor, StreamState};
use crate::pool::{FramePool, FrameSlot};
use crate::types::{
    Calibration, CalibrationUpdate, DepthFormat, DepthImage, FrameMode, GlFormat, GlType,
    GrabResult, GrabStatus, Image, ImageKind, Led, Overflow, SessionStatus, StartInfo, WaitMode,
};
use crate::worker::{lock_device, CaptureWorker, Shared, SharedDevice};
use crate::{DepthcamError, Result};
use std::sync::{Arc, Mutex, RwLockReadGuard, TryLockError};
use std::time::Instant;

/// Tilt range of the motor in degrees.
pub const MAX_TILT_DEGREES: i32 = 30;

/// Borrowed pixel memory handed across the C ABI.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PixelView {
    pub ptr: *const std::ffi::c_void,
    /// Size in bytes.
    pub byte_len: usize,
    pub width: u32,
    pub height: u32,
    pub components: u32,
    pub format: u32,
    pub component_type: GlType,
}

/// An open camera with its frame ring and capture worker.
///
/// All methods are meant to be called from one controlling thread; the
/// capture worker runs in the background between [`start`](Session::start)
/// and [`stop`](Session::stop).
pub struct Session {
    index: i32,
    config: SessionConfig,
    depth_mode: FrameMode,
    video_mode: FrameMode,
    shared: Arc<Shared>,
    device: SharedDevice,
    worker: Option<CaptureWorker>,
    calibration: Calibration,
    scratch: DepthScratch,
    false_color: Vec<u8>,
    _registration: Registration,
}

impl Session {
    pub(crate) fn new(
        index: i32,
        config: SessionConfig,
        device: Box<dyn CaptureDevice>,
        epoch: Instant,
        registration: Registration,
    ) -> Result<Session> {
        config.validate()?;
        let depth_mode = device.depth_mode();
        let video_mode = device.video_mode();
        let pool = FramePool::allocate(config.num_buffers, depth_mode, video_mode)?;

        log::info!(
            "Opened device {}: depth {}x{}, video {}x{}x{} ({:?}), {} buffers",
            index,
            depth_mode.width,
            depth_mode.height,
            video_mode.width,
            video_mode.height,
            video_mode.bytes_per_pixel,
            config.video_format,
            config.num_buffers
        );

        Ok(Session {
            index,
            config,
            depth_mode,
            video_mode,
            shared: Arc::new(Shared {
                monitor: Monitor::new(),
                pool,
                epoch,
            }),
            device: Arc::new(Mutex::new(device)),
            worker: None,
            calibration: Calibration::default(),
            scratch: DepthScratch::default(),
            false_color: Vec::new(),
            _registration: registration,
        })
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.monitor.lock().state == StreamState::Running
    }

    /// Start both streams and the capture worker.
    ///
    /// Resets the cursors, the lease and the xrun counter.
    pub fn start(&mut self, overflow: Overflow) -> Result<StartInfo> {
        if self.is_running() {
            return Err(DepthcamError::AlreadyStarted);
        }
        if let Some(mut previous) = self.worker.take() {
            previous.shutdown(self.config.timing.stop_grace);
        }

        let (generation, previous_owner) = {
            let mut cursors = self.shared.monitor.lock();
            cursors.reset(overflow);
            cursors.state = StreamState::Running;
            cursors.requested = StreamState::Running;
            let generation = cursors.generation;
            (generation, cursors.streaming.replace(generation))
        };

        let started = match self.device.try_lock() {
            Ok(mut dev) => dev.start_streams().map(|()| dev.nominal_fps()),
            Err(TryLockError::WouldBlock) => Err(DepthcamError::Hardware(
                "device is still held by a detached capture thread".into(),
            )),
            Err(TryLockError::Poisoned(_)) => {
                Err(DepthcamError::Hardware("capture device lock poisoned".into()))
            }
        };
        let fps = match started {
            Ok(fps) => fps,
            Err(e) => {
                self.abort_start(generation, previous_owner);
                return Err(e);
            }
        };

        match CaptureWorker::spawn(
            self.shared.clone(),
            self.device.clone(),
            generation,
            self.config.timing.idle_interval,
        ) {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                if let Ok(mut dev) = lock_device(&self.device) {
                    let _ = dev.stop_streams();
                }
                self.abort_start(generation, None);
                return Err(e);
            }
        }

        let start_time = self.shared.epoch.elapsed().as_secs_f64();
        log::info!(
            "Capture started on device {} ({:?}, {} fps)",
            self.index,
            overflow,
            fps
        );

        Ok(StartInfo {
            start_time,
            fps,
            color_width: self.video_mode.width,
            color_height: self.video_mode.height,
            depth_width: self.depth_mode.width,
            depth_height: self.depth_mode.height,
        })
    }

    /// Stop capturing. Frames already in the ring stay readable.
    ///
    /// Calling this on a stopped session is a no-op.
    pub fn stop(&mut self) {
        {
            let mut cursors = self.shared.monitor.lock();
            if cursors.state == StreamState::Stopped && self.worker.is_none() {
                return;
            }
            cursors.requested = StreamState::Stopped;
            self.shared.monitor.notify();
        }

        if let Some(mut worker) = self.worker.take() {
            if !worker.shutdown(self.config.timing.stop_grace) {
                log::warn!("Device {}: capture thread detached", self.index);
            }
        }

        // A detached worker never gets to update the state itself.
        let mut cursors = self.shared.monitor.lock();
        if cursors.state == StreamState::Running {
            cursors.generation += 1;
            cursors.state = StreamState::Stopped;
            self.shared.monitor.notify();
        }
        drop(cursors);

        log::info!("Capture stopped on device {}", self.index);
    }

    /// Undo a failed start; `owner` takes the streams back if this start claimed them.
    fn abort_start(&self, generation: u64, owner: Option<u64>) {
        let mut cursors = self.shared.monitor.lock();
        if cursors.streaming == Some(generation) {
            cursors.streaming = owner;
        }
        cursors.state = StreamState::Stopped;
        cursors.requested = StreamState::Stopped;
        self.shared.monitor.notify();
    }

    /// Lease the next frame.
    ///
    /// Frames are leased in capture order. Under the overwrite policy the
    /// frames whose slots have been reused are skipped first. With
    /// `most_recent`, all but the newest pending frame are skipped. A fatal
    /// capture error is reported as [`GrabStatus::Error`] to a waiting caller
    /// and as an `Err` on the following call.
    pub fn grab_frame(&mut self, wait: WaitMode, most_recent: bool) -> Result<GrabResult> {
        let monitor = &self.shared.monitor;
        let slots = self.shared.pool.len() as u64;
        let mut cursors = monitor.lock();

        if cursors.lease.is_some() {
            return Err(DepthcamError::FrameLeased);
        }
        if let Some(fault) = cursors.fault.take() {
            return Err(DepthcamError::Hardware(fault));
        }

        if cursors.available(slots) == 0 {
            if wait == WaitMode::Poll {
                return Ok(GrabResult::empty(GrabStatus::NoFrame));
            }
            if cursors.state != StreamState::Running {
                return Err(DepthcamError::NotStarted);
            }
            while cursors.available(slots) == 0 {
                if cursors.state != StreamState::Running {
                    log::warn!("grab_frame: capture stopped while waiting for a frame");
                    return Ok(GrabResult::empty(GrabStatus::Error));
                }
                cursors = monitor.wait(cursors, self.config.timing.wait_slice);
            }
        }

        let oldest = cursors.oldest_readable(slots);
        if oldest > cursors.read {
            log::trace!("grab_frame: {} overwritten frame(s) skipped", oldest - cursors.read);
            cursors.read = oldest;
        }
        let mut available = cursors.available(slots);
        if most_recent && available > 1 {
            cursors.read += available - 1;
            log::trace!("grab_frame: skipped {} frame(s)", available - 1);
            available = cursors.available(slots);
        }
        let cursor = cursors.read;
        cursors.lease = Some(cursor);
        drop(cursors);

        let timestamp = self.shared.pool.read_slot(cursor).host_time;
        Ok(GrabResult {
            status: GrabStatus::FrameReady,
            timestamp,
            pending: available,
        })
    }

    /// Return the leased frame to the ring.
    pub fn release_frame(&mut self) -> Result<()> {
        let mut cursors = self.shared.monitor.lock();
        if cursors.lease.take().is_none() {
            return Err(DepthcamError::NoFrameLeased);
        }
        cursors.read += 1;
        Ok(())
    }

    fn leased_cursor(&self) -> Result<u64> {
        self.shared
            .monitor
            .lock()
            .lease
            .ok_or(DepthcamError::NoFrameLeased)
    }

    /// Read-only view of the leased frame.
    ///
    /// The capture worker treats the slot as busy while the guard is alive.
    pub fn frame(&self) -> Result<RwLockReadGuard<'_, FrameSlot>> {
        let cursor = self.leased_cursor()?;
        Ok(self.shared.pool.read_slot(cursor))
    }

    /// Copy of the leased color image, or a false-color rendering of its depth.
    pub fn image(&mut self, kind: ImageKind) -> Result<Image> {
        let view = self.image_view(kind)?;
        let slot = self.shared.pool.read_slot(self.leased_cursor()?);
        let pixels = match kind {
            ImageKind::Color => slot.color.clone(),
            ImageKind::FalseColorDepth => self.false_color.clone(),
        };
        Ok(Image {
            pixels,
            width: view.width,
            height: view.height,
            channels: view.components,
            format: if view.components == 3 {
                GlFormat::Rgb8
            } else {
                GlFormat::Luminance8
            },
            component_type: GlType::UnsignedByte,
        })
    }

    /// Like [`image`](Session::image) but without copying. The memory stays
    /// valid until the frame is released or the next image call.
    pub(crate) fn image_view(&mut self, kind: ImageKind) -> Result<PixelView> {
        let cursor = self.leased_cursor()?;
        let slot = self.shared.pool.read_slot(cursor);
        let (ptr, byte_len, width, height, components) = match kind {
            ImageKind::Color => (
                slot.color.as_ptr(),
                slot.color.len(),
                slot.video_mode.width,
                slot.video_mode.height,
                slot.video_mode.bytes_per_pixel,
            ),
            ImageKind::FalseColorDepth => {
                depth::false_color(&slot.depth, &mut self.false_color);
                (
                    self.false_color.as_ptr(),
                    self.false_color.len(),
                    slot.depth_mode.width,
                    slot.depth_mode.height,
                    3,
                )
            }
        };
        let format = if components == 3 {
            GlFormat::Rgb8
        } else {
            GlFormat::Luminance8
        };
        Ok(PixelView {
            ptr: ptr.cast(),
            byte_len,
            width,
            height,
            components,
            format: format as u32,
            component_type: GlType::UnsignedByte,
        })
    }

    /// Convert the leased depth image into `format`.
    pub fn depth_image(&mut self, format: DepthFormat) -> Result<DepthImage> {
        let cursor = self.leased_cursor()?;
        let slot = self.shared.pool.read_slot(cursor);
        self.scratch.render(format, &self.calibration, &slot)?;
        Ok(DepthImage {
            data: self.scratch.to_data(format, &slot),
            width: slot.depth_mode.width,
            height: slot.depth_mode.height,
            components: format.components(),
            component_type: format.component_type(),
        })
    }

    /// Like [`depth_image`](Session::depth_image) but without copying. For
    /// [`DepthFormat::RawU16`] the view points into the leased slot itself.
    pub(crate) fn depth_view(&mut self, format: DepthFormat) -> Result<PixelView> {
        let cursor = self.leased_cursor()?;
        let slot = self.shared.pool.read_slot(cursor);
        self.scratch.render(format, &self.calibration, &slot)?;
        let (ptr, byte_len): (*const std::ffi::c_void, usize) = match format {
            DepthFormat::RawU16 => (
                slot.depth.as_ptr().cast(),
                std::mem::size_of_val(slot.depth.as_slice()),
            ),
            DepthFormat::IndexRaw | DepthFormat::IndexRawUpdate => (
                self.scratch.f32.as_ptr().cast(),
                std::mem::size_of_val(self.scratch.f32.as_slice()),
            ),
            _ => (
                self.scratch.f64.as_ptr().cast(),
                std::mem::size_of_val(self.scratch.f64.as_slice()),
            ),
        };
        Ok(PixelView {
            ptr,
            byte_len,
            width: slot.depth_mode.width,
            height: slot.depth_mode.height,
            components: format.components(),
            format: 0,
            component_type: format.component_type(),
        })
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Replace the fields set in `update` and return the calibration as it
    /// was before. Takes effect with the next depth conversion.
    pub fn set_base_calibration(&mut self, update: CalibrationUpdate) -> Calibration {
        let previous = self.calibration;
        update.apply(&mut self.calibration);
        log::debug!(
            "Device {}: calibration updated, depth model {:?}",
            self.index,
            depth::DepthModel::from_base_and_offset(self.calibration.depth_base_and_offset)
        );
        previous
    }

    pub fn status(&self) -> SessionStatus {
        let cursors = self.shared.monitor.lock();
        SessionStatus {
            running: cursors.state == StreamState::Running,
            read_position: cursors.read,
            record_position: cursors.record,
            pending: cursors.available(self.shared.pool.len() as u64),
            xruns: cursors.xruns,
            frame_leased: cursors.lease.is_some(),
        }
    }

    /// Tilt the sensor head, clamped to ±30 degrees. Returns the applied angle.
    pub fn set_angle(&mut self, degrees: i32) -> Result<i32> {
        let clamped = degrees.clamp(-MAX_TILT_DEGREES, MAX_TILT_DEGREES);
        if clamped != degrees {
            log::debug!("Tilt angle {} clamped to {}", degrees, clamped);
        }
        lock_device(&self.device)?.set_tilt_degrees(clamped as f64)?;
        Ok(clamped)
    }

    pub fn set_led(&mut self, led: Led) -> Result<()> {
        lock_device(&self.device)?.set_led(led)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
        log::info!("Closed device {}", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::context::Context;
    use crate::driver::{Backend, FrameSink};
    use crate::emulated::{Emulator, EmulatorConfig};
    use crate::types::{DepthData, VideoFormat, DEPTH_MODE_11BIT};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn open(buffers: usize) -> (Session, Emulator) {
        Context::new()
            .open_emulated(
                SessionConfig::default().with_buffers(buffers),
                EmulatorConfig::default(),
            )
            .unwrap()
    }

    fn wait_for(session: &Session, what: &str, cond: impl Fn(&SessionStatus) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = session.status();
            if cond(&status) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}: {:?}", what, status);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_for_partial(session: &Session, cursor: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.shared.monitor.lock().partial != Some(cursor) {
            assert!(Instant::now() < deadline, "timed out waiting for partial frame {}", cursor);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// First depth sample and first color byte of the leased frame.
    fn leased_pair(session: &Session) -> (u16, u8) {
        let frame = session.frame().unwrap();
        (frame.depth()[0], frame.color()[0])
    }

    fn first_raw(session: &mut Session) -> f64 {
        match session.depth_image(DepthFormat::Raw).unwrap().data {
            DepthData::F64(v) => v[0],
            other => panic!("unexpected depth data {:?}", other.len()),
        }
    }

    #[test]
    fn test_stall_fills_ring_and_counts_lost_frames() {
        let (mut session, emulator) = open(3);
        session.start(Overflow::Stall).unwrap();
        for i in 0..5 {
            emulator.push_uniform(100 + i, 0).unwrap();
        }

        wait_for(&session, "ring full", |s| s.record_position == 3 && s.xruns == 2);
        std::thread::sleep(Duration::from_millis(30));
        let status = session.status();
        assert_eq!(status.pending, 3);
        assert_eq!(status.xruns, 2);
        assert!(status.read_position <= status.record_position);

        // The three oldest frames are delivered in order.
        for i in 0..3 {
            let grab = session.grab_frame(WaitMode::Poll, false).unwrap();
            assert_eq!(grab.status, GrabStatus::FrameReady);
            assert_eq!(first_raw(&mut session), (100 + i) as f64);
            session.release_frame().unwrap();
        }
    }

    #[test]
    fn test_poll_without_frames_returns_immediately() {
        let (mut session, _emulator) = open(2);
        let before_start = session.grab_frame(WaitMode::Poll, false).unwrap();
        assert_eq!(before_start.status, GrabStatus::NoFrame);
        assert_eq!(before_start.timestamp, -1.0);

        session.start(Overflow::Stall).unwrap();
        let start = Instant::now();
        let grab = session.grab_frame(WaitMode::Poll, false).unwrap();
        assert_eq!(grab.status, GrabStatus::NoFrame);
        assert_eq!(grab.timestamp, -1.0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_release_without_lease_is_state_error() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Stall).unwrap();
        emulator.push_uniform(1, 1).unwrap();
        session.grab_frame(WaitMode::Block, false).unwrap();
        session.release_frame().unwrap();
        let err = session.release_frame().unwrap_err();
        assert!(matches!(err, DepthcamError::NoFrameLeased));
        assert_eq!(err.kind(), crate::ErrorKind::State);
    }

    #[test]
    fn test_grab_while_leased_and_double_start() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Stall).unwrap();
        assert!(matches!(
            session.start(Overflow::Stall).unwrap_err(),
            DepthcamError::AlreadyStarted
        ));
        emulator.push_uniform(1, 1).unwrap();
        emulator.push_uniform(2, 2).unwrap();
        session.grab_frame(WaitMode::Block, false).unwrap();
        assert!(session.status().frame_leased);
        assert!(matches!(
            session.grab_frame(WaitMode::Poll, false).unwrap_err(),
            DepthcamError::FrameLeased
        ));
    }

    #[test]
    fn test_blocking_grab_before_start_is_state_error() {
        let (mut session, _emulator) = open(2);
        let err = session.grab_frame(WaitMode::Block, false).unwrap_err();
        assert!(matches!(err, DepthcamError::NotStarted));
        assert!(matches!(session.image(ImageKind::Color).unwrap_err(), DepthcamError::NoFrameLeased));
    }

    #[test]
    fn test_most_recent_skips_to_newest() {
        let (mut session, emulator) = open(4);
        session.start(Overflow::Stall).unwrap();
        for i in 0..3 {
            emulator.push_uniform(200 + i, 0).unwrap();
        }
        wait_for(&session, "three frames", |s| s.record_position == 3);

        let grab = session.grab_frame(WaitMode::Block, true).unwrap();
        assert_eq!(grab.status, GrabStatus::FrameReady);
        assert_eq!(grab.pending, 1);
        assert_eq!(session.status().read_position, 2);
        assert_eq!(first_raw(&mut session), 202.0);
        session.release_frame().unwrap();
        assert_eq!(session.status().read_position, 3);
    }

    #[test]
    fn test_overwrite_never_stalls() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Overwrite).unwrap();
        for i in 0..5 {
            emulator.push_uniform(i, 0).unwrap();
        }
        wait_for(&session, "five frames", |s| s.record_position == 5);
        let status = session.status();
        assert_eq!(status.xruns, 3);
        assert_eq!(status.pending, 2);
        assert_eq!(status.read_position, 0);
    }

    #[test]
    fn test_overwrite_delivers_in_capture_order() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Overwrite).unwrap();
        for i in 0..5 {
            emulator.push_uniform(100 + i, i as u8).unwrap();
        }
        wait_for(&session, "five frames", |s| s.record_position == 5);

        let mut delivered = Vec::new();
        loop {
            let grab = session.grab_frame(WaitMode::Poll, false).unwrap();
            if grab.status == GrabStatus::NoFrame {
                break;
            }
            assert!(grab.pending <= 2);
            delivered.push((leased_pair(&session), grab.pending));
            session.release_frame().unwrap();
        }
        // The three oldest frames were overwritten; the rest arrive in order.
        assert_eq!(delivered, vec![((103, 3), 2), ((104, 4), 1)]);
        assert_eq!(session.status().read_position, 5);
    }

    #[test]
    fn test_half_written_slot_is_never_leased() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Overwrite).unwrap();
        emulator.push_uniform(1, 1).unwrap();
        emulator.push_uniform(2, 2).unwrap();
        wait_for(&session, "two frames", |s| s.record_position == 2);

        // Depth of frame 3 lands in the slot of frame 1 before its color does.
        emulator.push_depth(3).unwrap();
        wait_for_partial(&session, 2);
        assert_eq!(session.status().pending, 1);

        let grab = session.grab_frame(WaitMode::Poll, false).unwrap();
        assert_eq!(grab.status, GrabStatus::FrameReady);
        assert_eq!(grab.pending, 1);
        assert_eq!(leased_pair(&session), (2, 2));
        assert_eq!(session.status().read_position, 1);

        emulator.push_color(3).unwrap();
        wait_for(&session, "frame 3 finalized", |s| s.record_position == 3);
        assert_eq!(session.status().xruns, 1);
        assert_eq!(leased_pair(&session), (2, 2));

        session.release_frame().unwrap();
        let grab = session.grab_frame(WaitMode::Poll, false).unwrap();
        assert_eq!(grab.status, GrabStatus::FrameReady);
        assert_eq!(leased_pair(&session), (3, 3));
    }

    #[test]
    fn test_frame_split_by_lease_is_dropped_whole() {
        let (mut session, emulator) = open(1);
        session.start(Overflow::Overwrite).unwrap();
        emulator.push_uniform(5, 5).unwrap();
        session.grab_frame(WaitMode::Block, false).unwrap();

        // The depth half hits the leased slot, the color half arrives after release.
        emulator.push_depth(6).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        session.release_frame().unwrap();
        emulator.push_color(6).unwrap();

        wait_for(&session, "dropped frame", |s| s.xruns == 1);
        std::thread::sleep(Duration::from_millis(30));
        let status = session.status();
        assert_eq!(status.record_position, 1);
        assert_eq!(status.pending, 0);
        assert_eq!(
            session.grab_frame(WaitMode::Poll, false).unwrap().status,
            GrabStatus::NoFrame
        );
    }

    /// Blocks in its first event round far longer than the stop grace.
    struct StuckDevice {
        stuck: Arc<AtomicBool>,
        stops: Arc<AtomicUsize>,
    }

    impl CaptureDevice for StuckDevice {
        fn depth_mode(&self) -> FrameMode {
            DEPTH_MODE_11BIT
        }

        fn video_mode(&self) -> FrameMode {
            FrameMode::new(640, 480, 3)
        }

        fn start_streams(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop_streams(&mut self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn process_events(&mut self, _sink: &mut dyn FrameSink) -> Result<()> {
            if self.stuck.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
            } else {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }
    }

    struct StuckBackend {
        stuck: Arc<AtomicBool>,
        stops: Arc<AtomicUsize>,
    }

    impl Backend for StuckBackend {
        fn device_count(&self) -> Result<usize> {
            Ok(1)
        }

        fn open(&self, _index: usize, _video_format: VideoFormat) -> Result<Box<dyn CaptureDevice>> {
            Ok(Box::new(StuckDevice {
                stuck: self.stuck.clone(),
                stops: self.stops.clone(),
            }))
        }
    }

    #[test]
    fn test_detached_worker_still_halts_streams() {
        let stuck = Arc::new(AtomicBool::new(true));
        let stops = Arc::new(AtomicUsize::new(0));
        let ctx = Context::with_backend(Arc::new(StuckBackend {
            stuck: stuck.clone(),
            stops: stops.clone(),
        }));
        let timing = Timing {
            stop_grace: Duration::from_millis(50),
            ..Timing::default()
        };
        let mut session = ctx
            .open(0, SessionConfig::default().with_timing(timing))
            .unwrap();

        session.start(Overflow::Stall).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        session.stop();
        assert!(!session.status().running);
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        // The stuck thread still holds the device.
        let err = session.start(Overflow::Stall).unwrap_err();
        assert!(matches!(err, DepthcamError::Hardware(_)));
        assert!(!session.status().running);

        let deadline = Instant::now() + Duration::from_secs(5);
        while stops.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "detached worker never stopped the streams");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        session.start(Overflow::Stall).unwrap();
        assert!(session.is_running());
        session.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(!stuck.load(Ordering::SeqCst));
    }

    #[test]
    fn test_leased_slot_is_never_overwritten() {
        let (mut session, emulator) = open(1);
        session.start(Overflow::Overwrite).unwrap();
        emulator.push_uniform(300, 0).unwrap();
        session.grab_frame(WaitMode::Block, false).unwrap();

        emulator.push_uniform(400, 0).unwrap();
        wait_for(&session, "dropped frame", |s| s.xruns == 1);
        assert_eq!(session.status().record_position, 1);
        assert_eq!(first_raw(&mut session), 300.0);

        session.release_frame().unwrap();
        assert_eq!(session.status().pending, 0);
    }

    #[test]
    fn test_blocking_grab_wakes_on_frame() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Stall).unwrap();
        let pusher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            emulator.push_uniform(7, 7).unwrap();
            emulator
        });

        let grab = session.grab_frame(WaitMode::Block, false).unwrap();
        assert_eq!(grab.status, GrabStatus::FrameReady);
        assert!(grab.timestamp > 0.0);
        assert_eq!(grab.pending, 1);
        pusher.join().unwrap();
    }

    #[test]
    fn test_device_failure_surfaces_once() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Stall).unwrap();
        let failer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            emulator.fail("transfer stalled").unwrap();
            emulator
        });

        let grab = session.grab_frame(WaitMode::Block, false).unwrap();
        assert_eq!(grab.status, GrabStatus::Error);
        assert!(!session.status().running);

        let err = session.grab_frame(WaitMode::Block, false).unwrap_err();
        assert!(matches!(err, DepthcamError::Hardware(ref m) if m == "transfer stalled"));
        assert!(matches!(
            session.grab_frame(WaitMode::Block, false).unwrap_err(),
            DepthcamError::NotStarted
        ));
        failer.join().unwrap();
    }

    #[test]
    fn test_frames_drain_after_stop_and_restart_resets() {
        let (mut session, emulator) = open(3);
        session.start(Overflow::Stall).unwrap();
        emulator.push_uniform(1, 0).unwrap();
        emulator.push_uniform(2, 0).unwrap();
        wait_for(&session, "two frames", |s| s.record_position == 2);
        session.stop();
        session.stop();
        assert!(!session.status().running);

        let grab = session.grab_frame(WaitMode::Poll, false).unwrap();
        assert_eq!(grab.status, GrabStatus::FrameReady);
        assert_eq!(grab.pending, 2);
        session.release_frame().unwrap();

        session.start(Overflow::Stall).unwrap();
        let status = session.status();
        assert_eq!((status.record_position, status.read_position, status.xruns), (0, 0, 0));
        emulator.push_uniform(3, 0).unwrap();
        wait_for(&session, "restart frame", |s| s.record_position == 1);
    }

    #[test]
    fn test_timestamps_increase() {
        let (mut session, emulator) = open(2);
        let info = session.start(Overflow::Stall).unwrap();
        assert_eq!(info.fps, 30.0);
        assert_eq!((info.depth_width, info.depth_height), (640, 480));
        assert_eq!((info.color_width, info.color_height), (640, 480));

        emulator.push_uniform(1, 0).unwrap();
        let first = session.grab_frame(WaitMode::Block, false).unwrap().timestamp;
        session.release_frame().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        emulator.push_uniform(2, 0).unwrap();
        let second = session.grab_frame(WaitMode::Block, false).unwrap().timestamp;
        assert!(first >= info.start_time);
        assert!(second > first);
        assert_eq!(session.frame().unwrap().host_time(), second);
    }

    #[test]
    fn test_images() {
        let (mut session, emulator) = Context::new()
            .open_emulated(
                SessionConfig::default().with_video_format(VideoFormat::Bayer),
                EmulatorConfig::default(),
            )
            .unwrap();
        session.start(Overflow::Stall).unwrap();
        emulator.push_uniform(0, 9).unwrap();
        session.grab_frame(WaitMode::Block, false).unwrap();

        let color = session.image(ImageKind::Color).unwrap();
        assert_eq!((color.width, color.height, color.channels), (640, 480, 1));
        assert_eq!(color.format, GlFormat::Luminance8);
        assert!(color.pixels.iter().all(|&p| p == 9));

        let false_color = session.image(ImageKind::FalseColorDepth).unwrap();
        assert_eq!(false_color.channels, 3);
        assert_eq!(false_color.format, GlFormat::Rgb8);
        assert_eq!(false_color.pixels.len(), 640 * 480 * 3);
        assert_eq!(&false_color.pixels[..3], &[255, 255, 255]);

        let raw = session.depth_image(DepthFormat::RawU16).unwrap();
        assert_eq!(raw.component_type, GlType::UnsignedShort);
        assert_eq!(raw.data, DepthData::U16(vec![0; 640 * 480]));
    }

    #[test]
    fn test_calibration_changes_depth_model() {
        let (mut session, emulator) = open(2);
        session.start(Overflow::Stall).unwrap();
        emulator.push_uniform(90, 0).unwrap();
        session.grab_frame(WaitMode::Block, false).unwrap();

        let previous = session.set_base_calibration(CalibrationUpdate {
            depth_base_and_offset: Some([0.075, 1090.0]),
            ..Default::default()
        });
        assert_eq!(previous, Calibration::default());
        assert_eq!(session.calibration().depth_base_and_offset, [0.075, 1090.0]);

        let metric = session.depth_image(DepthFormat::Metric).unwrap();
        assert_eq!(metric.components, 1);
        match metric.data {
            DepthData::F64(v) => assert!((v[0] - 540.0 * 8.0 * 0.075 / 1000.0).abs() < 1e-12),
            other => panic!("unexpected depth data of {} values", other.len()),
        }
    }

    #[test]
    fn test_set_angle_is_clamped() {
        let (mut session, emulator) = open(2);
        assert_eq!(session.set_angle(45).unwrap(), 30);
        assert_eq!(emulator.tilt_degrees(), Some(30.0));
        assert_eq!(session.set_angle(-12).unwrap(), -12);
        assert_eq!(emulator.tilt_degrees(), Some(-12.0));
        session.set_led(Led::BlinkGreen).unwrap();
        assert_eq!(emulator.led(), Some(Led::BlinkGreen));
    }
}
