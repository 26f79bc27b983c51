//! Software camera used for `deviceIndex = -1` and for tests.
//!
//! In [`Pacing::Manual`] mode frames only appear when pushed through the
//! paired [`Emulator`] handle, which makes ring behavior deterministic. In
//! [`Pacing::FreeRun`] mode the device synthesizes a moving test pattern at
//! a fixed rate, like a real sensor would.

use crate::driver::{CaptureDevice, FrameSink};
use crate::types::{FrameMode, Led, VideoFormat, DEPTH_MODE_11BIT};
use crate::{DepthcamError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Longest single wait inside `process_events`.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Driver ticks per frame at 30 Hz on a 60 MHz clock.
const TICKS_PER_FRAME: u32 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Frames are delivered only when pushed through [`Emulator`].
    Manual,
    /// Synthetic frames at `fps`.
    FreeRun { fps: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmulatorConfig {
    pub pacing: Pacing,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::Manual,
        }
    }
}

impl EmulatorConfig {
    pub fn free_run(fps: f64) -> Self {
        Self {
            pacing: Pacing::FreeRun { fps },
        }
    }
}

enum Event {
    Frame {
        depth: Vec<u16>,
        color: Vec<u8>,
    },
    /// Only the depth half of a frame; the color half follows separately.
    Depth(Vec<u16>),
    Color(Vec<u8>),
    Fail(String),
}

#[derive(Debug, Default)]
struct Actuators {
    tilt: Option<f64>,
    led: Option<Led>,
}

/// Color plane geometry the emulator negotiates for `format`.
pub fn video_mode_for(format: VideoFormat) -> FrameMode {
    match format {
        VideoFormat::Rgb => FrameMode::new(640, 480, 3),
        VideoFormat::Bayer => FrameMode::new(640, 480, 1),
        // The IR camera has eight more rows than the color sensor.
        VideoFormat::Ir => FrameMode::new(640, 488, 1),
    }
}

/// Create a connected device/handle pair.
pub fn emulated(
    config: EmulatorConfig,
    video_format: VideoFormat,
) -> Result<(EmulatedDevice, Emulator)> {
    if let Pacing::FreeRun { fps } = config.pacing {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(DepthcamError::Configuration(format!(
                "emulator frame rate must be positive, got {}",
                fps
            )));
        }
    }

    let (sender, receiver) = crossbeam_channel::unbounded();
    let actuators = Arc::new(Mutex::new(Actuators::default()));
    let video_mode = video_mode_for(video_format);

    let device = EmulatedDevice {
        receiver,
        pacing: config.pacing,
        video_mode,
        streaming: false,
        tick: 0,
        frame_number: 0,
        next_deadline: None,
        actuators: actuators.clone(),
    };
    let emulator = Emulator {
        sender,
        video_mode,
        actuators,
    };
    Ok((device, emulator))
}

/// The [`CaptureDevice`] half of the emulator.
pub struct EmulatedDevice {
    receiver: Receiver<Event>,
    pacing: Pacing,
    video_mode: FrameMode,
    streaming: bool,
    tick: u32,
    frame_number: u32,
    next_deadline: Option<Instant>,
    actuators: Arc<Mutex<Actuators>>,
}

impl EmulatedDevice {
    fn period(&self) -> Option<Duration> {
        match self.pacing {
            Pacing::Manual => None,
            Pacing::FreeRun { fps } => Some(Duration::from_secs_f64(1.0 / fps)),
        }
    }

    fn deliver(&mut self, depth: &[u16], color: &[u8], sink: &mut dyn FrameSink) {
        self.tick = self.tick.wrapping_add(TICKS_PER_FRAME);
        self.frame_number = self.frame_number.wrapping_add(1);
        sink.on_depth(depth, self.tick);
        sink.on_video(color, self.tick);
    }

    /// Hand one event to `sink`. Returns `Err` for an injected fault.
    fn dispatch(&mut self, event: Event, sink: &mut dyn FrameSink) -> Result<()> {
        match event {
            Event::Frame { depth, color } => self.deliver(&depth, &color, sink),
            Event::Depth(depth) => {
                self.tick = self.tick.wrapping_add(TICKS_PER_FRAME);
                self.frame_number = self.frame_number.wrapping_add(1);
                sink.on_depth(&depth, self.tick);
            }
            Event::Color(color) => sink.on_video(&color, self.tick),
            Event::Fail(msg) => return Err(DepthcamError::Hardware(msg)),
        }
        Ok(())
    }

    fn synthesize(&self) -> (Vec<u16>, Vec<u8>) {
        let (w, h) = (DEPTH_MODE_11BIT.width, DEPTH_MODE_11BIT.height);
        let phase = self.frame_number;
        let mut depth = Vec::with_capacity(DEPTH_MODE_11BIT.pixel_count());
        for y in 0..h {
            for x in 0..w {
                // A sweeping ramp with an invalid border column.
                let raw = if x < 8 {
                    crate::depth::RAW_INVALID
                } else {
                    (400 + (x + y).wrapping_add(phase.wrapping_mul(4)) % 600) as u16
                };
                depth.push(raw);
            }
        }

        let mode = self.video_mode;
        let bpp = mode.bytes_per_pixel as usize;
        let mut color = Vec::with_capacity(mode.pixel_count() * bpp);
        for y in 0..mode.height {
            for x in 0..mode.width {
                let r = (x.wrapping_add(phase) % 256) as u8;
                let g = (y % 256) as u8;
                if bpp >= 3 {
                    color.extend_from_slice(&[r, g, 128]);
                } else {
                    color.push(r ^ g);
                }
            }
        }
        (depth, color)
    }

    fn process_manual(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        match self.receiver.recv_timeout(POLL_TIMEOUT) {
            Ok(event) => self.dispatch(event, sink),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(POLL_TIMEOUT);
                Ok(())
            }
        }
    }

    fn process_free_run(&mut self, period: Duration, sink: &mut dyn FrameSink) -> Result<()> {
        match self.receiver.try_recv() {
            Ok(event) => {
                self.dispatch(event, sink)?;
                self.next_deadline = Some(Instant::now() + period);
                return Ok(());
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        let deadline = *self.next_deadline.get_or_insert_with(Instant::now);
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep((deadline - now).min(POLL_TIMEOUT));
            if Instant::now() < deadline {
                return Ok(());
            }
        }

        let (depth, color) = self.synthesize();
        self.deliver(&depth, &color, sink);
        self.next_deadline = Some(deadline + period);
        Ok(())
    }
}

impl CaptureDevice for EmulatedDevice {
    fn depth_mode(&self) -> FrameMode {
        DEPTH_MODE_11BIT
    }

    fn video_mode(&self) -> FrameMode {
        self.video_mode
    }

    fn nominal_fps(&self) -> f64 {
        match self.pacing {
            Pacing::FreeRun { fps } => fps,
            Pacing::Manual => 30.0,
        }
    }

    fn start_streams(&mut self) -> Result<()> {
        // Anything queued while stopped is stale.
        let stale = self.receiver.try_iter().count();
        if stale > 0 {
            log::debug!("Emulator discarded {} event(s) queued before start", stale);
        }
        self.streaming = true;
        self.next_deadline = None;
        log::info!("Emulated streams started ({:?})", self.pacing);
        Ok(())
    }

    fn stop_streams(&mut self) -> Result<()> {
        self.streaming = false;
        log::info!("Emulated streams stopped");
        Ok(())
    }

    fn process_events(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        if !self.streaming {
            std::thread::sleep(POLL_TIMEOUT);
            return Ok(());
        }
        match self.period() {
            None => self.process_manual(sink),
            Some(period) => self.process_free_run(period, sink),
        }
    }

    /// Manual pacing drops queued frames; free-running pacing skips the
    /// deadlines that passed.
    fn discard_pending(&mut self) -> Result<u64> {
        if !self.streaming {
            return Ok(0);
        }
        match self.period() {
            None => {
                let mut lost = 0;
                loop {
                    match self.receiver.try_recv() {
                        Ok(Event::Frame { .. }) | Ok(Event::Depth(_)) => lost += 1,
                        Ok(Event::Color(_)) => {}
                        Ok(Event::Fail(msg)) => return Err(DepthcamError::Hardware(msg)),
                        Err(_) => break,
                    }
                }
                Ok(lost)
            }
            Some(period) => {
                let now = Instant::now();
                let Some(mut deadline) = self.next_deadline else {
                    return Ok(0);
                };
                let mut lost = 0;
                while deadline <= now {
                    deadline += period;
                    lost += 1;
                }
                self.next_deadline = Some(deadline);
                Ok(lost)
            }
        }
    }

    fn set_tilt_degrees(&mut self, degrees: f64) -> Result<()> {
        self.actuators.lock().unwrap_or_else(|e| e.into_inner()).tilt = Some(degrees);
        Ok(())
    }

    fn set_led(&mut self, led: Led) -> Result<()> {
        self.actuators.lock().unwrap_or_else(|e| e.into_inner()).led = Some(led);
        Ok(())
    }
}

/// Controller for an [`EmulatedDevice`]: feeds frames and injects faults.
#[derive(Clone)]
pub struct Emulator {
    sender: Sender<Event>,
    video_mode: FrameMode,
    actuators: Arc<Mutex<Actuators>>,
}

impl Emulator {
    pub fn depth_mode(&self) -> FrameMode {
        DEPTH_MODE_11BIT
    }

    pub fn video_mode(&self) -> FrameMode {
        self.video_mode
    }

    /// Queue one frame. Planes of the wrong size are truncated or zero-padded
    /// on delivery.
    pub fn push_frame(&self, depth: Vec<u16>, color: Vec<u8>) -> Result<()> {
        self.send(Event::Frame { depth, color })
    }

    /// Queue a frame with every depth sample set to `raw` and every color byte to `value`.
    pub fn push_uniform(&self, raw: u16, value: u8) -> Result<()> {
        let depth = vec![raw; DEPTH_MODE_11BIT.pixel_count()];
        let color = vec![value; self.video_mode.byte_size().unwrap_or(0)];
        self.push_frame(depth, color)
    }

    /// Queue only the depth half of a frame, every sample set to `raw`. The
    /// device delivers it in its own event-processing round.
    pub fn push_depth(&self, raw: u16) -> Result<()> {
        self.send(Event::Depth(vec![raw; DEPTH_MODE_11BIT.pixel_count()]))
    }

    /// Queue only the color half of a frame, every byte set to `value`.
    pub fn push_color(&self, value: u8) -> Result<()> {
        self.send(Event::Color(vec![value; self.video_mode.byte_size().unwrap_or(0)]))
    }

    fn send(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| DepthcamError::Hardware("emulated device is gone".into()))
    }

    /// Make the next event-processing round fail with `msg`.
    pub fn fail(&self, msg: impl Into<String>) -> Result<()> {
        self.send(Event::Fail(msg.into()))
    }

    /// Last tilt angle applied to the device.
    pub fn tilt_degrees(&self) -> Option<f64> {
        self.actuators.lock().unwrap_or_else(|e| e.into_inner()).tilt
    }

    pub fn led(&self) -> Option<Led> {
        self.actuators.lock().unwrap_or_else(|e| e.into_inner()).led
    }
}
