//! Capability interfaces between the capture pipeline and a hardware driver.
//!
//! A driver implements [`Backend`] to open devices and [`CaptureDevice`] to
//! stream from one. The capture worker passes itself to
//! [`CaptureDevice::process_events`] as a [`FrameSink`]; the driver calls back
//! into it whenever a depth or color image has been received.

use crate::types::{FrameMode, Led, VideoFormat};
use crate::{DepthcamError, Result};

/// Readiness callbacks invoked by a driver from inside `process_events`.
///
/// Implementations never block: they copy the data into the in-progress ring
/// slot or drop it.
pub trait FrameSink {
    /// A complete depth image; `data` holds one 16-bit disparity value per pixel.
    fn on_depth(&mut self, data: &[u16], timestamp: u32);

    /// A complete color (or IR) image in the negotiated video format.
    fn on_video(&mut self, data: &[u8], timestamp: u32);
}

/// One opened camera.
pub trait CaptureDevice: Send {
    fn depth_mode(&self) -> FrameMode;

    fn video_mode(&self) -> FrameMode;

    /// Nominal frame rate of the negotiated modes.
    fn nominal_fps(&self) -> f64 {
        30.0
    }

    /// Begin both the depth and the video stream.
    fn start_streams(&mut self) -> Result<()>;

    fn stop_streams(&mut self) -> Result<()>;

    /// Handle pending hardware events, delivering zero or more images to `sink`.
    ///
    /// Must return within a bounded time even when nothing arrives. An error
    /// is treated as fatal and stops the capture.
    fn process_events(&mut self, sink: &mut dyn FrameSink) -> Result<()>;

    /// Called once per idle cycle while the ring is full under the stall policy.
    ///
    /// Returns how many frames the hardware lost meanwhile. Drivers that cannot
    /// tell report one lost frame per cycle.
    fn discard_pending(&mut self) -> Result<u64> {
        Ok(1)
    }

    /// Tilt the sensor head; `degrees` is already clamped to ±30.
    fn set_tilt_degrees(&mut self, _degrees: f64) -> Result<()> {
        Err(DepthcamError::Unsupported)
    }

    fn set_led(&mut self, _led: Led) -> Result<()> {
        Err(DepthcamError::Unsupported)
    }
}

/// Opens devices by index.
pub trait Backend: Send + Sync {
    fn device_count(&self) -> Result<usize>;

    /// Open device `index` with its depth stream in 11-bit mode and its video
    /// stream in `video_format`.
    fn open(&self, index: usize, video_format: VideoFormat) -> Result<Box<dyn CaptureDevice>>;
}
