use crate::types::VideoFormat;
use crate::{DepthcamError, Result};
use std::time::Duration;

/// Sleep between headroom checks while the ring is full and the policy is `Stall`.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(2);
/// How long `stop()` waits for the capture thread before detaching it.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(100);
/// Upper bound of a single condition-variable wait inside a blocking grab.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(500);

pub const DEFAULT_NUM_BUFFERS: usize = 2;

/// Timing knobs of the capture worker and the consumer API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub idle_interval: Duration,
    pub stop_grace: Duration,
    pub wait_slice: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle_interval: DEFAULT_IDLE_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
            wait_slice: DEFAULT_WAIT_SLICE,
        }
    }
}

impl Timing {
    /// Defaults, overridden by `DEPTHCAM_IDLE_INTERVAL_MS`, `DEPTHCAM_STOP_GRACE_MS`
    /// and `DEPTHCAM_WAIT_SLICE_MS` when set to a valid integer.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_interval: read_env_millis("DEPTHCAM_IDLE_INTERVAL_MS", defaults.idle_interval),
            stop_grace: read_env_millis("DEPTHCAM_STOP_GRACE_MS", defaults.stop_grace),
            wait_slice: read_env_millis("DEPTHCAM_WAIT_SLICE_MS", defaults.wait_slice),
        }
    }
}

/// Per-session configuration fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Ring size; 2 gives double buffering.
    pub num_buffers: usize,
    pub video_format: VideoFormat,
    pub timing: Timing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_buffers: DEFAULT_NUM_BUFFERS,
            video_format: VideoFormat::default(),
            timing: Timing::from_env(),
        }
    }
}

impl SessionConfig {
    pub fn with_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    pub fn with_video_format(mut self, video_format: VideoFormat) -> Self {
        self.video_format = video_format;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_buffers < 1 {
            return Err(DepthcamError::Configuration(
                "numbuffers must be at least 1".into(),
            ));
        }
        if self.num_buffers == 1 {
            log::warn!("numbuffers=1: capture will stall while a frame is leased");
        }
        if self.timing.wait_slice.is_zero() {
            return Err(DepthcamError::Configuration(
                "wait slice must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

pub(crate) fn read_env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
