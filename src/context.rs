use crate::config::SessionConfig;
use crate::driver::Backend;
use crate::emulated::{self, Emulator, EmulatorConfig};
use crate::session::Session;
use crate::{DepthcamError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Device index that opens the built-in free-running emulated camera.
pub const EMULATED_DEVICE_INDEX: i32 = -1;

/// Frame rate of the emulated camera behind [`EMULATED_DEVICE_INDEX`].
pub const EMULATED_FPS: f64 = 30.0;

/// Counts a session against its context's limit until dropped.
pub(crate) struct Registration {
    open: Arc<AtomicUsize>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Entry point: owns the clock all timestamps are measured on and the
/// driver used to open hardware devices.
pub struct Context {
    backend: Option<Arc<dyn Backend>>,
    epoch: Instant,
    open_sessions: Arc<AtomicUsize>,
    max_sessions: Option<usize>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A context without a hardware driver; only the emulated device can be opened.
    pub fn new() -> Self {
        Self {
            backend: None,
            epoch: Instant::now(),
            open_sessions: Arc::new(AtomicUsize::new(0)),
            max_sessions: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    /// Cap the number of sessions open at the same time.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Seconds since the context was created, on the same clock as frame timestamps.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Number of hardware devices the driver can see.
    pub fn device_count(&self) -> Result<usize> {
        match &self.backend {
            Some(backend) => backend.device_count(),
            None => Ok(0),
        }
    }

    fn register(&self) -> Result<Registration> {
        let max = self.max_sessions.unwrap_or(usize::MAX);
        self.open_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| DepthcamError::TooManySessions(max))?;
        Ok(Registration {
            open: self.open_sessions.clone(),
        })
    }

    /// Open device `index`, or the emulated camera for [`EMULATED_DEVICE_INDEX`].
    pub fn open(&self, index: i32, config: SessionConfig) -> Result<Session> {
        config.validate()?;
        if index < EMULATED_DEVICE_INDEX {
            return Err(DepthcamError::Configuration(format!(
                "deviceIndex {} is invalid",
                index
            )));
        }
        let registration = self.register()?;

        if index == EMULATED_DEVICE_INDEX {
            let (device, _emulator) =
                emulated::emulated(EmulatorConfig::free_run(EMULATED_FPS), config.video_format)?;
            return Session::new(index, config, Box::new(device), self.epoch, registration);
        }

        let backend = self
            .backend
            .as_ref()
            .ok_or(DepthcamError::DeviceNotFound(index))?;
        let count = backend.device_count()?;
        if index as usize >= count {
            log::warn!("Device {} requested, {} available", index, count);
            return Err(DepthcamError::DeviceNotFound(index));
        }
        let device = backend.open(index as usize, config.video_format)?;
        Session::new(index, config, device, self.epoch, registration)
    }

    /// Open an emulated camera and return the handle that drives it.
    pub fn open_emulated(
        &self,
        config: SessionConfig,
        emulator: EmulatorConfig,
    ) -> Result<(Session, Emulator)> {
        config.validate()?;
        let registration = self.register()?;
        let (device, handle) = emulated::emulated(emulator, config.video_format)?;
        let session = Session::new(
            EMULATED_DEVICE_INDEX,
            config,
            Box::new(device),
            self.epoch,
            registration,
        )?;
        Ok((session, handle))
    }
}
