use std::fmt;

/// Errors that can occur when operating a capture session.
#[derive(Debug, thiserror::Error)]
pub enum DepthcamError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Device {0} not found")]
    DeviceNotFound(i32),

    #[error("Capture already started")]
    AlreadyStarted,

    #[error("Capture not started: call start() before a blocking grab_frame()")]
    NotStarted,

    #[error("A frame is still leased: release_frame() it before grabbing another")]
    FrameLeased,

    #[error("No frame leased: grab_frame() first")]
    NoFrameLeased,

    #[error("Maximum number of concurrent sessions ({0}) reached")]
    TooManySessions(usize),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Buffer allocation failed: {0}")]
    Resource(String),

    #[error("Operation not supported by this device")]
    Unsupported,
}

/// Coarse classification of [`DepthcamError`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration = 1,
    State = 2,
    Hardware = 3,
    Resource = 4,
}

impl DepthcamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DepthcamError::Configuration(_) => ErrorKind::Configuration,
            DepthcamError::AlreadyStarted
            | DepthcamError::NotStarted
            | DepthcamError::FrameLeased
            | DepthcamError::NoFrameLeased
            | DepthcamError::TooManySessions(_) => ErrorKind::State,
            DepthcamError::DeviceNotFound(_)
            | DepthcamError::Hardware(_)
            | DepthcamError::Usb(_)
            | DepthcamError::Unsupported => ErrorKind::Hardware,
            DepthcamError::Resource(_) => ErrorKind::Resource,
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &DepthcamError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
