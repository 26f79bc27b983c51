//! # depthcam - Rust SDK for Kinect-class depth + color cameras
//!
//! Buffered acquisition with a background capture thread. Provides:
//! - A ring of frame slots with stall or overwrite overflow policies
//! - Blocking and polling frame leases with capture timestamps
//! - Depth reconstruction: metric depth, colored point clouds, texture coordinates
//! - Tilt motor and LED control over libusb
//! - An emulated camera for running without hardware
//! - C FFI for integration with C/C++ hosts
//!
//! ## Quick Start
//! ```no_run
//! use depthcam::{Context, DepthFormat, Overflow, SessionConfig, WaitMode};
//!
//! let ctx = Context::new();
//! let mut session = ctx.open(-1, SessionConfig::default().with_buffers(3)).unwrap();
//! let info = session.start(Overflow::Stall).unwrap();
//! println!("{}x{} @ {} fps", info.depth_width, info.depth_height, info.fps);
//!
//! for _ in 0..100 {
//!     let grab = session.grab_frame(WaitMode::Block, false).unwrap();
//!     let cloud = session.depth_image(DepthFormat::VertexColor).unwrap();
//!     println!("t={:.3} values={}", grab.timestamp, cloud.data.len());
//!     session.release_frame().unwrap();
//! }
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod protocol;
pub mod driver;
pub mod pool;
mod monitor;
mod worker;
pub mod depth;
pub mod emulated;
pub mod session;
pub mod context;
pub mod usb;
pub mod ffi;

pub use config::{SessionConfig, Timing};
pub use context::Context;
pub use depth::DepthModel;
pub use driver::{Backend, CaptureDevice, FrameSink};
pub use emulated::{EmulatedDevice, Emulator, EmulatorConfig, Pacing};
pub use error::{DepthcamError, ErrorKind};
pub use pool::FrameSlot;
pub use session::Session;
pub use types::*;
pub use usb::{list_devices, Motor};

/// Result type alias for depthcam operations.
pub type Result<T> = std::result::Result<T, DepthcamError>;
