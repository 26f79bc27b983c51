//! C FFI layer for depthcam.
//!
//! Provides an opaque handle-based API for C/C++ consumers.
//! The generated C header is written to `include/depthcam.h` by cbindgen.

use crate::config::SessionConfig;
use crate::context::Context;
use crate::error::LastError;
use crate::session::{PixelView, Session};
use crate::types::{
    Calibration, CalibrationUpdate, DepthFormat, ImageKind, Intrinsics, Overflow, SessionStatus,
    StartInfo, VideoFormat, WaitMode,
};
use crate::{DepthcamError, Result};
use std::ffi::{c_char, c_int, c_void};
use std::sync::OnceLock;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

static CONTEXT: OnceLock<Context> = OnceLock::new();

fn context() -> &'static Context {
    CONTEXT.get_or_init(Context::new)
}

/// Opaque session handle for C consumers.
pub struct DcSession(Session);

/// Geometry and GL tokens of an image returned by `dc_get_image` or `dc_get_depth_image`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DcImageInfo {
    pub width: u32,
    pub height: u32,
    /// Channels of a color image, values per pixel of a depth image.
    pub components: u32,
    /// GL pixel format token; 0 for depth images.
    pub format: u32,
    /// GL component type token.
    pub component_type: u32,
    /// Size of the data in bytes.
    pub byte_len: usize,
}

/// Camera entry in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DcDeviceInfo {
    pub index: c_int,
    pub bus_number: u8,
    pub address: u8,
    /// Bitmap: 1 = camera, 2 = motor, 4 = audio.
    pub subdevices: u32,
}

fn report<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            LAST_ERROR.set(&e);
            None
        }
    }
}

fn status_code(result: Result<()>) -> c_int {
    match report(result) {
        Some(()) => 0,
        None => -1,
    }
}

unsafe fn session_mut<'a>(session: *mut DcSession) -> Result<&'a mut Session> {
    session
        .as_mut()
        .map(|s| &mut s.0)
        .ok_or_else(|| DepthcamError::Configuration("null session handle".into()))
}

unsafe fn read_array<const N: usize>(ptr: *const f64) -> Option<[f64; N]> {
    if ptr.is_null() {
        return None;
    }
    let mut out = [0.0; N];
    out.copy_from_slice(std::slice::from_raw_parts(ptr, N));
    Some(out)
}

unsafe fn deliver(
    view: PixelView,
    return_pointer: c_int,
    buffer: *mut c_void,
    buffer_len: usize,
    info: *mut DcImageInfo,
) -> Result<*const c_void> {
    if !info.is_null() {
        info.write(DcImageInfo {
            width: view.width,
            height: view.height,
            components: view.components,
            format: view.format,
            component_type: view.component_type as u32,
            byte_len: view.byte_len,
        });
    }
    if return_pointer != 0 {
        return Ok(view.ptr);
    }
    if buffer.is_null() || buffer_len < view.byte_len {
        return Err(DepthcamError::Configuration(format!(
            "destination buffer holds {} bytes, image needs {}",
            if buffer.is_null() { 0 } else { buffer_len },
            view.byte_len
        )));
    }
    std::ptr::copy_nonoverlapping(view.ptr as *const u8, buffer as *mut u8, view.byte_len);
    Ok(buffer)
}

/// List connected Kinect cameras.
///
/// Writes up to `max` entries into `out`. Returns the number of devices
/// written, or -1 on error.
///
/// # Safety
/// `out` must point to an array of at least `max` `DcDeviceInfo` elements, or be null.
#[no_mangle]
pub unsafe extern "C" fn dc_list_devices(out: *mut DcDeviceInfo, max: c_int) -> c_int {
    let Some(devices) = report(crate::usb::list_devices()) else {
        return -1;
    };
    let count = devices.len().min(max.max(0) as usize);
    if !out.is_null() {
        for (i, dev) in devices.iter().take(count).enumerate() {
            out.add(i).write(DcDeviceInfo {
                index: dev.index,
                bus_number: dev.bus_number,
                address: dev.address,
                subdevices: dev.subdevices.bits(),
            });
        }
    }
    count as c_int
}

/// Open a device. `device_index = -1` opens the emulated camera.
/// `bayer_filter_mode`: 0 = raw Bayer, 1 = RGB, 2 = IR.
/// Returns NULL on error (check dc_last_error()).
#[no_mangle]
pub extern "C" fn dc_open(
    device_index: c_int,
    num_buffers: c_int,
    bayer_filter_mode: c_int,
) -> *mut DcSession {
    let opened = (|| {
        let num_buffers = usize::try_from(num_buffers).map_err(|_| {
            DepthcamError::Configuration(format!("numbuffers {} is invalid", num_buffers))
        })?;
        let config = SessionConfig::default()
            .with_buffers(num_buffers)
            .with_video_format(VideoFormat::try_from(bayer_filter_mode)?);
        context().open(device_index, config)
    })();

    match report(opened) {
        Some(session) => Box::into_raw(Box::new(DcSession(session))),
        None => std::ptr::null_mut(),
    }
}

/// Stop capture and free the session.
///
/// # Safety
/// `session` must be a pointer returned by `dc_open`, or null.
#[no_mangle]
pub unsafe extern "C" fn dc_close(session: *mut DcSession) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

/// Start capture. `drop_frames`: 0 = stall when the ring is full, 1 =
/// overwrite the oldest frames. Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer; `out` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn dc_start(
    session: *mut DcSession,
    drop_frames: c_int,
    out: *mut StartInfo,
) -> c_int {
    let overflow = if drop_frames > 0 {
        Overflow::Overwrite
    } else {
        Overflow::Stall
    };
    let started = session_mut(session).and_then(|s| s.start(overflow));
    match report(started) {
        Some(info) => {
            if !out.is_null() {
                out.write(info);
            }
            0
        }
        None => -1,
    }
}

/// Stop capture. Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dc_stop(session: *mut DcSession) -> c_int {
    status_code(session_mut(session).map(|s| s.stop()))
}

/// Lease the next frame.
/// `wait_mode`: 0 = poll, 1 = block. `most_recent`: nonzero skips to the newest frame.
/// Returns 0 (no frame), 1 (frame ready), 2 (capture stopped) or -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer; `timestamp` and `pending` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn dc_grab_frame(
    session: *mut DcSession,
    wait_mode: c_int,
    most_recent: c_int,
    timestamp: *mut f64,
    pending: *mut u64,
) -> c_int {
    let wait = if wait_mode == 0 {
        WaitMode::Poll
    } else {
        WaitMode::Block
    };
    let grabbed = session_mut(session).and_then(|s| s.grab_frame(wait, most_recent != 0));
    match report(grabbed) {
        Some(grab) => {
            if !timestamp.is_null() {
                timestamp.write(grab.timestamp);
            }
            if !pending.is_null() {
                pending.write(grab.pending);
            }
            grab.status as c_int
        }
        None => -1,
    }
}

/// Release the leased frame. Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dc_release_frame(session: *mut DcSession) -> c_int {
    status_code(session_mut(session).and_then(|s| s.release_frame()))
}

/// Get the leased color image (`imtype = 0`) or a false-color depth image (`imtype = 1`).
///
/// With `return_pointer` nonzero, returns a pointer into session memory that
/// stays valid until the frame is released. Otherwise copies into `buffer`
/// (at least `info.byte_len` bytes) and returns `buffer`. Returns NULL on error.
///
/// # Safety
/// `session` must be a valid session pointer; `buffer` must hold `buffer_len`
/// bytes or be null; `info` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn dc_get_image(
    session: *mut DcSession,
    imtype: c_int,
    return_pointer: c_int,
    buffer: *mut c_void,
    buffer_len: usize,
    info: *mut DcImageInfo,
) -> *const c_void {
    let delivered = session_mut(session)
        .and_then(|s| s.image_view(ImageKind::from(imtype)))
        .and_then(|view| deliver(view, return_pointer, buffer, buffer_len, info));
    report(delivered).unwrap_or(std::ptr::null())
}

/// Convert the leased depth image into `format` (0..=8), see `dc_get_image`
/// for the buffer handling. Returns NULL on error.
///
/// # Safety
/// Same as `dc_get_image`.
#[no_mangle]
pub unsafe extern "C" fn dc_get_depth_image(
    session: *mut DcSession,
    format: c_int,
    return_pointer: c_int,
    buffer: *mut c_void,
    buffer_len: usize,
    info: *mut DcImageInfo,
) -> *const c_void {
    let delivered = DepthFormat::try_from(format)
        .and_then(|format| session_mut(session).and_then(|s| s.depth_view(format)))
        .and_then(|view| deliver(view, return_pointer, buffer, buffer_len, info));
    report(delivered).unwrap_or(std::ptr::null())
}

/// Update the calibration. Each pointer may be null to keep the current value:
/// intrinsics are `[fx, fy, cx, cy]`, `rotation` is 9 row-major values,
/// `translation` 3, the undistort vectors 5 and `depth_base_and_offset` 2.
/// The calibration in effect before the call is written to `previous`.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer; every non-null array pointer
/// must hold the stated number of doubles; `previous` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn dc_set_base_calibration(
    session: *mut DcSession,
    depth_intrinsics: *const f64,
    rgb_intrinsics: *const f64,
    rotation: *const f64,
    translation: *const f64,
    depth_undistort: *const f64,
    rgb_undistort: *const f64,
    depth_base_and_offset: *const f64,
    previous: *mut Calibration,
) -> c_int {
    let update = CalibrationUpdate {
        depth: read_array::<4>(depth_intrinsics).map(Intrinsics::from_array),
        color: read_array::<4>(rgb_intrinsics).map(Intrinsics::from_array),
        rotation: read_array::<9>(rotation).map(|r| {
            [[r[0], r[1], r[2]], [r[3], r[4], r[5]], [r[6], r[7], r[8]]]
        }),
        translation: read_array::<3>(translation),
        depth_undistort: read_array::<5>(depth_undistort),
        color_undistort: read_array::<5>(rgb_undistort),
        depth_base_and_offset: read_array::<2>(depth_base_and_offset),
    };
    let applied = session_mut(session).map(|s| s.set_base_calibration(update));
    match report(applied) {
        Some(old) => {
            if !previous.is_null() {
                previous.write(old);
            }
            0
        }
        None => -1,
    }
}

/// Snapshot of the ring state. Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer; `out` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn dc_get_status(session: *mut DcSession, out: *mut SessionStatus) -> c_int {
    let status = session_mut(session).map(|s| s.status());
    match report(status) {
        Some(status) => {
            if !out.is_null() {
                out.write(status);
            }
            0
        }
        None => -1,
    }
}

/// Tilt the sensor head to `angle` degrees, clamped to ±30.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dc_set_angle(session: *mut DcSession, angle: c_int) -> c_int {
    status_code(session_mut(session).and_then(|s| s.set_angle(angle).map(|_| ())))
}

/// Get the last error message. Returns NULL if no error has occurred.
/// The returned pointer is valid until the next depthcam API call.
#[no_mangle]
pub extern "C" fn dc_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
