use crate::types::{Subdevices, TiltState, TiltStatus};
use crate::{DepthcamError, Result};

// -- USB identifiers --
pub const VID: u16 = 0x045E;
pub const PID_CAMERA: u16 = 0x02AE;
pub const PID_MOTOR: u16 = 0x02B0;
pub const PID_AUDIO: u16 = 0x02AD;
pub const MOTOR_INTERFACE: u8 = 0;

// -- Motor control requests --
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
pub const REQ_SET_LED: u8 = 0x06;
pub const REQ_SET_TILT: u8 = 0x31;
pub const REQ_GET_TILT_STATE: u8 = 0x32;

/// Length of the tilt state reply.
pub const TILT_STATE_LEN: usize = 10;

/// Angle byte reported while the motor has no valid reading.
pub const TILT_ANGLE_INVALID: i8 = i8::MIN;

/// Accelerometer counts per g.
pub const ACCEL_COUNTS_PER_G: f64 = 819.0;

pub const MIN_TILT_DEGREES: f64 = -30.0;
pub const MAX_TILT_DEGREES: f64 = 30.0;

/// Sub-device served by a product id, if it belongs to a Kinect.
pub fn subdevice_for_pid(pid: u16) -> Option<Subdevices> {
    match pid {
        PID_CAMERA => Some(Subdevices::CAMERA),
        PID_MOTOR => Some(Subdevices::MOTOR),
        PID_AUDIO => Some(Subdevices::AUDIO),
        _ => None,
    }
}

/// `wValue` of the set-tilt request: the clamped angle in half degrees,
/// as a two's complement 16-bit value.
pub fn tilt_value(degrees: f64) -> u16 {
    let clamped = degrees.clamp(MIN_TILT_DEGREES, MAX_TILT_DEGREES);
    ((clamped * 2.0).round() as i16) as u16
}

/// Parse the tilt state reply.
///
/// Layout: 2 unused bytes, three big-endian i16 accelerometer axes, the
/// signed angle in half degrees, the motor status.
pub fn parse_tilt_state(reply: &[u8]) -> Result<TiltState> {
    if reply.len() < TILT_STATE_LEN {
        return Err(DepthcamError::Hardware(format!(
            "tilt state reply too short ({} bytes)",
            reply.len()
        )));
    }

    let axis = |i: usize| i16::from_be_bytes([reply[i], reply[i + 1]]);
    let accelerometer = [axis(2), axis(4), axis(6)];

    let raw_angle = reply[8] as i8;
    let angle = (raw_angle != TILT_ANGLE_INVALID).then(|| raw_angle as f64 / 2.0);

    let status = match reply[9] {
        0x00 => TiltStatus::Stopped,
        0x01 => TiltStatus::Limit,
        0x04 => TiltStatus::Moving,
        other => {
            return Err(DepthcamError::Hardware(format!(
                "unknown tilt status 0x{:02x}",
                other
            )))
        }
    };

    Ok(TiltState {
        accelerometer,
        angle,
        status,
    })
}

/// Accelerometer counts to acceleration in m/s².
pub fn accel_to_mks(counts: i16) -> f64 {
    counts as f64 / ACCEL_COUNTS_PER_G * 9.80665
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tilt_value_encoding() {
        assert_eq!(tilt_value(0.0), 0);
        assert_eq!(tilt_value(15.0), 30);
        assert_eq!(tilt_value(-30.0), (-60i16) as u16);
        assert_eq!(tilt_value(-30.0), 0xFFC4);
        assert_eq!(tilt_value(90.0), 60);
        assert_eq!(tilt_value(2.25), 5);
    }

    #[test]
    fn test_parse_tilt_state() {
        let reply = [0x00, 0x00, 0x00, 0x10, 0xFF, 0xF0, 0x03, 0x33, 0xF6, 0x04];
        let state = parse_tilt_state(&reply).unwrap();
        assert_eq!(state.accelerometer, [16, -16, 819]);
        assert_eq!(state.angle, Some(-5.0));
        assert_eq!(state.status, TiltStatus::Moving);
        assert!((accel_to_mks(state.accelerometer[2]) - 9.80665).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tilt_state_invalid_angle_and_errors() {
        let mut reply = [0u8; TILT_STATE_LEN];
        reply[8] = 0x80;
        reply[9] = 0x01;
        let state = parse_tilt_state(&reply).unwrap();
        assert_eq!(state.angle, None);
        assert_eq!(state.status, TiltStatus::Limit);

        assert!(parse_tilt_state(&reply[..9]).is_err());
        reply[9] = 0x02;
        assert!(parse_tilt_state(&reply).is_err());
    }

    #[test]
    fn test_subdevice_mapping() {
        assert_eq!(subdevice_for_pid(0x02AE), Some(Subdevices::CAMERA));
        assert_eq!(subdevice_for_pid(0x02B0), Some(Subdevices::MOTOR));
        assert_eq!(subdevice_for_pid(0x02AD), Some(Subdevices::AUDIO));
        assert_eq!(subdevice_for_pid(0x1234), None);
    }
}
