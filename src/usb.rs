//! Kinect discovery and motor/LED control over libusb.

use crate::config::read_env_bool;
use crate::protocol::{self, MOTOR_INTERFACE, PID_CAMERA, PID_MOTOR, VID};
use crate::types::{DeviceInfo, Led, Subdevices, TiltState};
use crate::{DepthcamError, Result};
use std::time::Duration;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// One Kinect USB function as seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UsbEntry {
    bus: u8,
    address: u8,
    ports: Vec<u8>,
    pid: u16,
}

impl UsbEntry {
    /// The three functions of one Kinect hang off the same internal hub.
    fn same_hub(&self, other: &UsbEntry) -> bool {
        self.bus == other.bus
            && !self.ports.is_empty()
            && self.ports.len() == other.ports.len()
            && self.ports[..self.ports.len() - 1] == other.ports[..other.ports.len() - 1]
    }
}

fn scan() -> Result<Vec<UsbEntry>> {
    let devices = rusb::devices()?;
    let mut entries = Vec::new();
    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                log::debug!(
                    "Skipping USB device {}:{}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        if desc.vendor_id() != VID || protocol::subdevice_for_pid(desc.product_id()).is_none() {
            continue;
        }
        entries.push(UsbEntry {
            bus: device.bus_number(),
            address: device.address(),
            ports: device.port_numbers().unwrap_or_default(),
            pid: desc.product_id(),
        });
    }
    entries.sort_by_key(|e| (e.bus, e.address));
    Ok(entries)
}

/// Cameras in bus order, each with the sub-devices found next to it.
fn group(entries: &[UsbEntry]) -> Vec<DeviceInfo> {
    entries
        .iter()
        .filter(|e| e.pid == PID_CAMERA)
        .enumerate()
        .map(|(index, camera)| {
            let subdevices = entries
                .iter()
                .filter(|e| e.pid != PID_CAMERA && e.same_hub(camera))
                .filter_map(|e| protocol::subdevice_for_pid(e.pid))
                .fold(Subdevices::CAMERA, |acc, s| acc | s);
            DeviceInfo {
                index: index as i32,
                bus_number: camera.bus,
                address: camera.address,
                subdevices,
            }
        })
        .collect()
}

/// List the Kinect cameras on the bus, in bus order.
///
/// Opening a camera for capture needs a [`Backend`](crate::Backend) supplied
/// through [`Context::with_backend`](crate::Context::with_backend); the
/// default context only opens the emulated device.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let devices = group(&scan()?);
    log::info!("Found {} Kinect camera(s)", devices.len());
    Ok(devices)
}

/// The tilt motor, LED and accelerometer sub-device.
pub struct Motor {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
}

impl Motor {
    /// Open the motor of Kinect `index` (in bus order).
    ///
    /// Set `DEPTHCAM_DETACH_KERNEL_DRIVER=0` to leave an attached kernel
    /// driver alone.
    pub fn open(index: usize) -> Result<Motor> {
        let devices = rusb::devices()?;
        let mut motors: Vec<rusb::Device<rusb::GlobalContext>> = devices
            .iter()
            .filter(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == VID && desc.product_id() == PID_MOTOR)
                    .unwrap_or(false)
            })
            .collect();
        motors.sort_by_key(|d| (d.bus_number(), d.address()));

        let device = motors
            .get(index)
            .ok_or(DepthcamError::DeviceNotFound(index as i32))?;
        let handle = device.open()?;

        if read_env_bool("DEPTHCAM_DETACH_KERNEL_DRIVER", true) {
            match handle.detach_kernel_driver(MOTOR_INTERFACE) {
                Ok(_) => log::info!("Detached kernel driver from motor interface"),
                Err(rusb::Error::NotFound) | Err(rusb::Error::NotSupported) => {}
                Err(e) => log::warn!("Detach: {} (continuing)", e),
            }
        }
        handle.claim_interface(MOTOR_INTERFACE)?;

        log::info!(
            "Opened Kinect motor {} at {}:{}",
            index,
            device.bus_number(),
            device.address()
        );
        Ok(Motor { handle })
    }

    /// Tilt to `degrees`, clamped to ±30.
    pub fn set_tilt_degrees(&self, degrees: f64) -> Result<()> {
        self.handle.write_control(
            protocol::REQUEST_TYPE_VENDOR_OUT,
            protocol::REQ_SET_TILT,
            protocol::tilt_value(degrees),
            0,
            &[],
            CONTROL_TIMEOUT,
        )?;
        Ok(())
    }

    pub fn set_led(&self, led: Led) -> Result<()> {
        self.handle.write_control(
            protocol::REQUEST_TYPE_VENDOR_OUT,
            protocol::REQ_SET_LED,
            led as u16,
            0,
            &[],
            CONTROL_TIMEOUT,
        )?;
        Ok(())
    }

    /// Read the accelerometer and the motor state.
    pub fn tilt_state(&self) -> Result<TiltState> {
        let mut reply = [0u8; protocol::TILT_STATE_LEN];
        let len = self.handle.read_control(
            protocol::REQUEST_TYPE_VENDOR_IN,
            protocol::REQ_GET_TILT_STATE,
            0,
            0,
            &mut reply,
            CONTROL_TIMEOUT,
        )?;
        protocol::parse_tilt_state(&reply[..len])
    }
}

impl Drop for Motor {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(MOTOR_INTERFACE);
    }
}
