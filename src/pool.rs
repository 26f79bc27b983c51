use crate::types::FrameMode;
use crate::{DepthcamError, Result};
use std::sync::{RwLock, RwLockReadGuard};

/// One ring entry: a depth plane, a color plane and the capture timestamps.
#[derive(Debug)]
pub struct FrameSlot {
    pub(crate) depth: Vec<u16>,
    pub(crate) color: Vec<u8>,
    /// Host capture time in seconds on the context clock.
    pub(crate) host_time: f64,
    /// Driver tick of the color image.
    pub(crate) device_timestamp: u32,
    pub(crate) depth_mode: FrameMode,
    pub(crate) video_mode: FrameMode,
}

impl FrameSlot {
    fn allocate(depth_mode: FrameMode, video_mode: FrameMode) -> Result<FrameSlot> {
        let depth_len = depth_mode.pixel_count();
        let color_len = video_mode
            .byte_size()
            .ok_or_else(|| DepthcamError::Resource("color plane size overflows".into()))?;

        let mut depth = Vec::new();
        depth
            .try_reserve_exact(depth_len)
            .map_err(|e| DepthcamError::Resource(format!("depth plane: {}", e)))?;
        depth.resize(depth_len, 0);

        let mut color = Vec::new();
        color
            .try_reserve_exact(color_len)
            .map_err(|e| DepthcamError::Resource(format!("color plane: {}", e)))?;
        color.resize(color_len, 0);

        Ok(FrameSlot {
            depth,
            color,
            host_time: -1.0,
            device_timestamp: 0,
            depth_mode,
            video_mode,
        })
    }

    pub fn depth(&self) -> &[u16] {
        &self.depth
    }

    pub fn color(&self) -> &[u8] {
        &self.color
    }

    pub fn depth_mode(&self) -> FrameMode {
        self.depth_mode
    }

    pub fn video_mode(&self) -> FrameMode {
        self.video_mode
    }

    /// Capture time in seconds on the context clock, -1 before the first write.
    pub fn host_time(&self) -> f64 {
        self.host_time
    }

    pub fn device_timestamp(&self) -> u32 {
        self.device_timestamp
    }

    /// Bounded copy of a depth image; a short or long source is truncated to the plane.
    pub(crate) fn write_depth(&mut self, data: &[u16]) {
        let n = data.len().min(self.depth.len());
        if n != self.depth.len() || n != data.len() {
            log::debug!(
                "depth image has {} samples, plane holds {}",
                data.len(),
                self.depth.len()
            );
        }
        self.depth[..n].copy_from_slice(&data[..n]);
    }

    pub(crate) fn write_color(&mut self, data: &[u8], host_time: f64, device_timestamp: u32) {
        let n = data.len().min(self.color.len());
        if n != self.color.len() || n != data.len() {
            log::debug!(
                "color image has {} bytes, plane holds {}",
                data.len(),
                self.color.len()
            );
        }
        self.color[..n].copy_from_slice(&data[..n]);
        self.host_time = host_time;
        self.device_timestamp = device_timestamp;
    }
}

/// Fixed ring of preallocated frame slots, addressed by logical cursor.
pub struct FramePool {
    slots: Vec<RwLock<FrameSlot>>,
}

impl FramePool {
    /// Allocate `n` slots. Either every slot is allocated or none is kept.
    pub fn allocate(n: usize, depth_mode: FrameMode, video_mode: FrameMode) -> Result<FramePool> {
        if n == 0 {
            return Err(DepthcamError::Configuration(
                "frame pool needs at least one slot".into(),
            ));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(n)
            .map_err(|e| DepthcamError::Resource(format!("slot table: {}", e)))?;
        for i in 0..n {
            // Slots allocated so far are dropped with `slots` on early return.
            let slot = FrameSlot::allocate(depth_mode, video_mode).map_err(|e| {
                log::error!("Could not allocate frame slot {} of {}: {}", i + 1, n, e);
                e
            })?;
            slots.push(RwLock::new(slot));
        }

        Ok(FramePool { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index of a logical cursor.
    pub fn index(&self, cursor: u64) -> usize {
        (cursor % self.slots.len() as u64) as usize
    }

    pub fn slot(&self, cursor: u64) -> &RwLock<FrameSlot> {
        &self.slots[self.index(cursor)]
    }

    /// Read access to a slot. Writers only ever leave a slot holding a
    /// complete copy, so poisoning is ignored.
    pub(crate) fn read_slot(&self, cursor: u64) -> RwLockReadGuard<'_, FrameSlot> {
        self.slot(cursor).read().unwrap_or_else(|e| e.into_inner())
    }
}
