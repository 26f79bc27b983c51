//! Disparity to metric depth conversion and depth/color camera geometry.
//!
//! Raw samples are 11-bit disparities. [`RAW_INVALID`] and anything above it
//! marks a pixel without a measurement; scalar conversions return `None` for
//! it and buffer outputs write `NaN`.

use crate::pool::FrameSlot;
use crate::types::{Calibration, DepthData, DepthFormat, FrameMode, Intrinsics};
use crate::{DepthcamError, Result};
use std::sync::OnceLock;

/// Disparity value the sensor reports for "no measurement".
pub const RAW_INVALID: u16 = 2047;

const LINEAR_SCALE: f64 = -0.0030711016;
const LINEAR_OFFSET: f64 = 3.3309495161;

const TAN_K1: f64 = 1.1863;
const TAN_K2: f64 = 2842.5;
const TAN_K3: f64 = 0.1236;

/// Disparity to depth conversion, selected from the `[base, offset]` calibration pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthModel {
    /// Fixed inverse-linear fit; used for an uncalibrated sensor.
    Linear,
    /// Stereo baseline model `z = 540 * 8 * base / (offset - raw)`.
    Baseline { base: f64, offset: f64 },
    /// Empirical fit `z = k3 * tan(raw / k2 + k1)`.
    Tangent,
}

impl DepthModel {
    /// Both entries nonzero select `Baseline`; otherwise an offset of exactly
    /// 1 selects `Tangent`; anything else falls back to `Linear`.
    pub fn from_base_and_offset(base_and_offset: [f64; 2]) -> DepthModel {
        let [base, offset] = base_and_offset;
        if base != 0.0 && offset != 0.0 {
            DepthModel::Baseline { base, offset }
        } else if offset == 1.0 {
            DepthModel::Tangent
        } else {
            DepthModel::Linear
        }
    }

    /// Metric depth in meters, `None` for invalid samples.
    pub fn depth(&self, raw: u16) -> Option<f64> {
        if raw >= RAW_INVALID {
            return None;
        }
        let raw = raw as f64;
        let z = match *self {
            DepthModel::Linear => 1.0 / (raw * LINEAR_SCALE + LINEAR_OFFSET),
            DepthModel::Baseline { base, offset } => 540.0 * 8.0 * base / (offset - raw),
            DepthModel::Tangent => TAN_K3 * (raw / TAN_K2 + TAN_K1).tan(),
        };
        z.is_finite().then_some(z)
    }

    fn depth_or_nan(&self, raw: u16) -> f64 {
        self.depth(raw).unwrap_or(f64::NAN)
    }
}

/// Depth camera pixel `(x, y)` at depth `z` to a 3D point in the depth camera frame.
pub fn unproject(depth: &Intrinsics, x: f64, y: f64, z: f64) -> [f64; 3] {
    [(x - depth.cx) * z / depth.fx, (y - depth.cy) * z / depth.fy, z]
}

/// Apply the extrinsics: `R * p + T`.
pub fn to_color_frame(calibration: &Calibration, p: [f64; 3]) -> [f64; 3] {
    let r = &calibration.rotation;
    let t = &calibration.translation;
    let mut out = [0.0; 3];
    for (m, row) in r.iter().enumerate() {
        out[m] = row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + t[m];
    }
    out
}

/// Pinhole projection onto the image plane of `camera`.
pub fn project(camera: &Intrinsics, p: [f64; 3]) -> [f64; 2] {
    [
        p[0] * camera.fx / p[2] + camera.cx,
        p[1] * camera.fy / p[2] + camera.cy,
    ]
}

/// Color image coordinates of a depth-frame point.
pub fn reproject(calibration: &Calibration, p: [f64; 3]) -> [f64; 2] {
    project(&calibration.color, to_color_frame(calibration, p))
}

/// Clamp image coordinates to a valid pixel. NaN clamps to zero.
pub fn clamp_to_image(uv: [f64; 2], width: u32, height: u32) -> (usize, usize) {
    let clamp = |v: f64, len: u32| -> usize {
        let max = len.saturating_sub(1) as f64;
        if v.is_nan() || v < 0.0 {
            0
        } else if v > max {
            max as usize
        } else {
            v as usize
        }
    };
    (clamp(uv[0], width), clamp(uv[1], height))
}

/// Nearest-neighbor color lookup, components in [0, 1].
///
/// Single-channel planes (Bayer, IR) are replicated into all three channels.
pub fn sample_color(color: &[u8], mode: FrameMode, uv: [f64; 2]) -> [f64; 3] {
    let (u, v) = clamp_to_image(uv, mode.width, mode.height);
    let bpp = mode.bytes_per_pixel.max(1) as usize;
    let base = (v * mode.width as usize + u) * bpp;
    let at = |i: usize| color.get(i).copied().unwrap_or(0) as f64 / 255.0;
    if bpp >= 3 {
        [at(base), at(base + 1), at(base + 2)]
    } else {
        let g = at(base);
        [g, g, g]
    }
}

fn gamma_table() -> &'static [u16; 2048] {
    static TABLE: OnceLock<[u16; 2048]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u16; 2048];
        for (i, entry) in table.iter_mut().enumerate() {
            let v = (i as f32 / 2048.0).powf(3.0) * 6.0;
            *entry = (v * 6.0 * 256.0) as u16;
        }
        table
    })
}

/// Render raw disparity as RGB8 false color, replacing the contents of `out`.
///
/// Near samples are white to red, far ones fade through green and blue;
/// invalid samples are black.
pub fn false_color(depth: &[u16], out: &mut Vec<u8>) {
    let table = gamma_table();
    out.clear();
    out.reserve(depth.len() * 3);
    for &raw in depth {
        let pval = table[(raw as usize).min(table.len() - 1)];
        let lb = (pval & 0xff) as u8;
        let rgb = match pval >> 8 {
            0 => [255, 255 - lb, 255 - lb],
            1 => [255, lb, 0],
            2 => [255 - lb, 255, 0],
            3 => [0, 255, lb],
            4 => [0, 255 - lb, 255],
            5 => [0, 0, 255 - lb],
            _ => [0, 0, 0],
        };
        out.extend_from_slice(&rgb);
    }
}

/// Per-session output buffers for [`DepthFormat`] conversions.
///
/// The update formats refresh only the depth component of the buffer left
/// by the previous full conversion, so the layout of the last render is
/// remembered.
#[derive(Debug, Default)]
pub(crate) struct DepthScratch {
    pub f64: Vec<f64>,
    pub f32: Vec<f32>,
    layout: Option<DepthFormat>,
}

impl DepthScratch {
    /// Convert `frame` into the scratch buffer for `format`.
    ///
    /// `RawU16` needs no conversion and leaves the scratch untouched.
    pub fn render(
        &mut self,
        format: DepthFormat,
        calibration: &Calibration,
        frame: &FrameSlot,
    ) -> Result<()> {
        let mode = frame.depth_mode;
        let (w, h) = (mode.width as usize, mode.height as usize);
        let len = w
            .checked_mul(h)
            .and_then(|n| n.checked_mul(format.components() as usize))
            .ok_or_else(|| DepthcamError::Resource("depth output size overflows".into()))?;
        let depth = &frame.depth;
        let model = DepthModel::from_base_and_offset(calibration.depth_base_and_offset);
        let raw_at = |x: usize, y: usize| depth.get(y * w + x).copied().unwrap_or(RAW_INVALID);

        match format {
            DepthFormat::RawU16 => return Ok(()),
            DepthFormat::Raw | DepthFormat::Metric => {
                let out = reset(&mut self.f64, len)?;
                for y in 0..h {
                    for x in 0..w {
                        let raw = raw_at(x, y);
                        out[y * w + x] = if format == DepthFormat::Raw {
                            raw as f64
                        } else {
                            model.depth_or_nan(raw)
                        };
                    }
                }
            }
            DepthFormat::VertexColor | DepthFormat::VertexTexcoord => {
                let stride = format.components() as usize;
                let out = reset(&mut self.f64, len)?;
                for y in 0..h {
                    for x in 0..w {
                        let v = &mut out[(y * w + x) * stride..][..stride];
                        let Some(z) = model.depth(raw_at(x, y)) else {
                            v.fill(f64::NAN);
                            continue;
                        };
                        let p = unproject(&calibration.depth, x as f64, y as f64, z);
                        let uv = reproject(calibration, p);
                        v[..3].copy_from_slice(&p);
                        if format == DepthFormat::VertexColor {
                            v[3..].copy_from_slice(&sample_color(&frame.color, frame.video_mode, uv));
                        } else {
                            v[3..].copy_from_slice(&uv);
                        }
                    }
                }
            }
            DepthFormat::PixelDepth | DepthFormat::PixelDepthUpdate => {
                let refresh = format == DepthFormat::PixelDepthUpdate
                    && self.layout == Some(DepthFormat::PixelDepth)
                    && self.f64.len() == len;
                if !refresh {
                    let out = reset(&mut self.f64, len)?;
                    for y in 0..h {
                        for x in 0..w {
                            out[(y * w + x) * 3] = x as f64;
                            out[(y * w + x) * 3 + 1] = y as f64;
                        }
                    }
                }
                for y in 0..h {
                    for x in 0..w {
                        self.f64[(y * w + x) * 3 + 2] = model.depth_or_nan(raw_at(x, y));
                    }
                }
                self.layout = Some(DepthFormat::PixelDepth);
                return Ok(());
            }
            DepthFormat::IndexRaw | DepthFormat::IndexRawUpdate => {
                let refresh = format == DepthFormat::IndexRawUpdate
                    && self.layout == Some(DepthFormat::IndexRaw)
                    && self.f32.len() == len;
                if !refresh {
                    self.f32.clear();
                    self.f32
                        .try_reserve_exact(len)
                        .map_err(|e| DepthcamError::Resource(format!("depth output: {}", e)))?;
                    self.f32.resize(len, 0.0);
                    for (i, pair) in self.f32.chunks_exact_mut(2).enumerate() {
                        pair[0] = i as f32;
                    }
                }
                for (i, pair) in self.f32.chunks_exact_mut(2).enumerate() {
                    pair[1] = depth.get(i).copied().unwrap_or(RAW_INVALID) as f32;
                }
                self.layout = Some(DepthFormat::IndexRaw);
                return Ok(());
            }
        }

        self.layout = Some(format);
        Ok(())
    }

    /// Copy of the scratch contents for `format`, or of the raw plane for `RawU16`.
    pub fn to_data(&self, format: DepthFormat, frame: &FrameSlot) -> DepthData {
        match format {
            DepthFormat::RawU16 => DepthData::U16(frame.depth.clone()),
            DepthFormat::IndexRaw | DepthFormat::IndexRawUpdate => DepthData::F32(self.f32.clone()),
            _ => DepthData::F64(self.f64.clone()),
        }
    }
}

fn reset(buf: &mut Vec<f64>, len: usize) -> Result<&mut [f64]> {
    buf.clear();
    buf.try_reserve_exact(len)
        .map_err(|e| DepthcamError::Resource(format!("depth output: {}", e)))?;
    buf.resize(len, 0.0);
    Ok(buf.as_mut_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    fn frame_with(depth: &[u16], color: &[u8], w: u32, h: u32) -> FramePool {
        let pool = FramePool::allocate(1, FrameMode::new(w, h, 2), FrameMode::new(w, h, 3)).unwrap();
        {
            let mut slot = pool.slot(0).write().unwrap();
            slot.write_depth(depth);
            slot.write_color(color, 0.0, 0);
        }
        pool
    }

    #[test]
    fn test_linear_model() {
        let z = DepthModel::Linear.depth(0).unwrap();
        assert!(approx(z, 0.3002, 1e-4), "z = {}", z);
        let far = DepthModel::Linear.depth(1000).unwrap();
        assert!(far > z);
    }

    #[test]
    fn test_invalid_is_sentinel_for_all_models() {
        let models = [
            DepthModel::Linear,
            DepthModel::Tangent,
            DepthModel::Baseline { base: 0.075, offset: 1090.0 },
        ];
        for model in models {
            assert_eq!(model.depth(RAW_INVALID), None, "{:?}", model);
            assert_eq!(model.depth(u16::MAX), None, "{:?}", model);
        }
        // A zero denominator is not a depth either.
        let model = DepthModel::Baseline { base: 0.075, offset: 500.0 };
        assert_eq!(model.depth(500), None);
    }

    #[test]
    fn test_model_selection() {
        assert_eq!(DepthModel::from_base_and_offset([0.0, 0.0]), DepthModel::Linear);
        assert_eq!(DepthModel::from_base_and_offset([0.0, 1.0]), DepthModel::Tangent);
        assert_eq!(DepthModel::from_base_and_offset([0.5, 0.0]), DepthModel::Linear);
        assert_eq!(
            DepthModel::from_base_and_offset([0.075, 1090.0]),
            DepthModel::Baseline { base: 0.075, offset: 1090.0 }
        );
        let tan = DepthModel::Tangent.depth(0).unwrap();
        assert!(approx(tan, 0.1236 * 1.1863f64.tan(), 1e-12));
        let base = DepthModel::Baseline { base: 0.075, offset: 1090.0 }.depth(90).unwrap();
        assert!(approx(base, 540.0 * 8.0 * 0.075 / 1000.0, 1e-12));
    }

    #[test]
    fn test_unproject_then_project_identity() {
        let calib = Calibration::default();
        let p = unproject(&calib.depth, 400.0, 300.0, 2.0);
        let back = project(&calib.depth, p);
        assert!(approx(back[0], 400.0, 1e-9));
        assert!(approx(back[1], 300.0, 1e-9));
        let center = unproject(&calib.depth, calib.depth.cx, calib.depth.cy, 1.5);
        assert_eq!(center, [0.0, 0.0, 1.5]);
    }

    #[test]
    fn test_reproject_with_identity_extrinsics() {
        let mut calib = Calibration::default();
        calib.rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        calib.translation = [0.0; 3];
        let uv = reproject(&calib, [0.0, 0.0, 1.0]);
        assert!(approx(uv[0], calib.color.cx, 1e-12));
        assert!(approx(uv[1], calib.color.cy, 1e-12));
    }

    #[test]
    fn test_clamp_and_sample() {
        assert_eq!(clamp_to_image([-5.0, 900.0], 640, 480), (0, 479));
        assert_eq!(clamp_to_image([f64::NAN, 10.7], 640, 480), (0, 10));

        let color = [10, 20, 30, 40, 50, 60];
        let rgb = sample_color(&color, FrameMode::new(2, 1, 3), [5.0, 0.0]);
        assert!(approx(rgb[0], 40.0 / 255.0, 1e-12));
        let grey = sample_color(&[0, 255], FrameMode::new(2, 1, 1), [1.0, 0.0]);
        assert_eq!(grey, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_false_color_endpoints() {
        let mut out = Vec::new();
        false_color(&[0, RAW_INVALID, 5000], &mut out);
        assert_eq!(out.len(), 9);
        assert_eq!(&out[0..3], &[255, 255, 255]);
        assert_eq!(&out[3..6], &[0, 0, 0]);
        assert_eq!(&out[6..9], &[0, 0, 0]);
    }

    #[test]
    fn test_render_metric_marks_invalid_nan() {
        let pool = frame_with(&[0, RAW_INVALID, 500, 600], &[0; 12], 2, 2);
        let slot = pool.slot(0).read().unwrap();
        let mut scratch = DepthScratch::default();
        scratch.render(DepthFormat::Metric, &Calibration::default(), &slot).unwrap();
        assert_eq!(scratch.f64.len(), 4);
        assert!(approx(scratch.f64[0], 0.3002, 1e-4));
        assert!(scratch.f64[1].is_nan());

        scratch.render(DepthFormat::Raw, &Calibration::default(), &slot).unwrap();
        assert_eq!(scratch.f64, vec![0.0, 2047.0, 500.0, 600.0]);
    }

    #[test]
    fn test_render_pixel_depth_is_row_major() {
        let pool = frame_with(&[0, 100, 200, 300, 400, 500], &[0; 18], 3, 2);
        let slot = pool.slot(0).read().unwrap();
        let mut scratch = DepthScratch::default();
        scratch.render(DepthFormat::PixelDepth, &Calibration::default(), &slot).unwrap();
        // Pixel (x=1, y=1) is element 4.
        assert_eq!(&scratch.f64[12..14], &[1.0, 1.0]);
        let z = DepthModel::Linear.depth(400).unwrap();
        assert!(approx(scratch.f64[14], z, 1e-12));
    }

    #[test]
    fn test_update_formats_refresh_only_depth() {
        let pool = frame_with(&[1, 2, 3, 4], &[0; 12], 2, 2);
        let mut scratch = DepthScratch::default();
        {
            let slot = pool.slot(0).read().unwrap();
            scratch.render(DepthFormat::IndexRaw, &Calibration::default(), &slot).unwrap();
        }
        assert_eq!(scratch.f32, vec![0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0]);

        // Tamper with the index channel to prove the update path leaves it alone.
        scratch.f32[0] = -1.0;
        pool.slot(0).write().unwrap().write_depth(&[9, 8, 7, 6]);
        let slot = pool.slot(0).read().unwrap();
        scratch.render(DepthFormat::IndexRawUpdate, &Calibration::default(), &slot).unwrap();
        assert_eq!(scratch.f32, vec![-1.0, 9.0, 1.0, 8.0, 2.0, 7.0, 3.0, 6.0]);
    }

    #[test]
    fn test_update_without_base_renders_full_layout() {
        let pool = frame_with(&[0, 0, 0, 0], &[0; 12], 2, 2);
        let slot = pool.slot(0).read().unwrap();
        let mut scratch = DepthScratch::default();
        scratch
            .render(DepthFormat::PixelDepthUpdate, &Calibration::default(), &slot)
            .unwrap();
        assert_eq!(&scratch.f64[9..11], &[1.0, 1.0]);
    }

    #[test]
    fn test_vertex_color_samples_color_plane() {
        let mut calib = Calibration::default();
        calib.rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        calib.translation = [0.0; 3];
        let pool = frame_with(&[500, RAW_INVALID], &[255, 0, 0, 255, 0, 0], 2, 1);
        let slot = pool.slot(0).read().unwrap();
        let mut scratch = DepthScratch::default();
        scratch.render(DepthFormat::VertexColor, &calib, &slot).unwrap();
        assert_eq!(scratch.f64.len(), 12);
        assert_eq!(&scratch.f64[3..6], &[1.0, 0.0, 0.0]);
        assert!(scratch.f64[6..12].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_vertex_texcoord_is_unclamped_reprojection() {
        let mut calib = Calibration::default();
        // Shift the color camera far enough that texture coordinates leave the image.
        calib.translation = [1.0, 0.0, 0.0];
        let pool = frame_with(&[RAW_INVALID, 600], &[0; 6], 2, 1);
        let slot = pool.slot(0).read().unwrap();
        let mut scratch = DepthScratch::default();
        scratch.render(DepthFormat::VertexTexcoord, &calib, &slot).unwrap();
        assert_eq!(scratch.f64.len(), 10);
        assert!(scratch.f64[..5].iter().all(|v| v.is_nan()));

        let z = DepthModel::Linear.depth(600).unwrap();
        let p = unproject(&calib.depth, 1.0, 0.0, z);
        let uv = reproject(&calib, p);
        let v = &scratch.f64[5..10];
        for (got, want) in v[..3].iter().zip(p) {
            assert!(approx(*got, want, 1e-12));
        }
        assert!(approx(v[3], uv[0], 1e-9));
        assert!(approx(v[4], uv[1], 1e-9));
        assert!(v[3] > 2.0, "tx = {} should not be clamped to the image", v[3]);
    }
}
