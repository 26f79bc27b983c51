/// Color stream selection at open time.
///
/// The numeric values match the `bayerFilterMode` argument of `dc_open`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoFormat {
    /// Unfiltered 8-bit Bayer sensor data, one byte per pixel.
    Bayer = 0,
    /// Driver-side demosaiced RGB8.
    #[default]
    Rgb = 1,
    /// 8-bit infrared image from the depth camera.
    Ir = 2,
}

impl VideoFormat {
    /// Bytes per color plane pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            VideoFormat::Rgb => 3,
            VideoFormat::Bayer | VideoFormat::Ir => 1,
        }
    }
}

impl TryFrom<i32> for VideoFormat {
    type Error = crate::DepthcamError;

    fn try_from(value: i32) -> crate::Result<Self> {
        match value {
            0 => Ok(VideoFormat::Bayer),
            1 => Ok(VideoFormat::Rgb),
            2 => Ok(VideoFormat::Ir),
            other => Err(crate::DepthcamError::Configuration(format!(
                "bayerFilterMode {} not supported (expected 0, 1 or 2)",
                other
            ))),
        }
    }
}

/// Negotiated geometry of one stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMode {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel in the driver's delivery format.
    pub bytes_per_pixel: u32,
}

impl FrameMode {
    pub const fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Plane size in bytes, `None` on overflow.
    pub fn byte_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.bytes_per_pixel as usize)
    }
}

/// 11-bit depth at 640x480, stored as 16-bit samples.
pub const DEPTH_MODE_11BIT: FrameMode = FrameMode::new(640, 480, 2);

/// What the capture worker does when every slot holds an unread frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Idle until the consumer releases a slot; new frames are dropped.
    #[default]
    Stall = 0,
    /// Keep capturing and overwrite the oldest unread frames.
    Overwrite = 1,
}

/// How `grab_frame` behaves when no frame is pending.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Return [`GrabStatus::NoFrame`] immediately.
    Poll = 0,
    /// Wait until a frame arrives or the capture stops.
    #[default]
    Block = 1,
}

/// Outcome of a `grab_frame` call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabStatus {
    NoFrame = 0,
    FrameReady = 1,
    /// Capture stopped while waiting (driver failure or emergency stop).
    Error = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrabResult {
    pub status: GrabStatus,
    /// Capture time in seconds on the context clock, -1 when no frame.
    pub timestamp: f64,
    /// Frames pending including the leased one.
    pub pending: u64,
}

impl GrabResult {
    pub(crate) fn empty(status: GrabStatus) -> Self {
        Self {
            status,
            timestamp: -1.0,
            pending: 0,
        }
    }
}

/// Values reported by `start`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartInfo {
    pub start_time: f64,
    pub fps: f64,
    pub color_width: u32,
    pub color_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
}

/// Snapshot of the session's ring state.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub running: bool,
    pub read_position: u64,
    pub record_position: u64,
    /// Complete frames that can still be grabbed.
    pub pending: u64,
    pub xruns: u64,
    pub frame_leased: bool,
}

/// OpenGL pixel format tokens handed to texture upload code.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlFormat {
    Luminance8 = 0x8040,
    Rgb8 = 0x8051,
}

/// OpenGL component type tokens.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlType {
    UnsignedByte = 0x1401,
    UnsignedShort = 0x1403,
    Float = 0x1406,
    Double = 0x140A,
}

/// Image selector for `Session::image`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageKind {
    /// The color plane as delivered (RGB8, Bayer or IR).
    #[default]
    Color = 0,
    /// False-color RGB8 rendering of the raw disparity.
    FalseColorDepth = 1,
}

impl From<i32> for ImageKind {
    fn from(value: i32) -> Self {
        if value == 1 {
            ImageKind::FalseColorDepth
        } else {
            ImageKind::Color
        }
    }
}

/// An 8-bit image copied out of the leased frame.
#[derive(Debug, Clone)]
pub struct Image {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub format: GlFormat,
    pub component_type: GlType,
}

/// Depth output layouts, numbered as the `format` argument of `dc_get_depth_image`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthFormat {
    /// Raw disparity as f64.
    Raw = 0,
    /// Metric z in meters as f64.
    Metric = 1,
    /// `(x, y, z, r, g, b)` vertices with nearest-neighbor colors in [0, 1].
    VertexColor = 2,
    /// `(x, y, z, tx, ty)` vertices with color-image texture coordinates.
    VertexTexcoord = 3,
    /// `(px, py, z)`: pixel coordinates and metric z.
    PixelDepth = 4,
    /// Refresh only the z component of a `PixelDepth` grid.
    PixelDepthUpdate = 5,
    /// `(index, raw)` f32 pairs for shader-side reconstruction.
    IndexRaw = 6,
    /// Refresh only the raw component of an `IndexRaw` buffer.
    IndexRawUpdate = 7,
    /// Raw disparity as u16, untouched.
    RawU16 = 8,
}

impl TryFrom<i32> for DepthFormat {
    type Error = crate::DepthcamError;

    fn try_from(value: i32) -> crate::Result<Self> {
        Ok(match value {
            0 => DepthFormat::Raw,
            1 => DepthFormat::Metric,
            2 => DepthFormat::VertexColor,
            3 => DepthFormat::VertexTexcoord,
            4 => DepthFormat::PixelDepth,
            5 => DepthFormat::PixelDepthUpdate,
            6 => DepthFormat::IndexRaw,
            7 => DepthFormat::IndexRawUpdate,
            8 => DepthFormat::RawU16,
            other => {
                return Err(crate::DepthcamError::Configuration(format!(
                    "depth format {} out of range 0..=8",
                    other
                )))
            }
        })
    }
}

impl DepthFormat {
    /// Values per depth pixel in the output buffer.
    pub fn components(self) -> u32 {
        match self {
            DepthFormat::Raw | DepthFormat::Metric | DepthFormat::RawU16 => 1,
            DepthFormat::VertexColor => 6,
            DepthFormat::VertexTexcoord => 5,
            DepthFormat::PixelDepth | DepthFormat::PixelDepthUpdate => 3,
            DepthFormat::IndexRaw | DepthFormat::IndexRawUpdate => 2,
        }
    }

    pub fn component_type(self) -> GlType {
        match self {
            DepthFormat::IndexRaw | DepthFormat::IndexRawUpdate => GlType::Float,
            DepthFormat::RawU16 => GlType::UnsignedShort,
            _ => GlType::Double,
        }
    }
}

/// Depth output buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DepthData {
    F64(Vec<f64>),
    F32(Vec<f32>),
    U16(Vec<u16>),
}

impl DepthData {
    pub fn len(&self) -> usize {
        match self {
            DepthData::F64(v) => v.len(),
            DepthData::F32(v) => v.len(),
            DepthData::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DepthImage {
    pub data: DepthData,
    pub width: u32,
    pub height: u32,
    pub components: u32,
    pub component_type: GlType,
}

/// Pinhole intrinsics `[fx, fy, cx, cy]` in pixels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn to_array(&self) -> [f64; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }

    pub fn from_array(v: [f64; 4]) -> Self {
        Self {
            fx: v[0],
            fy: v[1],
            cx: v[2],
            cy: v[3],
        }
    }
}

/// Geometric calibration of the depth/color camera pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub depth: Intrinsics,
    pub color: Intrinsics,
    /// Row-major rotation of the color camera relative to the depth camera.
    pub rotation: [[f64; 3]; 3],
    /// Translation of the color camera relative to the depth camera, meters.
    pub translation: [f64; 3],
    /// Depth lens distortion `k1, k2, p1, p2, k3`.
    pub depth_undistort: [f64; 5],
    /// Color lens distortion `k1, k2, p1, p2, k3`.
    pub color_undistort: [f64; 5],
    /// `[base, offset]`; selects the disparity-to-depth model.
    pub depth_base_and_offset: [f64; 2],
}

impl Default for Calibration {
    /// Typical Kinect values; good enough for testing an uncalibrated unit.
    fn default() -> Self {
        Self {
            depth: Intrinsics {
                fx: 5.9421434211923247e+02,
                fy: 5.9104053696870778e+02,
                cx: 3.3930780975300314e+02,
                cy: 2.4273913761751615e+02,
            },
            color: Intrinsics {
                fx: 5.2921508098293293e+02,
                fy: 5.2556393630057437e+02,
                cx: 3.2894272028759258e+02,
                cy: 2.6748068171871557e+02,
            },
            rotation: [
                [9.9984628826577793e-01, 1.2635359098409581e-03, -1.7487233004436643e-02],
                [-1.4779096108364480e-03, 9.9992385683542895e-01, -1.2251380107679535e-02],
                [1.7470421412464927e-02, 1.2275341476520762e-02, 9.9977202419716948e-01],
            ],
            translation: [
                1.9985242312092553e-02,
                -7.4423738761617583e-04,
                -1.0916736334336222e-02,
            ],
            depth_undistort: [
                -2.6386489753128833e-01,
                9.9966832163729757e-01,
                -7.6275862143610667e-04,
                5.0350940090814270e-03,
                -1.3053628089976321e+00,
            ],
            color_undistort: [
                2.6451622333009589e-01,
                -8.3990749424620825e-01,
                -1.9922302173693159e-03,
                1.4371995932897616e-03,
                9.1192465078713847e-01,
            ],
            depth_base_and_offset: [0.0, 0.0],
        }
    }
}

/// Partial calibration update; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationUpdate {
    pub depth: Option<Intrinsics>,
    pub color: Option<Intrinsics>,
    pub rotation: Option<[[f64; 3]; 3]>,
    pub translation: Option<[f64; 3]>,
    pub depth_undistort: Option<[f64; 5]>,
    pub color_undistort: Option<[f64; 5]>,
    pub depth_base_and_offset: Option<[f64; 2]>,
}

impl CalibrationUpdate {
    pub fn apply(&self, calibration: &mut Calibration) {
        if let Some(v) = self.depth {
            calibration.depth = v;
        }
        if let Some(v) = self.color {
            calibration.color = v;
        }
        if let Some(v) = self.rotation {
            calibration.rotation = v;
        }
        if let Some(v) = self.translation {
            calibration.translation = v;
        }
        if let Some(v) = self.depth_undistort {
            calibration.depth_undistort = v;
        }
        if let Some(v) = self.color_undistort {
            calibration.color_undistort = v;
        }
        if let Some(v) = self.depth_base_and_offset {
            calibration.depth_base_and_offset = v;
        }
    }
}

bitflags::bitflags! {
    /// Kinect sub-devices present on one USB hub.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Subdevices: u32 {
        const CAMERA = 1 << 0;
        const MOTOR  = 1 << 1;
        const AUDIO  = 1 << 2;
    }
}

/// A camera found on the USB bus.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: i32,
    pub bus_number: u8,
    pub address: u8,
    pub subdevices: Subdevices,
}

/// Front LED states understood by the motor sub-device.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Off = 0,
    Green = 1,
    Red = 2,
    Yellow = 3,
    BlinkGreen = 4,
    BlinkRedYellow = 6,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltStatus {
    Stopped = 0x00,
    Limit = 0x01,
    Moving = 0x04,
}

/// Motor and accelerometer readout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltState {
    /// Raw accelerometer counts, roughly 819 per g.
    pub accelerometer: [i16; 3],
    /// Tilt angle in degrees, `None` while the motor reports no valid angle.
    pub angle: Option<f64>,
    pub status: TiltStatus,
}
