//! Core domain types shared across the acquisition runtime.
//!
//! Everything here is a plain value type: device identities, sample formats,
//! trigger descriptions, and the frame record that flows from a camera
//! source through the packet buffer into a storage sink. The runtime's
//! behavior lives in [`crate::runtime`] and [`crate::stream`]; this module
//! only defines the vocabulary.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Device identity
// ============================================================================

/// The class of a device known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    /// A frame source.
    Camera,
    /// A frame sink.
    Storage,
    /// No device selected. The default identifier carries this kind.
    #[default]
    None,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => write!(f, "Camera"),
            DeviceKind::Storage => write!(f, "Storage"),
            DeviceKind::None => write!(f, "None"),
        }
    }
}

/// A resolved reference to one device in the registry.
///
/// `id` is `(driver_id, device_id)`: the driver's slot in the registry and
/// the device's slot within that driver. Selection consistency is equality
/// over every field, so a round trip through [`name`](Self::name) and
/// another `select` yields an identical value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentifier {
    /// `(driver_id, device_id)` registry coordinates.
    pub id: (u8, u8),
    /// Device class.
    pub kind: DeviceKind,
    /// Human-readable device name, unique within its kind.
    pub name: String,
}

impl DeviceIdentifier {
    /// Whether this identifier refers to an actual device.
    pub fn is_selected(&self) -> bool {
        self.kind != DeviceKind::None
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

// ============================================================================
// Sample formats
// ============================================================================

/// Pixel sample format of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SampleType {
    /// Unsigned 8-bit.
    #[default]
    U8,
    /// Unsigned 16-bit, little-endian on disk.
    U16,
    /// Signed 8-bit.
    I8,
    /// Signed 16-bit, little-endian on disk.
    I16,
    /// 32-bit float, little-endian on disk.
    F32,
}

impl SampleType {
    /// All formats the simulated cameras can produce.
    pub const ALL: [SampleType; 5] = [
        SampleType::U8,
        SampleType::U16,
        SampleType::I8,
        SampleType::I16,
        SampleType::F32,
    ];

    /// Size of one sample in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::F32 => 4,
        }
    }

    /// Zarr v2 dtype string (NumPy typestr).
    pub fn zarr2_dtype(&self) -> &'static str {
        match self {
            SampleType::U8 => "|u1",
            SampleType::U16 => "<u2",
            SampleType::I8 => "|i1",
            SampleType::I16 => "<i2",
            SampleType::F32 => "<f4",
        }
    }

    /// Zarr v3 data type name.
    pub fn zarr3_dtype(&self) -> &'static str {
        match self {
            SampleType::U8 => "uint8",
            SampleType::U16 => "uint16",
            SampleType::I8 => "int8",
            SampleType::I16 => "int16",
            SampleType::F32 => "float32",
        }
    }

    /// TIFF `(BitsPerSample, SampleFormat)` tag values.
    pub fn tiff_format(&self) -> (u16, u16) {
        match self {
            SampleType::U8 => (8, 1),
            SampleType::U16 => (16, 1),
            SampleType::I8 => (8, 2),
            SampleType::I16 => (16, 2),
            SampleType::F32 => (32, 3),
        }
    }

    /// Read sample `idx` from a little-endian sample buffer as `f64`.
    ///
    /// Out-of-range reads return 0.0; callers are expected to stay within
    /// the frame extent.
    pub fn read_f64(&self, data: &[u8], idx: usize) -> f64 {
        let s = self.bytes_per_sample();
        let at = idx * s;
        if at + s > data.len() {
            return 0.0;
        }
        match self {
            SampleType::U8 => f64::from(data[at]),
            SampleType::I8 => f64::from(data[at] as i8),
            SampleType::U16 => f64::from(u16::from_le_bytes([data[at], data[at + 1]])),
            SampleType::I16 => f64::from(i16::from_le_bytes([data[at], data[at + 1]])),
            SampleType::F32 => f64::from(f32::from_le_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ])),
        }
    }

    /// Write sample `idx` into a little-endian sample buffer, saturating
    /// integer formats.
    pub fn write_f64(&self, data: &mut [u8], idx: usize, value: f64) {
        let s = self.bytes_per_sample();
        let at = idx * s;
        if at + s > data.len() {
            return;
        }
        match self {
            SampleType::U8 => data[at] = value.clamp(0.0, f64::from(u8::MAX)) as u8,
            SampleType::I8 => {
                data[at] = (value.clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8) as u8;
            }
            SampleType::U16 => {
                let v = value.clamp(0.0, f64::from(u16::MAX)) as u16;
                data[at..at + 2].copy_from_slice(&v.to_le_bytes());
            }
            SampleType::I16 => {
                let v = value.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
                data[at..at + 2].copy_from_slice(&v.to_le_bytes());
            }
            SampleType::F32 => {
                data[at..at + 4].copy_from_slice(&(value as f32).to_le_bytes());
            }
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.zarr3_dtype())
    }
}

/// Sensor readout direction. Simulated cameras only report `Forward`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadoutDirection {
    /// Top-to-bottom readout.
    #[default]
    Forward,
    /// Bottom-to-top readout.
    Backward,
}

// ============================================================================
// Triggers
// ============================================================================

/// Direction of a digital trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalIOKind {
    /// The line gates a camera event.
    #[default]
    Input,
    /// The camera emits a pulse on the line.
    Output,
}

/// Edge sensitivity of a trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerEdge {
    /// Fire on the rising edge.
    Rising,
    /// Fire on the falling edge.
    Falling,
    /// Edge selection does not apply (line disabled).
    #[default]
    NotApplicable,
}

/// One digital trigger line binding.
///
/// Defaults to disabled; a trigger only takes effect after it is applied via
/// configuration and accepted by the device (the configuration read-back is
/// authoritative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trigger {
    /// Whether the line participates at all.
    pub enable: bool,
    /// Digital line index. The simulated cameras expose a single line 0,
    /// named `"software"`.
    pub line: u8,
    /// Input or output.
    pub kind: SignalIOKind,
    /// Edge sensitivity.
    pub edge: TriggerEdge,
}

impl Trigger {
    /// An enabled rising-edge input on the given line.
    pub fn rising_input(line: u8) -> Self {
        Self {
            enable: true,
            line,
            kind: SignalIOKind::Input,
            edge: TriggerEdge::Rising,
        }
    }
}

/// Camera events that can be gated by an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputTriggers {
    /// Gates the start of the whole acquisition.
    pub acquisition_start: Trigger,
    /// Gates each frame. Enabling this on the software line makes the
    /// stream advance only on `execute_trigger`.
    pub frame_start: Trigger,
    /// Gates the exposure window.
    pub exposure: Trigger,
}

/// Camera events that can emit a pulse on an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputTriggers {
    /// Pulse during exposure.
    pub exposure: Trigger,
    /// Pulse at frame start.
    pub frame_start: Trigger,
    /// Pulse while waiting for a trigger.
    pub trigger_wait: Trigger,
}

// ============================================================================
// Frames
// ============================================================================

/// Capture timestamps attached to every frame, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFrameTimestamps {
    /// Sensor clock at exposure, relative to stream start.
    pub hardware: u64,
    /// Wall clock (UNIX epoch) when the acquisition task picked the frame up.
    pub acq_thread: u64,
}

/// Per-frame metadata delivered alongside the sample data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFrameMetadata {
    /// Position in the stream's frame sequence. Monotonic and contiguous
    /// absent drops.
    pub frame_id: u64,
    /// Capture timestamps.
    pub timestamps: VideoFrameTimestamps,
}

/// One captured frame: metadata plus a shared sample buffer.
///
/// The payload is a [`Bytes`] handle so the packet buffer and the storage
/// writer can hold the same allocation without copying.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame id and timestamps.
    pub metadata: VideoFrameMetadata,
    /// `(width, height)` in pixels, after binning.
    pub shape: (u32, u32),
    /// Sample format of `data`.
    pub sample_type: SampleType,
    /// Row-major sample data, rows of `shape.0` samples.
    pub data: Bytes,
}

impl VideoFrame {
    /// Number of samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.shape.0 as usize * self.shape.1 as usize
    }
}

// ============================================================================
// Runtime state
// ============================================================================

/// Aggregate lifecycle state of the runtime, as reported by
/// [`Runtime::state`](crate::runtime::Runtime::state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceState {
    /// Constructed, nothing configured yet.
    #[default]
    AwaitingConfiguration,
    /// A configuration has been applied and validated.
    Armed,
    /// At least one stream is acquiring.
    Running,
    /// Shut down; the handle can no longer be used.
    Closed,
}
