//! Per-stream acquisition configuration.
//!
//! A [`Properties`] value is the whole request handed to
//! [`apply_configuration`](crate::runtime::Runtime::apply_configuration):
//! one [`VideoStreamProperties`] per stream, each pairing a camera
//! identifier + settings with a storage identifier + settings. The runtime
//! returns an *effective* copy with device-clamped values; the read-back is
//! authoritative, not an echo of the request.

use crate::core::{
    DeviceIdentifier, InputTriggers, OutputTriggers, ReadoutDirection, SampleType,
};
use crate::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of video streams a default configuration carries.
pub const VIDEO_STREAM_COUNT: usize = 2;

// ============================================================================
// Camera side
// ============================================================================

/// Requested sensor configuration for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Exposure per frame in microseconds. 0 lets the source free-run as
    /// fast as it can.
    pub exposure_time_us: f32,
    /// Sensor line interval in microseconds. Read-only on the simulated
    /// cameras; the effective configuration reports the device value.
    pub line_interval_us: f32,
    /// Sensor readout direction. Read-only on the simulated cameras.
    pub readout_direction: ReadoutDirection,
    /// Pixel binning factor applied on the sensor.
    pub binning: u8,
    /// Output sample format.
    pub pixel_type: SampleType,
    /// Region-of-interest origin `(x, y)` in sensor pixels.
    pub offset: (u32, u32),
    /// Region-of-interest size `(width, height)` in sensor pixels.
    pub shape: (u32, u32),
    /// Input trigger lines.
    pub input_triggers: InputTriggers,
    /// Output trigger lines.
    pub output_triggers: OutputTriggers,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure_time_us: 0.0,
            line_interval_us: 0.0,
            readout_direction: ReadoutDirection::Forward,
            binning: 1,
            pixel_type: SampleType::U8,
            offset: (0, 0),
            shape: (1920, 1080),
            input_triggers: InputTriggers::default(),
            output_triggers: OutputTriggers::default(),
        }
    }
}

/// Camera identifier plus its requested settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraProperties {
    /// Which camera; `DeviceKind::None` (the default) means unconfigured.
    pub identifier: DeviceIdentifier,
    /// Requested sensor settings.
    pub settings: CameraSettings,
}

// ============================================================================
// Storage side
// ============================================================================

/// Semantic class of one storage dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DimensionKind {
    /// A spatial axis.
    #[default]
    Space,
    /// A channel axis.
    Channel,
    /// The time axis.
    Time,
    /// Anything else.
    Other,
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionKind::Space => write!(f, "space"),
            DimensionKind::Channel => write!(f, "channel"),
            DimensionKind::Time => write!(f, "time"),
            DimensionKind::Other => write!(f, "other"),
        }
    }
}

/// One axis of the committed array.
///
/// Dimensions are listed fastest-varying first (`x, y, [c,] append`); the
/// on-disk array shape is the reverse. `array_size_px == 0` marks the
/// append axis, which grows with the frame count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDimension {
    /// Axis name as recorded in sink metadata.
    pub name: String,
    /// Semantic class, used for multiscale decisions and OME axis types.
    pub kind: DimensionKind,
    /// Full extent in samples; 0 means unbounded (append axis).
    pub array_size_px: u32,
    /// Chunk extent in samples along this axis.
    pub chunk_size_px: u32,
    /// Chunks per shard along this axis; 0 disables sharding.
    #[serde(default)]
    pub shard_size_chunks: u32,
}

impl StorageDimension {
    /// A spatial axis.
    pub fn space(name: &str, array_size_px: u32, chunk_size_px: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: DimensionKind::Space,
            array_size_px,
            chunk_size_px,
            shard_size_chunks: 0,
        }
    }

    /// A channel axis.
    pub fn channel(name: &str, array_size_px: u32, chunk_size_px: u32) -> Self {
        Self {
            kind: DimensionKind::Channel,
            ..Self::space(name, array_size_px, chunk_size_px)
        }
    }

    /// A time axis. `array_size_px == 0` makes it the append axis.
    pub fn time(name: &str, array_size_px: u32, chunk_size_px: u32) -> Self {
        Self {
            kind: DimensionKind::Time,
            ..Self::space(name, array_size_px, chunk_size_px)
        }
    }

    /// Set the shard granularity along this axis.
    pub fn with_shard(mut self, shard_size_chunks: u32) -> Self {
        self.shard_size_chunks = shard_size_chunks;
        self
    }

    /// Whether this axis is the unbounded append axis.
    pub fn is_append(&self) -> bool {
        self.array_size_px == 0
    }
}

/// Requested sink configuration for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Output location. A bare name is resolved against the application
    /// data root by the CLI; the library takes it verbatim.
    #[serde(alias = "filename")]
    pub uri: String,
    /// Opaque caller metadata (typically JSON) attached to the sink at
    /// finalization, trimmed of trailing whitespace first.
    pub external_metadata_json: Option<String>,
    /// Offset added to the frame ids the sink records.
    pub first_frame_id: u64,
    /// Physical pixel pitch `(x, y)` in micrometers.
    pub pixel_scale_um: (f64, f64),
    /// Array layout, fastest-varying axis first. Empty means "frames only"
    /// (valid for the non-chunked sinks).
    pub acquisition_dimensions: Vec<StorageDimension>,
    /// Derive a downsampled pyramid from the base level (Zarr v2 only).
    pub enable_multiscale: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            uri: String::new(),
            external_metadata_json: None,
            first_frame_id: 0,
            pixel_scale_um: (1.0, 1.0),
            acquisition_dimensions: Vec::new(),
            enable_multiscale: false,
        }
    }
}

impl StorageSettings {
    /// Structural dimension checks that hold for every sink: at most one
    /// append axis, and it must be the last (slowest-varying) entry.
    pub fn validate_dimensions(&self) -> AcqResult<()> {
        let dims = &self.acquisition_dimensions;
        let append_count = dims.iter().filter(|d| d.is_append()).count();
        if append_count > 1 {
            return Err(AcqError::Config(format!(
                "{} dimensions have array_size_px == 0; at most one append axis is allowed",
                append_count
            )));
        }
        if let Some(pos) = dims.iter().position(StorageDimension::is_append) {
            if pos != dims.len() - 1 {
                return Err(AcqError::Config(format!(
                    "append axis '{}' must be the last dimension",
                    dims[pos].name
                )));
            }
        }
        for d in dims {
            if d.chunk_size_px == 0 {
                return Err(AcqError::Config(format!(
                    "dimension '{}' has chunk_size_px == 0",
                    d.name
                )));
            }
        }
        Ok(())
    }

    /// The append axis, if one is configured.
    pub fn append_dimension(&self) -> Option<&StorageDimension> {
        self.acquisition_dimensions.iter().find(|d| d.is_append())
    }
}

/// Storage identifier plus its requested settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageProperties {
    /// Which sink; `DeviceKind::None` (the default) means unconfigured.
    pub identifier: DeviceIdentifier,
    /// Requested sink settings.
    pub settings: StorageSettings,
}

// ============================================================================
// Stream and top-level properties
// ============================================================================

/// Everything one stream needs: a source, a sink, and its frame budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoStreamProperties {
    /// Frame source.
    pub camera: CameraProperties,
    /// Frame sink.
    pub storage: StorageProperties,
    /// The stream stops producing once this many output frames exist.
    /// `u64::MAX` means unbounded (stop with [`abort`] or [`stop`]).
    ///
    /// [`abort`]: crate::runtime::Runtime::abort
    /// [`stop`]: crate::runtime::Runtime::stop
    pub max_frame_count: u64,
    /// Average this many raw frames into one output frame; 0 disables
    /// averaging.
    pub frame_average_count: u32,
}

impl Default for VideoStreamProperties {
    fn default() -> Self {
        Self {
            camera: CameraProperties::default(),
            storage: StorageProperties::default(),
            max_frame_count: u64::MAX,
            frame_average_count: 0,
        }
    }
}

impl VideoStreamProperties {
    /// Whether this stream has a camera selected.
    pub fn is_configured(&self) -> bool {
        self.camera.identifier.is_selected()
    }
}

/// The full acquisition configuration: one entry per stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Properties {
    /// Per-stream configuration, indexed by stream id.
    pub video: Vec<VideoStreamProperties>,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            video: (0..VIDEO_STREAM_COUNT)
                .map(|_| VideoStreamProperties::default())
                .collect(),
        }
    }
}
