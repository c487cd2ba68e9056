//! Read-only capability descriptors.
//!
//! [`Capabilities`](crate::capabilities::Capabilities) mirrors the shape of
//! [`Properties`](crate::properties::Properties): one entry per stream, each
//! describing what the selected camera and storage devices can do. Before a
//! configuration is applied every leaf is zeroed and non-writable; after
//! [`apply_configuration`](crate::runtime::Runtime::apply_configuration)
//! the tree reflects the selected devices.

use crate::core::SampleType;
use serde::{Deserialize, Serialize};

/// Value class of a capability leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Integer-valued.
    #[default]
    FixedPrecision,
    /// Float-valued.
    FloatingPrecision,
    /// One of an enumerated set.
    Enumerated,
    /// Free-form text.
    String,
}

/// One tunable property: its range and whether it can be written.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Property {
    /// Whether configuration can change this property.
    pub writable: bool,
    /// Inclusive lower bound (0 when not writable).
    pub low: f32,
    /// Inclusive upper bound (0 when not writable).
    pub high: f32,
    /// Value class.
    pub kind: PropertyKind,
}

impl Property {
    /// A writable fixed-precision property with the given range.
    pub fn fixed(low: f32, high: f32) -> Self {
        Self {
            writable: true,
            low,
            high,
            kind: PropertyKind::FixedPrecision,
        }
    }

    /// A non-writable property; range reads back as `[0, 0]`.
    pub fn read_only() -> Self {
        Self::default()
    }
}

/// Range of a two-axis pixel quantity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisProperties {
    /// Horizontal axis.
    pub x: Property,
    /// Vertical axis.
    pub y: Property,
}

/// Which digital lines can serve a camera event, as line bitmasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerLineCapabilities {
    /// Lines usable as an input gate for this event (bit `n` = line `n`).
    pub input: u8,
    /// Lines usable as an output pulse for this event.
    pub output: u8,
}

/// Trigger support per camera event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraTriggerCapabilities {
    /// Acquisition-start gating.
    pub acquisition_start: TriggerLineCapabilities,
    /// Exposure gating.
    pub exposure: TriggerLineCapabilities,
    /// Frame-start gating. The simulated cameras accept a software input
    /// here (line 0).
    pub frame_start: TriggerLineCapabilities,
}

/// The camera's digital line bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalLineCapabilities {
    /// Number of usable lines.
    pub line_count: u8,
    /// Line names; unused slots are empty strings. Always 8 entries.
    pub names: Vec<String>,
}

impl Default for DigitalLineCapabilities {
    fn default() -> Self {
        Self {
            line_count: 0,
            names: vec![String::new(); 8],
        }
    }
}

/// Everything a camera device reports about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraCapabilities {
    /// Frame shape range per axis.
    pub shape: AxisProperties,
    /// Region-of-interest offset range per axis.
    pub offset: AxisProperties,
    /// Binning factor range.
    pub binning: Property,
    /// Exposure range in microseconds.
    pub exposure_time_us: Property,
    /// Line interval; read-only on the simulated cameras.
    pub line_interval_us: Property,
    /// Readout direction; read-only on the simulated cameras.
    pub readout_direction: Property,
    /// Sample formats the camera can produce.
    pub supported_pixel_types: Vec<SampleType>,
    /// Digital line bank.
    pub digital_lines: DigitalLineCapabilities,
    /// Trigger support per event.
    pub triggers: CameraTriggerCapabilities,
}

/// What the selected storage backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageCapabilities {
    /// Chunked array commit.
    pub chunking_is_supported: bool,
    /// Grouping chunks into shard files.
    pub sharding_is_supported: bool,
    /// Downsampled pyramid levels.
    pub multiscale_is_supported: bool,
}

/// Capabilities for one stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoStreamCapabilities {
    /// Camera-side capabilities.
    pub camera: CameraCapabilities,
    /// Storage-side capabilities.
    pub storage: StorageCapabilities,
    /// Range of the stream frame budget.
    pub max_frame_count: Property,
    /// Range of the in-pipeline averaging window.
    pub frame_average_count: Property,
}

/// The full capability tree, one entry per stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Per-stream capabilities, indexed by stream id.
    pub video: Vec<VideoStreamCapabilities>,
}
