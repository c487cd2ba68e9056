//! Software cameras that synthesize frames.
//!
//! Three patterns are registered: `uniform random` (noise over the full
//! sample range), `radial sin` (an animated radial sine, useful for eyeball
//! checks of orientation and binning), and `empty` (zeroed frames at the
//! highest rate the host can manage).

use crate::camera::Camera;
use crate::capabilities::{
    AxisProperties, CameraCapabilities, CameraTriggerCapabilities, DigitalLineCapabilities,
    Property, TriggerLineCapabilities,
};
use crate::core::{
    DeviceIdentifier, DeviceState, ReadoutDirection, SampleType, VideoFrame, VideoFrameMetadata,
    VideoFrameTimestamps,
};
use crate::error::{AcqError, AcqResult};
use crate::properties::CameraSettings;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::time::Duration;
use tokio::time::{sleep, Instant};

// ============================================================================
// Patterns
// ============================================================================

/// Which synthetic image a [`SimulatedCamera`] draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Every sample drawn uniformly over the sample type's range.
    UniformRandom,
    /// A radial sine animated over the frame counter.
    RadialSin,
    /// All-zero frames.
    Empty,
}

impl Pattern {
    fn from_device_name(name: &str) -> Option<Self> {
        match name {
            "simulated: uniform random" => Some(Self::UniformRandom),
            "simulated: radial sin" => Some(Self::RadialSin),
            "simulated: empty" => Some(Self::Empty),
            _ => None,
        }
    }
}

// ============================================================================
// Camera
// ============================================================================

/// A camera that synthesizes frames in software.
pub struct SimulatedCamera {
    identifier: DeviceIdentifier,
    pattern: Pattern,
    settings: CameraSettings,
    state: DeviceState,
    frame_id: u64,
    epoch: Option<Instant>,
    rng: StdRng,
}

impl SimulatedCamera {
    /// Build the camera an identifier names, or `None` when the name is not
    /// one of the simulated devices.
    pub fn from_identifier(identifier: &DeviceIdentifier) -> Option<Self> {
        let pattern = Pattern::from_device_name(&identifier.name)?;
        Some(Self {
            identifier: identifier.clone(),
            pattern,
            settings: CameraSettings::default(),
            state: DeviceState::AwaitingConfiguration,
            frame_id: 0,
            epoch: None,
            rng: StdRng::from_entropy(),
        })
    }

    fn fill_uniform_random(&mut self, sample_type: SampleType, data: &mut [u8]) {
        match sample_type {
            // Any bit pattern is a valid integer sample, so raw bytes are
            // already uniform over the type's range.
            SampleType::U8 | SampleType::U16 | SampleType::I8 | SampleType::I16 => {
                self.rng.fill_bytes(data);
            }
            SampleType::F32 => {
                for sample in data.chunks_exact_mut(4) {
                    let v: f32 = self.rng.gen_range(0.0..1.0);
                    sample.copy_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    fn fill_radial_sin(&self, sample_type: SampleType, data: &mut [u8]) {
        let (w, h) = self.settings.shape;
        let (ox, oy) = self.settings.offset;
        let bin = f64::from(self.settings.binning.max(1));
        let cx = (f64::from(w) - 1.0) / 2.0;
        let cy = (f64::from(h) - 1.0) / 2.0;
        let t = self.frame_id as f64 * 0.1;

        let mut idx = 0;
        for y in 0..h {
            let dy = (f64::from(y + oy) - cy) * bin;
            for x in 0..w {
                let dx = (f64::from(x + ox) - cx) * bin;
                let r = (dx * dx + dy * dy).sqrt();
                let v01 = 0.5 * (1.0 + (r / 8.0 - t).sin());
                sample_type.write_f64(data, idx, scale_to_range(sample_type, v01));
                idx += 1;
            }
        }
    }

    fn synthesize(&mut self) -> VideoFrame {
        let sample_type = self.settings.pixel_type;
        let (w, h) = self.settings.shape;
        let nbytes = w as usize * h as usize * sample_type.bytes_per_sample();
        let mut data = vec![0u8; nbytes];

        match self.pattern {
            Pattern::Empty => {}
            Pattern::UniformRandom => self.fill_uniform_random(sample_type, &mut data),
            Pattern::RadialSin => self.fill_radial_sin(sample_type, &mut data),
        }

        let hardware = self
            .epoch
            .map(|e| e.elapsed().as_nanos() as u64)
            .unwrap_or_default();
        let acq_thread = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;

        let frame = VideoFrame {
            metadata: VideoFrameMetadata {
                frame_id: self.frame_id,
                timestamps: VideoFrameTimestamps {
                    hardware,
                    acq_thread,
                },
            },
            shape: (w, h),
            sample_type,
            data: Bytes::from(data),
        };
        self.frame_id += 1;
        frame
    }
}

/// Map a value in `[0, 1]` to the sample type's full scale.
fn scale_to_range(sample_type: SampleType, v01: f64) -> f64 {
    match sample_type {
        SampleType::U8 => v01 * 255.0,
        SampleType::U16 => v01 * 65535.0,
        SampleType::I8 => v01 * 255.0 - 128.0,
        SampleType::I16 => v01 * 65535.0 - 32768.0,
        SampleType::F32 => v01,
    }
}

fn clamp_u32(value: u32, property: &Property) -> u32 {
    (f64::from(value)).clamp(f64::from(property.low), f64::from(property.high)) as u32
}

#[async_trait]
impl Camera for SimulatedCamera {
    fn identifier(&self) -> &DeviceIdentifier {
        &self.identifier
    }

    fn capabilities(&self) -> CameraCapabilities {
        let mut digital_lines = DigitalLineCapabilities {
            line_count: 1,
            ..Default::default()
        };
        digital_lines.names[0] = "software".to_string();

        CameraCapabilities {
            shape: AxisProperties {
                x: Property::fixed(1.0, 8192.0),
                y: Property::fixed(1.0, 8192.0),
            },
            offset: AxisProperties {
                x: Property::fixed(0.0, 8190.0),
                y: Property::fixed(0.0, 8190.0),
            },
            binning: Property::fixed(1.0, 8.0),
            exposure_time_us: Property::fixed(0.0, 1e6),
            line_interval_us: Property::read_only(),
            readout_direction: Property::read_only(),
            supported_pixel_types: SampleType::ALL.to_vec(),
            digital_lines,
            triggers: CameraTriggerCapabilities {
                acquisition_start: TriggerLineCapabilities {
                    input: 0,
                    output: 0,
                },
                exposure: TriggerLineCapabilities {
                    input: 0,
                    output: 0,
                },
                frame_start: TriggerLineCapabilities {
                    input: 1,
                    output: 0,
                },
            },
        }
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn apply_settings(&mut self, requested: &CameraSettings) -> AcqResult<CameraSettings> {
        let caps = self.capabilities();
        if !caps.supported_pixel_types.contains(&requested.pixel_type) {
            return Err(AcqError::UnsupportedCapability {
                device: self.identifier.name.clone(),
                feature: format!("pixel type {:?}", requested.pixel_type),
            });
        }

        let mut effective = requested.clone();
        effective.shape = (
            clamp_u32(requested.shape.0, &caps.shape.x),
            clamp_u32(requested.shape.1, &caps.shape.y),
        );
        effective.offset = (
            clamp_u32(requested.offset.0, &caps.offset.x),
            clamp_u32(requested.offset.1, &caps.offset.y),
        );
        effective.binning = (f64::from(requested.binning))
            .clamp(f64::from(caps.binning.low), f64::from(caps.binning.high))
            as u8;
        effective.exposure_time_us = requested
            .exposure_time_us
            .clamp(caps.exposure_time_us.low as f32, caps.exposure_time_us.high as f32);
        // Fixed line-scan characteristics on the simulated sensor.
        effective.line_interval_us = 0.0;
        effective.readout_direction = ReadoutDirection::Forward;

        self.settings = effective.clone();
        self.state = DeviceState::Armed;
        Ok(effective)
    }

    async fn start(&mut self) -> AcqResult<()> {
        if self.state == DeviceState::Running {
            return Err(AcqError::IllegalState(format!(
                "camera '{}' is already running",
                self.identifier.name
            )));
        }
        debug!("starting camera '{}'", self.identifier.name);
        self.frame_id = 0;
        self.epoch = Some(Instant::now());
        self.state = DeviceState::Running;
        Ok(())
    }

    async fn next_frame(&mut self) -> AcqResult<VideoFrame> {
        if self.state != DeviceState::Running {
            return Err(AcqError::IllegalState(format!(
                "camera '{}' is not running",
                self.identifier.name
            )));
        }
        let exposure_us = f64::from(self.settings.exposure_time_us);
        if exposure_us > 0.0 {
            sleep(Duration::from_secs_f64(exposure_us * 1e-6)).await;
        }
        Ok(self.synthesize())
    }

    async fn stop(&mut self) -> AcqResult<()> {
        if self.state == DeviceState::Running {
            debug!(
                "stopping camera '{}' after {} frames",
                self.identifier.name, self.frame_id
            );
        }
        self.state = DeviceState::Armed;
        Ok(())
    }
}
