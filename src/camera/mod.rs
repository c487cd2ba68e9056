//! Camera abstraction and the built-in simulated cameras.
//!
//! A [`Camera`] produces [`VideoFrame`]s on demand. Settings are applied
//! before the stream starts; `apply_settings` clamps requested values to the
//! device's capabilities and returns what will actually be used, so callers
//! can inspect the effective configuration without a second query.

pub mod simulated;

use crate::capabilities::CameraCapabilities;
use crate::core::{DeviceIdentifier, DeviceState, VideoFrame};
use crate::error::{AcqError, AcqResult};
use crate::properties::CameraSettings;
use async_trait::async_trait;

pub use simulated::SimulatedCamera;

/// A frame source.
///
/// Implementations are driven by a single stream task and are not required
/// to be `Sync`; frame pacing (exposure time, trigger gating) is the
/// implementation's responsibility inside [`Camera::next_frame`].
#[async_trait]
pub trait Camera: Send {
    /// The identifier this camera was created from.
    fn identifier(&self) -> &DeviceIdentifier;

    /// Static description of what the device supports.
    fn capabilities(&self) -> CameraCapabilities;

    /// Current lifecycle state.
    fn state(&self) -> DeviceState;

    /// Clamp `requested` to the device's capabilities, store the result,
    /// and return it. Non-writable properties are forced to their fixed
    /// values regardless of what was requested.
    fn apply_settings(&mut self, requested: &CameraSettings) -> AcqResult<CameraSettings>;

    /// Begin producing frames. Resets the frame counter and the hardware
    /// timestamp epoch.
    async fn start(&mut self) -> AcqResult<()>;

    /// Produce the next frame. Waits out the exposure time first.
    async fn next_frame(&mut self) -> AcqResult<VideoFrame>;

    /// Stop producing frames. Idempotent.
    async fn stop(&mut self) -> AcqResult<()>;
}

/// Instantiate the camera a registry identifier refers to.
pub fn create_camera(identifier: &DeviceIdentifier) -> AcqResult<Box<dyn Camera>> {
    SimulatedCamera::from_identifier(identifier)
        .map(|c| Box::new(c) as Box<dyn Camera>)
        .ok_or_else(|| AcqError::NotFound(format!("no camera backend for '{}'", identifier.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use crate::core::DeviceKind;

    #[test]
    fn test_create_camera_for_every_registered_device() {
        let reg = DeviceRegistry::with_simulated_devices();
        for descriptor in reg.devices() {
            if descriptor.identifier.kind == DeviceKind::Camera {
                assert!(create_camera(&descriptor.identifier).is_ok());
            }
        }
    }

    #[test]
    fn test_create_camera_unknown_name() {
        let id = DeviceIdentifier {
            id: (0, 99),
            kind: DeviceKind::Camera,
            name: "front door cam".to_string(),
        };
        assert!(matches!(create_camera(&id), Err(AcqError::NotFound(_))));
    }
}
