//! The acquisition runtime: a synchronous lifecycle API over the async
//! capture pipeline.
//!
//! [`Runtime`] owns a tokio runtime, the device registry, and one slot per
//! video stream. Configuration is an echo protocol: [`Runtime::apply_configuration`]
//! validates the request, clamps camera settings against device
//! capabilities, and returns what will actually run, so callers can
//! inspect the effective values without a second query.
//!
//! [`Runtime::start`] spawns one capture task per configured stream.
//! [`Runtime::stop`] waits for finite frame budgets to complete and
//! cancels streams that have nothing to wait for (unbounded budgets,
//! trigger-gated sources); [`Runtime::abort`] cancels everything in
//! place. In every case storage writers are finalized before the call
//! returns, so trailing partial chunks reach disk.
//!
//! All public methods are synchronous and run async work on the owned
//! runtime via `block_on`; do not call them from inside another tokio
//! runtime. Call [`Runtime::stop`] or [`Runtime::abort`] before dropping
//! a started runtime, or in-flight sinks are left unfinalized.

use crate::camera::create_camera;
use crate::capabilities::{Capabilities, Property, VideoStreamCapabilities};
use crate::config::Settings;
use crate::core::{DeviceKind, DeviceState};
use crate::error::{AcqError, AcqResult};
use crate::manifest::AcquisitionManifest;
use crate::packet::{AvailableData, PacketBuffer};
use crate::properties::{Properties, VideoStreamProperties};
use crate::registry::DeviceRegistry;
use crate::storage::{capabilities_for, check_capabilities, create_writer, WriterConfig};
use crate::stream::{self, StreamHandle, StreamSpec};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

struct StreamSlot {
    /// Outlives the capture task so staged packets stay retrievable after
    /// stop or abort. Replaced with a fresh buffer on the next start.
    buffer: Arc<PacketBuffer>,
    handle: Option<StreamHandle>,
}

/// The video acquisition runtime.
pub struct Runtime {
    runtime: tokio::runtime::Runtime,
    settings: Settings,
    registry: DeviceRegistry,
    properties: Properties,
    slots: Vec<StreamSlot>,
}

impl Runtime {
    pub fn new(settings: Settings) -> AcqResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let properties = Properties::default();
        let slots = properties
            .video
            .iter()
            .map(|_| StreamSlot {
                buffer: Arc::new(PacketBuffer::new(settings.acquisition.packet_buffer_frames)),
                handle: None,
            })
            .collect();
        tracing::debug!("runtime ready ({} stream slots)", properties.video.len());
        Ok(Self {
            runtime,
            settings,
            registry: DeviceRegistry::with_simulated_devices(),
            properties,
            slots,
        })
    }

    /// A runtime with settings from `acquire.toml` (if present) and the
    /// `ACQ_*` environment.
    pub fn with_defaults() -> AcqResult<Self> {
        Self::new(Settings::new(None)?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Device discovery and selection.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Coarse lifecycle state: unconfigured, armed, or running.
    pub fn state(&self) -> DeviceState {
        if self.any_running() {
            DeviceState::Running
        } else if self
            .properties
            .video
            .iter()
            .any(VideoStreamProperties::is_configured)
        {
            DeviceState::Armed
        } else {
            DeviceState::AwaitingConfiguration
        }
    }

    /// The effective configuration from the last successful apply.
    pub fn get_configuration(&self) -> Properties {
        self.properties.clone()
    }

    /// Validate `requested`, clamp it against device capabilities, store
    /// it, and return the effective configuration.
    pub fn apply_configuration(&mut self, requested: &Properties) -> AcqResult<Properties> {
        if self.any_running() {
            return Err(AcqError::IllegalState(
                "cannot reconfigure while the runtime is running".to_string(),
            ));
        }
        if requested.video.len() > self.slots.len() {
            return Err(AcqError::Config(format!(
                "{} streams requested but only {} are available",
                requested.video.len(),
                self.slots.len()
            )));
        }

        let mut effective = Properties::default();
        for (index, request) in requested.video.iter().enumerate() {
            effective.video[index] = self.apply_stream(index, request)?;
        }
        self.properties = effective.clone();
        Ok(effective)
    }

    fn apply_stream(
        &self,
        index: usize,
        request: &VideoStreamProperties,
    ) -> AcqResult<VideoStreamProperties> {
        let mut effective = request.clone();
        if !request.is_configured() {
            return Ok(effective);
        }

        // Camera: must be a registered device; the device clamps settings.
        let camera_id = &request.camera.identifier;
        if camera_id.kind != DeviceKind::Camera {
            return Err(AcqError::Config(format!(
                "stream {index}: '{}' is not a camera",
                camera_id.name
            )));
        }
        if self.registry.find(camera_id).is_none() {
            return Err(AcqError::NotFound(format!(
                "stream {index}: camera '{}' is not a registered device",
                camera_id.name
            )));
        }
        let mut camera = create_camera(camera_id)?;
        effective.camera.settings = camera.apply_settings(&request.camera.settings)?;

        // Storage: reject anything the selected sink cannot honor now, so
        // failures happen at apply and not mid-acquisition.
        let storage_id = &request.storage.identifier;
        if storage_id.is_selected() {
            if storage_id.kind != DeviceKind::Storage {
                return Err(AcqError::Config(format!(
                    "stream {index}: '{}' is not a storage device",
                    storage_id.name
                )));
            }
            if self.registry.find(storage_id).is_none() {
                return Err(AcqError::NotFound(format!(
                    "stream {index}: storage '{}' is not a registered device",
                    storage_id.name
                )));
            }
            let capabilities = capabilities_for(storage_id)?;
            let settings = &mut effective.storage.settings;
            settings.validate_dimensions()?;
            check_capabilities(storage_id, settings, &capabilities)?;
            if capabilities.chunking_is_supported {
                let dims = &settings.acquisition_dimensions;
                if dims.is_empty() {
                    return Err(AcqError::Config(format!(
                        "stream {index}: storage '{}' requires acquisition dimensions",
                        storage_id.name
                    )));
                }
                if dims.len() < 3 {
                    return Err(AcqError::Config(format!(
                        "stream {index}: need at least x, y, and an append dimension, got {}",
                        dims.len()
                    )));
                }
                if settings.append_dimension().is_none() {
                    return Err(AcqError::Config(format!(
                        "stream {index}: dimensions must end with an append axis (array_size_px == 0)"
                    )));
                }
                let shape = effective.camera.settings.shape;
                if dims[0].array_size_px != shape.0 || dims[1].array_size_px != shape.1 {
                    return Err(AcqError::Config(format!(
                        "stream {index}: dimensions {}x{} do not match the camera frame {}x{}",
                        dims[0].array_size_px, dims[1].array_size_px, shape.0, shape.1
                    )));
                }
            }

            // Trim external metadata and reject invalid JSON here.
            settings.external_metadata_json =
                match settings.external_metadata_json.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(json) => {
                        serde_json::from_str::<Value>(json).map_err(|e| {
                            AcqError::Config(format!(
                                "stream {index}: external metadata is not valid JSON: {e}"
                            ))
                        })?;
                        Some(json.to_string())
                    }
                };
        }

        Ok(effective)
    }

    /// Capability ranges for the currently selected devices. Streams with
    /// no selection report zeroed, non-writable capabilities.
    pub fn get_capabilities(&self) -> AcqResult<Capabilities> {
        let mut capabilities = Capabilities::default();
        for stream in &self.properties.video {
            let mut entry = VideoStreamCapabilities::default();
            if stream.camera.identifier.is_selected() {
                entry.camera = create_camera(&stream.camera.identifier)?.capabilities();
                entry.max_frame_count = Property::fixed(0.0, u64::MAX as f32);
                entry.frame_average_count = Property::fixed(0.0, u32::MAX as f32);
            }
            if stream.storage.identifier.is_selected() {
                entry.storage = capabilities_for(&stream.storage.identifier)?;
            }
            capabilities.video.push(entry);
        }
        Ok(capabilities)
    }

    fn any_running(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.handle.as_ref().is_some_and(|h| !h.is_finished()))
    }

    fn any_handles(&self) -> bool {
        self.slots.iter().any(|s| s.handle.is_some())
    }

    /// Spawn a capture task for every configured stream.
    pub fn start(&mut self) -> AcqResult<()> {
        if self.any_handles() {
            return Err(AcqError::IllegalState(
                "the runtime is already started; stop it first".to_string(),
            ));
        }
        let configured: Vec<usize> = self
            .properties
            .video
            .iter()
            .enumerate()
            .filter(|(_, stream)| stream.is_configured())
            .map(|(index, _)| index)
            .collect();
        if configured.is_empty() {
            return Err(AcqError::IllegalState(
                "no video stream is configured".to_string(),
            ));
        }

        let manifest = self
            .settings
            .acquisition
            .write_manifest
            .then(|| AcquisitionManifest::describe(&self.properties));

        // Build every spec before spawning anything, so a bad stream
        // cannot leave its siblings running.
        let mut pending: Vec<(usize, StreamSpec, Arc<PacketBuffer>)> = Vec::new();
        for index in configured {
            let stream_props = self.properties.video[index].clone();
            if !stream_props.storage.identifier.is_selected() {
                return Err(AcqError::Config(format!(
                    "stream {index}: no storage device selected"
                )));
            }
            let mut camera = create_camera(&stream_props.camera.identifier)?;
            camera.apply_settings(&stream_props.camera.settings)?;
            let writer = create_writer(&stream_props.storage.identifier)?;
            let metadata: Option<Value> = stream_props
                .storage
                .settings
                .external_metadata_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            let buffer = Arc::new(PacketBuffer::new(
                self.settings.acquisition.packet_buffer_frames,
            ));
            if let Some(manifest) = &manifest {
                let path = manifest.write_beside(&stream_props.storage.settings.uri)?;
                tracing::debug!("stream {} manifest at '{}'", index, path.display());
            }
            let spec = StreamSpec {
                id: index,
                camera,
                writer,
                writer_config: WriterConfig {
                    settings: stream_props.storage.settings.clone(),
                    frame_shape: stream_props.camera.settings.shape,
                    sample_type: stream_props.camera.settings.pixel_type,
                    max_frame_count: stream_props.max_frame_count,
                },
                metadata,
                buffer: buffer.clone(),
                max_frame_count: stream_props.max_frame_count,
                frame_average_count: stream_props.frame_average_count,
                first_frame_id: stream_props.storage.settings.first_frame_id,
                triggered: stream_props.camera.settings.input_triggers.frame_start.enable,
            };
            pending.push((index, spec, buffer));
        }

        for (index, spec, buffer) in pending {
            let handle = stream::spawn(self.runtime.handle(), spec);
            self.slots[index].buffer = buffer;
            self.slots[index].handle = Some(handle);
        }
        tracing::info!("acquisition started");
        Ok(())
    }

    /// Wait for every stream to finish its frame budget and finalize
    /// storage. Streams with nothing to wait for (unbounded budgets,
    /// trigger-gated sources) are cancelled instead. Idempotent.
    pub fn stop(&mut self) -> AcqResult<()> {
        self.reap(false)
    }

    /// Cancel every stream at its next frame boundary. Writers still
    /// flush, so partial trailing chunks reach disk. Staged packets stay
    /// retrievable afterwards. Idempotent.
    pub fn abort(&mut self) -> AcqResult<()> {
        self.reap(true)
    }

    fn reap(&mut self, cancel: bool) -> AcqResult<()> {
        let handles: Vec<StreamHandle> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.handle.take())
            .collect();
        if handles.is_empty() {
            return Ok(());
        }
        for handle in &handles {
            if cancel || handle.max_frame_count == u64::MAX || handle.triggered {
                handle.halt();
            }
        }

        let timeout = self.settings.acquisition.stop_timeout;
        let results = self.runtime.block_on(async move {
            let mut results = Vec::new();
            for mut handle in handles {
                let id = handle.id;
                let result = join_with_escalation(&mut handle, timeout).await;
                results.push((id, result));
            }
            results
        });

        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(frames) => tracing::debug!("stream {} delivered {} frames", id, frames),
                Err(e) => {
                    tracing::error!("stream {} ended with error: {}", id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(
                    "acquisition {}",
                    if cancel { "aborted" } else { "stopped" }
                );
                Ok(())
            }
        }
    }

    /// Fire one software frame-start trigger pulse at a running stream.
    pub fn execute_trigger(&self, stream: usize) -> AcqResult<()> {
        let slot = self
            .slots
            .get(stream)
            .ok_or_else(|| AcqError::NotFound(format!("stream {stream} does not exist")))?;
        let handle = slot
            .handle
            .as_ref()
            .filter(|h| !h.is_finished())
            .ok_or_else(|| AcqError::IllegalState(format!("stream {stream} is not running")))?;
        if !handle.triggered {
            return Err(AcqError::IllegalState(format!(
                "stream {stream} does not have the frame-start trigger enabled"
            )));
        }
        handle.fire_trigger()
    }

    /// Collect everything the stream has staged since the last call.
    /// Non-blocking; an idle stream yields an empty packet.
    pub fn get_available_data(&self, stream: usize) -> AcqResult<AvailableData> {
        let slot = self
            .slots
            .get(stream)
            .ok_or_else(|| AcqError::NotFound(format!("stream {stream} does not exist")))?;
        Ok(slot.buffer.take())
    }
}

/// Graceful join with two levels of escalation: wait, then cancel and
/// wait again, then abort the task outright.
async fn join_with_escalation(handle: &mut StreamHandle, timeout: Duration) -> AcqResult<u64> {
    match tokio::time::timeout(timeout, handle.join()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "stream {} still running after {:?}; cancelling",
                handle.id,
                timeout
            );
            handle.halt();
            match tokio::time::timeout(timeout, handle.join()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("stream {} ignored cancellation; aborting its task", handle.id);
                    handle.force_abort();
                    let _ = handle.join().await;
                    Err(AcqError::Timeout(format!(
                        "stream {} did not stop within {:?}",
                        handle.id, timeout
                    )))
                }
            }
        }
    }
}

/// One-call convenience configuration: select a camera and a storage
/// device by pattern, point stream 0 at `out.tif` with a 100-frame
/// budget, and apply.
pub fn setup(runtime: &mut Runtime, camera: &str, storage: &str) -> AcqResult<Properties> {
    let camera_id = runtime
        .registry()
        .select(DeviceKind::Camera, Some(camera))?;
    let storage_id = runtime
        .registry()
        .select(DeviceKind::Storage, Some(storage))?;

    let mut properties = runtime.get_configuration();
    let stream = &mut properties.video[0];
    stream.camera.identifier = camera_id;
    stream.camera.settings.binning = 1;
    stream.camera.settings.shape = (640, 480);
    stream.storage.identifier = storage_id;
    stream.storage.settings.uri = "out.tif".to_string();
    stream.max_frame_count = 100;
    runtime.apply_configuration(&properties)
}
