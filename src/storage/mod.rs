//! Storage sinks with clean feature flag handling.
//!
//! Every sink implements [`StorageWriter`] and is addressed through the
//! registry by device name. The name encodes the whole configuration that
//! is not per-stream: `ZarrBlosc1ZstdByteShuffle` is the zarr v2 layout
//! with zstd-compressed, byte-shuffled chunks, while per-stream knobs (uri,
//! dimensions, multiscale) arrive in [`WriterConfig`].

pub mod blosc;
pub mod chunk;
pub mod multiscale;
pub mod raw;
pub mod tiff;
pub mod zarr;

use crate::capabilities::StorageCapabilities;
use crate::core::{DeviceIdentifier, SampleType, VideoFrame};
use crate::error::{AcqError, AcqResult};
use crate::properties::StorageSettings;
use async_trait::async_trait;
use blosc::{BloscCodec, BloscCompressor};

/// Everything a writer needs to open its sink.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Per-stream storage settings, already validated.
    pub settings: StorageSettings,
    /// Width and height of every frame the stream will deliver.
    pub frame_shape: (u32, u32),
    /// Sample type of every frame.
    pub sample_type: SampleType,
    /// Upper bound on frames this stream will deliver. `u64::MAX` for
    /// unbounded streams; sinks may use it to preallocate.
    pub max_frame_count: u64,
}

/// A frame sink.
///
/// The lifecycle is `init`, then `set_metadata`, then any number of
/// `write` calls, then `shutdown`. Shutdown flushes whatever is buffered,
/// trailing partial chunks included, and writes sink metadata; it runs on
/// both graceful stop and abort.
#[async_trait]
pub trait StorageWriter: Send {
    /// What this sink supports. Used to reject configurations up front.
    fn capabilities(&self) -> StorageCapabilities;

    /// Open the sink.
    async fn init(&mut self, config: &WriterConfig) -> AcqResult<()>;

    /// Attach external metadata. Called after `init` and before the first
    /// `write`; `None` clears any previous value.
    async fn set_metadata(&mut self, metadata: Option<&serde_json::Value>) -> AcqResult<()>;

    /// Append a batch of frames, in order.
    async fn write(&mut self, frames: &[VideoFrame]) -> AcqResult<()>;

    /// Flush and close the sink.
    async fn shutdown(&mut self) -> AcqResult<()>;
}

/// Which zarr metadata generation a device writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZarrVersion {
    /// `.zgroup`/`.zarray` metadata, `/`-separated chunk keys.
    V2,
    /// `zarr.json` metadata with sharded chunks.
    V3,
}

/// Instantiate the sink a registry identifier refers to.
pub fn create_writer(identifier: &DeviceIdentifier) -> AcqResult<Box<dyn StorageWriter>> {
    let writer: Box<dyn StorageWriter> = match identifier.name.as_str() {
        "raw" => Box::new(raw::RawWriter::new()),
        "trash" => Box::new(raw::TrashWriter::new()),
        "tiff" => Box::new(tiff::TiffWriter::new(false)),
        "tiff-json" => Box::new(tiff::TiffWriter::new(true)),
        "Zarr" => Box::new(zarr::ZarrWriter::new(ZarrVersion::V2, None)),
        "ZarrBlosc1ZstdByteShuffle" => Box::new(zarr::ZarrWriter::new(
            ZarrVersion::V2,
            Some(BloscCodec::byte_shuffle(BloscCompressor::Zstd)),
        )),
        "ZarrBlosc1Lz4ByteShuffle" => Box::new(zarr::ZarrWriter::new(
            ZarrVersion::V2,
            Some(BloscCodec::byte_shuffle(BloscCompressor::Lz4)),
        )),
        "ZarrV3" => Box::new(zarr::ZarrWriter::new(ZarrVersion::V3, None)),
        "ZarrV3Blosc1ZstdByteShuffle" => Box::new(zarr::ZarrWriter::new(
            ZarrVersion::V3,
            Some(BloscCodec::byte_shuffle(BloscCompressor::Zstd)),
        )),
        "ZarrV3Blosc1Lz4ByteShuffle" => Box::new(zarr::ZarrWriter::new(
            ZarrVersion::V3,
            Some(BloscCodec::byte_shuffle(BloscCompressor::Lz4)),
        )),
        other => {
            return Err(AcqError::NotFound(format!(
                "no storage backend for '{}'",
                other
            )))
        }
    };
    Ok(writer)
}

/// Capability matrix for a storage device, without opening anything.
pub fn capabilities_for(identifier: &DeviceIdentifier) -> AcqResult<StorageCapabilities> {
    create_writer(identifier).map(|w| w.capabilities())
}

/// Reject settings a sink cannot honor. Called during configuration so the
/// failure happens at `apply`, not mid-acquisition.
pub fn check_capabilities(
    identifier: &DeviceIdentifier,
    settings: &StorageSettings,
    capabilities: &StorageCapabilities,
) -> AcqResult<()> {
    if !settings.acquisition_dimensions.is_empty() && !capabilities.chunking_is_supported {
        return Err(AcqError::UnsupportedCapability {
            device: identifier.name.clone(),
            feature: "chunked acquisition dimensions".to_string(),
        });
    }
    if settings.enable_multiscale && !capabilities.multiscale_is_supported {
        return Err(AcqError::UnsupportedCapability {
            device: identifier.name.clone(),
            feature: "multiscale".to_string(),
        });
    }
    let wants_sharding = settings
        .acquisition_dimensions
        .iter()
        .any(|d| d.shard_size_chunks > 0);
    if wants_sharding && !capabilities.sharding_is_supported {
        return Err(AcqError::UnsupportedCapability {
            device: identifier.name.clone(),
            feature: "sharding".to_string(),
        });
    }
    Ok(())
}
