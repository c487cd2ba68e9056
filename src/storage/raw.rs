//! The raw and trash sinks.
//!
//! `raw` appends packed frame bytes to a single memory-mapped file with no
//! framing at all; the reader is expected to know the shape and sample
//! type. `trash` discards everything and only keeps a count, which makes it
//! the sink of choice for camera and lifecycle tests.

use crate::capabilities::StorageCapabilities;
use crate::core::VideoFrame;
use crate::error::{AcqError, AcqResult};
use crate::storage::{StorageWriter, WriterConfig};
use async_trait::async_trait;
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Grow the mapping in steps of this many bytes, rounded up to whole
/// frames. Keeps remaps rare without preallocating absurd files for
/// unbounded streams.
const GROWTH_STEP_BYTES: u64 = 256 * 1024 * 1024;

/// Interpret a storage uri as a filesystem path. Only `file://` uris and
/// plain paths are supported; paths with spaces pass through untouched.
pub(crate) fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// Create the parent directory of a sink path if it does not exist yet.
pub(crate) fn ensure_parent(path: &Path) -> AcqResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ============================================================================
// Raw
// ============================================================================

/// Packed frame bytes in one flat file.
pub struct RawWriter {
    path: PathBuf,
    file: Option<File>,
    mmap: Option<MmapMut>,
    frame_bytes: u64,
    mapped_bytes: u64,
    written_bytes: u64,
}

impl Default for RawWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RawWriter {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
            mmap: None,
            frame_bytes: 0,
            mapped_bytes: 0,
            written_bytes: 0,
        }
    }

    fn remap_to(&mut self, target: u64) -> AcqResult<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| AcqError::IllegalState("raw sink is not open".to_string()))?;
        file.set_len(target)?;
        // SAFETY: the file was just extended to `target` bytes and stays
        // open for as long as the mapping lives in `self`.
        let mmap = unsafe { MmapOptions::new().map_mut(file)? };
        self.mmap = Some(mmap);
        self.mapped_bytes = target;
        debug!(
            "raw sink '{}' grown to {} bytes",
            self.path.display(),
            target
        );
        Ok(())
    }
}

#[async_trait]
impl StorageWriter for RawWriter {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }

    async fn init(&mut self, config: &WriterConfig) -> AcqResult<()> {
        let (w, h) = config.frame_shape;
        self.frame_bytes =
            u64::from(w) * u64::from(h) * config.sample_type.bytes_per_sample() as u64;
        if self.frame_bytes == 0 {
            return Err(AcqError::Config(
                "raw sink cannot store zero-byte frames".to_string(),
            ));
        }
        self.path = uri_to_path(&config.settings.uri);
        ensure_parent(&self.path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = Some(file);
        self.written_bytes = 0;
        self.mapped_bytes = 0;

        // Preallocate the whole run when the frame budget makes that
        // sensible; unbounded streams start at one growth step.
        let preallocate = config
            .max_frame_count
            .checked_mul(self.frame_bytes)
            .map(|bytes| bytes.min(GROWTH_STEP_BYTES))
            .unwrap_or(GROWTH_STEP_BYTES)
            .max(self.frame_bytes);
        self.remap_to(preallocate)?;
        info!("raw sink open at '{}'", self.path.display());
        Ok(())
    }

    async fn set_metadata(&mut self, _metadata: Option<&serde_json::Value>) -> AcqResult<()> {
        // The raw layout has nowhere to put it.
        Ok(())
    }

    async fn write(&mut self, frames: &[VideoFrame]) -> AcqResult<()> {
        for frame in frames {
            if frame.data.len() as u64 != self.frame_bytes {
                return Err(AcqError::Config(format!(
                    "frame carries {} bytes, raw sink expects {}",
                    frame.data.len(),
                    self.frame_bytes
                )));
            }
            let end = self.written_bytes + self.frame_bytes;
            if end > self.mapped_bytes {
                let grown = self.mapped_bytes.saturating_add(GROWTH_STEP_BYTES);
                self.remap_to(end.max(grown))?;
            }
            let mmap = self
                .mmap
                .as_mut()
                .ok_or_else(|| AcqError::IllegalState("raw sink is not open".to_string()))?;
            let start = self.written_bytes as usize;
            mmap[start..start + frame.data.len()].copy_from_slice(&frame.data);
            self.written_bytes = end;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> AcqResult<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        if let Some(file) = self.file.take() {
            // Trim the growth slack so the file ends at the last frame.
            file.set_len(self.written_bytes)?;
        }
        info!(
            "raw sink '{}' closed at {} bytes",
            self.path.display(),
            self.written_bytes
        );
        Ok(())
    }
}

// ============================================================================
// Trash
// ============================================================================

/// Counts frames and drops them.
#[derive(Default)]
pub struct TrashWriter {
    frames: u64,
}

impl TrashWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames accepted so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }
}

#[async_trait]
impl StorageWriter for TrashWriter {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }

    async fn init(&mut self, _config: &WriterConfig) -> AcqResult<()> {
        self.frames = 0;
        Ok(())
    }

    async fn set_metadata(&mut self, _metadata: Option<&serde_json::Value>) -> AcqResult<()> {
        Ok(())
    }

    async fn write(&mut self, frames: &[VideoFrame]) -> AcqResult<()> {
        self.frames += frames.len() as u64;
        Ok(())
    }

    async fn shutdown(&mut self) -> AcqResult<()> {
        debug!("trash sink discarded {} frames", self.frames);
        Ok(())
    }
}
