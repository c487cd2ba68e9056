//! The tiff and tiff-json sinks.
//!
//! Frames go into one little-endian classic TIFF: a single grayscale strip
//! per frame, one IFD per frame, IFDs chained in capture order. Each frame
//! carries a JSON `ImageDescription`; the first frame's description also
//! embeds the stream's external metadata, so the file is self-contained.
//! The `tiff-json` variant additionally drops the external metadata next to
//! the file as `<uri>.metadata.json`.
//!
//! Classic TIFF caps offsets at 4 GiB; a write that would cross that limit
//! fails rather than producing a file readers cannot follow.

use crate::capabilities::StorageCapabilities;
use crate::core::{SampleType, VideoFrame};
use crate::error::{AcqError, AcqResult};
use crate::storage::raw::{ensure_parent, uri_to_path};
use crate::storage::{StorageWriter, WriterConfig};
use async_trait::async_trait;
use log::info;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_SAMPLE_FORMAT: u16 = 339;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

const ENTRIES_PER_IFD: u16 = 11;

fn entry(tag: u16, field_type: u16, count: u32, value: u32) -> [u8; 12] {
    let mut e = [0u8; 12];
    e[0..2].copy_from_slice(&tag.to_le_bytes());
    e[2..4].copy_from_slice(&field_type.to_le_bytes());
    e[4..8].copy_from_slice(&count.to_le_bytes());
    e[8..12].copy_from_slice(&value.to_le_bytes());
    e
}

fn entry_short(tag: u16, value: u16) -> [u8; 12] {
    // SHORT values sit in the low bytes of the value field.
    entry(tag, TYPE_SHORT, 1, u32::from(value))
}

fn entry_long(tag: u16, value: u32) -> [u8; 12] {
    entry(tag, TYPE_LONG, 1, value)
}

/// One IFD per frame, appended as frames arrive.
pub struct TiffWriter {
    sidecar: bool,
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    /// File position of the pointer that should receive the next IFD's
    /// offset: byte 4 of the header before the first frame, the previous
    /// IFD's next field afterwards.
    patch_pos: u64,
    shape: (u32, u32),
    sample_type: SampleType,
    metadata: Option<serde_json::Value>,
    frames_written: u64,
}

impl TiffWriter {
    pub fn new(sidecar: bool) -> Self {
        Self {
            sidecar,
            path: PathBuf::new(),
            file: None,
            offset: 0,
            patch_pos: 4,
            shape: (0, 0),
            sample_type: SampleType::U8,
            metadata: None,
            frames_written: 0,
        }
    }

    fn file_mut(&mut self) -> AcqResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| AcqError::IllegalState("tiff sink is not open".to_string()))
    }

    fn append(&mut self, bytes: &[u8]) -> AcqResult<()> {
        let end = self.offset + bytes.len() as u64;
        if end > u64::from(u32::MAX) {
            return Err(AcqError::Config(
                "classic TIFF cannot grow past 4 GiB".to_string(),
            ));
        }
        self.file_mut()?.write_all(bytes)?;
        self.offset = end;
        Ok(())
    }

    fn pad_to_even(&mut self) -> AcqResult<()> {
        if self.offset % 2 == 1 {
            self.append(&[0])?;
        }
        Ok(())
    }

    /// Point the previous IFD (or the header) at `ifd_offset`.
    fn patch_chain(&mut self, ifd_offset: u32) -> AcqResult<()> {
        let pos = self.patch_pos;
        let end = self.offset;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(&ifd_offset.to_le_bytes())?;
        file.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn description_for(&self, frame_id: u64) -> String {
        let mut object = serde_json::Map::new();
        if frame_id == 0 {
            if let Some(metadata) = &self.metadata {
                object.insert("metadata".to_string(), metadata.clone());
            }
        }
        object.insert("frame_id".to_string(), serde_json::Value::from(frame_id));
        serde_json::Value::Object(object).to_string()
    }

    fn append_frame(&mut self, frame: &VideoFrame) -> AcqResult<()> {
        let (w, h) = self.shape;
        if frame.shape != self.shape {
            return Err(AcqError::Config(format!(
                "frame is {}x{} but the tiff was opened for {}x{}",
                frame.shape.0, frame.shape.1, w, h
            )));
        }
        let (bits, sample_format) = self.sample_type.tiff_format();

        self.pad_to_even()?;
        let strip_offset = self.offset as u32;
        self.append(&frame.data)?;

        let mut description = self.description_for(frame.metadata.frame_id).into_bytes();
        description.push(0);
        let inline = description.len() <= 4;
        let description_value = if inline {
            let mut v = [0u8; 4];
            v[..description.len()].copy_from_slice(&description);
            u32::from_le_bytes(v)
        } else {
            self.pad_to_even()?;
            let at = self.offset as u32;
            self.append(&description)?;
            at
        };

        self.pad_to_even()?;
        let ifd_offset = self.offset as u32;
        let mut ifd = Vec::with_capacity(2 + usize::from(ENTRIES_PER_IFD) * 12 + 4);
        ifd.extend_from_slice(&ENTRIES_PER_IFD.to_le_bytes());
        ifd.extend_from_slice(&entry_long(TAG_IMAGE_WIDTH, w));
        ifd.extend_from_slice(&entry_long(TAG_IMAGE_LENGTH, h));
        ifd.extend_from_slice(&entry_short(TAG_BITS_PER_SAMPLE, bits));
        ifd.extend_from_slice(&entry_short(TAG_COMPRESSION, 1));
        ifd.extend_from_slice(&entry_short(TAG_PHOTOMETRIC, 1));
        ifd.extend_from_slice(&entry(
            TAG_IMAGE_DESCRIPTION,
            TYPE_ASCII,
            description.len() as u32,
            description_value,
        ));
        ifd.extend_from_slice(&entry_long(TAG_STRIP_OFFSETS, strip_offset));
        ifd.extend_from_slice(&entry_short(TAG_SAMPLES_PER_PIXEL, 1));
        ifd.extend_from_slice(&entry_long(TAG_ROWS_PER_STRIP, h));
        ifd.extend_from_slice(&entry_long(TAG_STRIP_BYTE_COUNTS, frame.data.len() as u32));
        ifd.extend_from_slice(&entry_short(TAG_SAMPLE_FORMAT, sample_format));
        ifd.extend_from_slice(&0u32.to_le_bytes());
        self.append(&ifd)?;

        self.patch_chain(ifd_offset)?;
        self.patch_pos = u64::from(ifd_offset) + 2 + u64::from(ENTRIES_PER_IFD) * 12;
        self.frames_written += 1;
        Ok(())
    }
}

#[async_trait]
impl StorageWriter for TiffWriter {
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }

    async fn init(&mut self, config: &WriterConfig) -> AcqResult<()> {
        self.path = uri_to_path(&config.settings.uri);
        ensure_parent(&self.path)?;
        self.shape = config.frame_shape;
        self.sample_type = config.sample_type;
        self.frames_written = 0;
        self.offset = 0;
        self.patch_pos = 4;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = Some(file);
        // Little-endian classic header; the IFD pointer is patched when
        // the first frame lands.
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(b"II");
        header.extend_from_slice(&42u16.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        self.append(&header)?;
        info!("tiff sink open at '{}'", self.path.display());
        Ok(())
    }

    async fn set_metadata(&mut self, metadata: Option<&serde_json::Value>) -> AcqResult<()> {
        if self.frames_written > 0 {
            return Err(AcqError::IllegalState(
                "tiff metadata must be set before the first frame".to_string(),
            ));
        }
        self.metadata = metadata.cloned();
        Ok(())
    }

    async fn write(&mut self, frames: &[VideoFrame]) -> AcqResult<()> {
        for frame in frames {
            self.append_frame(frame)?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> AcqResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        if self.sidecar {
            if let Some(metadata) = &self.metadata {
                let mut sidecar = self.path.clone().into_os_string();
                sidecar.push(".metadata.json");
                std::fs::write(sidecar, serde_json::to_string_pretty(metadata)?)?;
            }
        }
        info!(
            "tiff sink '{}' closed with {} frames",
            self.path.display(),
            self.frames_written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{VideoFrameMetadata, VideoFrameTimestamps};
    use crate::properties::StorageSettings;
    use bytes::Bytes;

    fn frame(id: u64, w: u32, h: u32, sample_type: SampleType) -> VideoFrame {
        let nbytes = (w * h) as usize * sample_type.bytes_per_sample();
        VideoFrame {
            metadata: VideoFrameMetadata {
                frame_id: id,
                timestamps: VideoFrameTimestamps::default(),
            },
            shape: (w, h),
            sample_type,
            data: Bytes::from(vec![id as u8; nbytes]),
        }
    }

    fn config(uri: &str, w: u32, h: u32, sample_type: SampleType) -> WriterConfig {
        WriterConfig {
            settings: StorageSettings {
                uri: uri.to_string(),
                ..Default::default()
            },
            frame_shape: (w, h),
            sample_type,
            max_frame_count: 100,
        }
    }

    /// Minimal IFD walk used by the tests below.
    fn read_tiff(path: &std::path::Path) -> Vec<(String, Vec<u8>, u32, u32)> {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(&bytes[0..2], b"II");
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 42);
        let mut frames = Vec::new();
        let mut ifd_at = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        while ifd_at != 0 {
            let count = u16::from_le_bytes(bytes[ifd_at..ifd_at + 2].try_into().unwrap());
            let mut width = 0u32;
            let mut height = 0u32;
            let mut strip = 0usize;
            let mut strip_len = 0usize;
            let mut desc = String::new();
            for i in 0..count {
                let at = ifd_at + 2 + usize::from(i) * 12;
                let tag = u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap());
                let n = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap());
                let value = u32::from_le_bytes(bytes[at + 8..at + 12].try_into().unwrap());
                match tag {
                    TAG_IMAGE_WIDTH => width = value,
                    TAG_IMAGE_LENGTH => height = value,
                    TAG_STRIP_OFFSETS => strip = value as usize,
                    TAG_STRIP_BYTE_COUNTS => strip_len = value as usize,
                    TAG_IMAGE_DESCRIPTION => {
                        let n = n as usize;
                        let raw = if n <= 4 {
                            bytes[at + 8..at + 8 + n].to_vec()
                        } else {
                            bytes[value as usize..value as usize + n].to_vec()
                        };
                        desc = String::from_utf8(raw[..n - 1].to_vec()).unwrap();
                    }
                    _ => {}
                }
            }
            frames.push((desc, bytes[strip..strip + strip_len].to_vec(), width, height));
            let next_at = ifd_at + 2 + usize::from(count) * 12;
            ifd_at = u32::from_le_bytes(bytes[next_at..next_at + 4].try_into().unwrap()) as usize;
        }
        frames
    }

    #[tokio::test]
    async fn test_one_ifd_per_frame_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tif");
        let mut writer = TiffWriter::new(false);
        writer
            .init(&config(path.to_str().unwrap(), 6, 4, SampleType::U8))
            .await
            .unwrap();
        writer.set_metadata(None).await.unwrap();
        for id in 0..5 {
            writer.write(&[frame(id, 6, 4, SampleType::U8)]).await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let frames = read_tiff(&path);
        assert_eq!(frames.len(), 5);
        for (id, (desc, data, w, h)) in frames.iter().enumerate() {
            let parsed: serde_json::Value = serde_json::from_str(desc).unwrap();
            assert_eq!(parsed["frame_id"], id as u64);
            assert_eq!((*w, *h), (6, 4));
            assert_eq!(data.len(), 24);
            assert!(data.iter().all(|&b| b == id as u8));
        }
    }

    #[tokio::test]
    async fn test_first_frame_embeds_external_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.tif");
        let metadata = serde_json::json!({"hello": "world", "n": 3});

        let mut writer = TiffWriter::new(false);
        writer
            .init(&config(path.to_str().unwrap(), 4, 4, SampleType::U8))
            .await
            .unwrap();
        writer.set_metadata(Some(&metadata)).await.unwrap();
        writer
            .write(&[frame(0, 4, 4, SampleType::U8), frame(1, 4, 4, SampleType::U8)])
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let frames = read_tiff(&path);
        let first: serde_json::Value = serde_json::from_str(&frames[0].0).unwrap();
        assert_eq!(first["metadata"], metadata);
        assert_eq!(first["frame_id"], 0);
        let second: serde_json::Value = serde_json::from_str(&frames[1].0).unwrap();
        assert_eq!(second["frame_id"], 1);
        assert!(second.get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_sidecar_written_only_by_tiff_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("side.tif");
        let metadata = serde_json::json!({"instrument": {"name": "sim"}});

        let mut writer = TiffWriter::new(true);
        writer
            .init(&config(path.to_str().unwrap(), 4, 2, SampleType::U16))
            .await
            .unwrap();
        writer.set_metadata(Some(&metadata)).await.unwrap();
        writer.write(&[frame(0, 4, 2, SampleType::U16)]).await.unwrap();
        writer.shutdown().await.unwrap();

        let sidecar = dir.path().join("side.tif.metadata.json");
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[tokio::test]
    async fn test_unaligned_shape_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.tif");
        let mut writer = TiffWriter::new(false);
        writer
            .init(&config(path.to_str().unwrap(), 33, 47, SampleType::U8))
            .await
            .unwrap();
        writer.set_metadata(None).await.unwrap();
        for id in 0..3 {
            writer
                .write(&[frame(id, 33, 47, SampleType::U8)])
                .await
                .unwrap();
        }
        writer.shutdown().await.unwrap();

        let frames = read_tiff(&path);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].1.len(), 33 * 47);
        assert_eq!((frames[2].2, frames[2].3), (33, 47));
    }

    #[tokio::test]
    async fn test_metadata_after_first_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.tif");
        let mut writer = TiffWriter::new(false);
        writer
            .init(&config(path.to_str().unwrap(), 4, 4, SampleType::U8))
            .await
            .unwrap();
        writer.write(&[frame(0, 4, 4, SampleType::U8)]).await.unwrap();
        let late = serde_json::json!({"too": "late"});
        assert!(matches!(
            writer.set_metadata(Some(&late)).await,
            Err(AcqError::IllegalState(_))
        ));
    }
}
