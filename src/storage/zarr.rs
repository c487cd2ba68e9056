//! The zarr sinks, v2 and v3.
//!
//! Both layouts share the chunk pipeline from [`crate::storage::chunk`];
//! what differs is the metadata dialect and how chunks land on disk:
//!
//! * v2 writes `.zgroup`/`.zarray`/`.zattrs` documents, one file per chunk
//!   with `/`-separated keys, and OME-NGFF multiscale attributes at the
//!   root. Optional pyramid levels live in sibling arrays `0`, `1`, ...
//! * v3 writes `zarr.json` documents and groups chunks into shards: each
//!   shard file concatenates its inner chunks and ends with an index of
//!   `(offset, nbytes)` pairs plus a crc32c of that index.
//!
//! External metadata attaches to the level-0 array: its `.zattrs` in v2,
//! the array's `attributes` in v3. Array shapes are only known once the
//! stream ends, so metadata documents are written at shutdown, after the
//! trailing chunks.

use crate::capabilities::StorageCapabilities;
use crate::core::{SampleType, VideoFrame};
use crate::error::AcqResult;
use crate::properties::StorageSettings;
use crate::storage::blosc::{BloscCodec, CLEVEL};
use crate::storage::chunk::{ChunkLayout, FlushedChunk, FrameChunker};
use crate::storage::multiscale::{downsample_half, plan_levels};
use crate::storage::raw::{ensure_parent, uri_to_path};
use crate::storage::{StorageWriter, WriterConfig, ZarrVersion};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Shard assembly (v3)
// ============================================================================

/// Collects encoded chunks into shard files.
///
/// Shards complete when the append axis moves past them; anything still
/// open at the end of the stream flushes with its missing slots marked
/// `u64::MAX` per the sharding index convention.
struct ShardAccumulator {
    /// Chunks per shard along each axis, file order.
    chunks_per_shard: Vec<u64>,
    open: BTreeMap<Vec<u64>, ShardState>,
}

struct ShardState {
    payload: Vec<u8>,
    index: Vec<(u64, u64)>,
}

impl ShardAccumulator {
    fn new(chunks_per_shard: Vec<u64>) -> Self {
        Self {
            chunks_per_shard,
            open: BTreeMap::new(),
        }
    }

    fn slots(&self) -> usize {
        self.chunks_per_shard.iter().product::<u64>() as usize
    }

    /// File a chunk under its shard; returns shards completed by the
    /// append axis advancing past them.
    fn push(&mut self, coords: &[u64], encoded: Vec<u8>) -> Vec<(Vec<u64>, Vec<u8>)> {
        let shard: Vec<u64> = coords
            .iter()
            .zip(&self.chunks_per_shard)
            .map(|(c, n)| c / n)
            .collect();
        let mut slot = 0u64;
        for (c, n) in coords.iter().zip(&self.chunks_per_shard) {
            slot = slot * n + c % n;
        }

        let slots = self.slots();
        let state = self.open.entry(shard.clone()).or_insert_with(|| ShardState {
            payload: Vec::new(),
            index: vec![(u64::MAX, u64::MAX); slots],
        });
        state.index[slot as usize] = (state.payload.len() as u64, encoded.len() as u64);
        state.payload.extend_from_slice(&encoded);

        // Everything strictly before this shard's append row is done now.
        let append_row = shard[0];
        let done: Vec<Vec<u64>> = self
            .open
            .keys()
            .filter(|k| k[0] < append_row)
            .cloned()
            .collect();
        done.into_iter()
            .filter_map(|k| {
                let state = self.open.remove(&k)?;
                Some((k, Self::assemble(state)))
            })
            .collect()
    }

    fn finish(&mut self) -> Vec<(Vec<u64>, Vec<u8>)> {
        let open = std::mem::take(&mut self.open);
        open.into_iter()
            .map(|(k, s)| (k, Self::assemble(s)))
            .collect()
    }

    fn assemble(state: ShardState) -> Vec<u8> {
        let mut shard = state.payload;
        let mut index = Vec::with_capacity(state.index.len() * 16);
        for (offset, nbytes) in &state.index {
            index.extend_from_slice(&offset.to_le_bytes());
            index.extend_from_slice(&nbytes.to_le_bytes());
        }
        let checksum = crc32c::crc32c(&index);
        shard.extend_from_slice(&index);
        shard.extend_from_slice(&checksum.to_le_bytes());
        shard
    }
}

// ============================================================================
// Writer
// ============================================================================

struct Level {
    chunker: FrameChunker,
    shards: Option<ShardAccumulator>,
}

/// Chunked (and optionally sharded, multiscale) zarr sink.
pub struct ZarrWriter {
    version: ZarrVersion,
    codec: Option<BloscCodec>,
    root: PathBuf,
    settings: StorageSettings,
    sample_type: SampleType,
    metadata: Option<Value>,
    levels: Vec<Level>,
}

impl ZarrWriter {
    pub fn new(version: ZarrVersion, codec: Option<BloscCodec>) -> Self {
        Self {
            version,
            codec,
            root: PathBuf::new(),
            settings: StorageSettings::default(),
            sample_type: SampleType::U8,
            metadata: None,
            levels: Vec::new(),
        }
    }

    fn encode_chunk(&self, chunk: &FlushedChunk) -> AcqResult<Vec<u8>> {
        match &self.codec {
            Some(codec) => codec.encode(&chunk.data, self.sample_type.bytes_per_sample()),
            None => Ok(chunk.data.clone()),
        }
    }

    fn chunk_path(&self, level: usize, coords: &[u64]) -> PathBuf {
        let mut path = self.root.join(level.to_string());
        if self.version == ZarrVersion::V3 {
            path = path.join("c");
        }
        for c in coords {
            path = path.join(c.to_string());
        }
        path
    }

    fn emit_chunks(&mut self, level: usize, chunks: Vec<FlushedChunk>) -> AcqResult<()> {
        for chunk in chunks {
            let encoded = self.encode_chunk(&chunk)?;
            let ready: Vec<(Vec<u64>, Vec<u8>)> = match &mut self.levels[level].shards {
                Some(accumulator) => accumulator.push(&chunk.coords, encoded),
                None => vec![(chunk.coords, encoded)],
            };
            for (coords, bytes) in ready {
                let path = self.chunk_path(level, &coords);
                ensure_parent(&path)?;
                std::fs::write(path, bytes)?;
            }
        }
        Ok(())
    }

    fn fill_value(&self) -> Value {
        match self.sample_type {
            SampleType::F32 => json!(0.0),
            _ => json!(0),
        }
    }

    fn compressor_value(&self) -> Value {
        match &self.codec {
            Some(codec) => json!({
                "id": "blosc",
                "cname": codec.compressor.cname(),
                "clevel": CLEVEL,
                "shuffle": if codec.shuffle { 1 } else { 0 },
                "blocksize": 0,
            }),
            None => Value::Null,
        }
    }

    /// OME-NGFF `multiscales` attribute covering every level.
    fn multiscales_value(&self) -> Value {
        let base = self.levels[0].chunker.layout();
        let n_dims = base.dims().len();
        let axes: Vec<Value> = base
            .dims()
            .iter()
            .enumerate()
            .rev()
            .map(|(i, d)| {
                if i < 2 {
                    // The frame plane is calibrated in micrometers.
                    json!({"name": d.name, "type": d.kind.to_string(), "unit": "micrometer"})
                } else {
                    json!({"name": d.name, "type": d.kind.to_string()})
                }
            })
            .collect();

        let (px, py) = self.settings.pixel_scale_um;
        let datasets: Vec<Value> = (0..self.levels.len())
            .map(|level| {
                let factor = 2f64.powi(level as i32);
                let scale: Vec<Value> = (0..n_dims)
                    .rev()
                    .map(|i| match i {
                        0 => json!(px * factor),
                        1 => json!(py * factor),
                        _ => json!(1.0),
                    })
                    .collect();
                json!({
                    "path": level.to_string(),
                    "coordinateTransformations": [
                        {"type": "scale", "scale": scale}
                    ],
                })
            })
            .collect();

        json!([{
            "version": "0.4",
            "axes": axes,
            "datasets": datasets,
        }])
    }

    fn write_json(&self, path: PathBuf, value: &Value) -> AcqResult<()> {
        ensure_parent(&path)?;
        std::fs::write(path, serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    fn write_v2_metadata(&self) -> AcqResult<()> {
        self.write_json(self.root.join(".zgroup"), &json!({"zarr_format": 2}))?;
        self.write_json(
            self.root.join(".zattrs"),
            &json!({"multiscales": self.multiscales_value()}),
        )?;

        for (index, level) in self.levels.iter().enumerate() {
            let layout = level.chunker.layout();
            let frames = level.chunker.frames_written();
            let zarray = json!({
                "zarr_format": 2,
                "shape": layout.array_shape(frames),
                "chunks": layout.chunk_shape(),
                "dtype": self.sample_type.zarr2_dtype(),
                "compressor": self.compressor_value(),
                "fill_value": self.fill_value(),
                "order": "C",
                "filters": Value::Null,
                "dimension_separator": "/",
            });
            self.write_json(self.root.join(index.to_string()).join(".zarray"), &zarray)?;
        }

        if let Some(metadata) = &self.metadata {
            self.write_json(self.root.join("0").join(".zattrs"), metadata)?;
        }
        Ok(())
    }

    fn write_v3_metadata(&self) -> AcqResult<()> {
        self.write_json(
            self.root.join("zarr.json"),
            &json!({
                "zarr_format": 3,
                "node_type": "group",
                "attributes": {},
            }),
        )?;

        let level = &self.levels[0];
        let layout = level.chunker.layout();
        let frames = level.chunker.frames_written();

        let mut inner_codecs = vec![json!({
            "name": "bytes",
            "configuration": {"endian": "little"},
        })];
        if let Some(codec) = &self.codec {
            inner_codecs.push(json!({
                "name": "blosc",
                "configuration": {
                    "cname": codec.compressor.cname(),
                    "clevel": CLEVEL,
                    "shuffle": if codec.shuffle { "shuffle" } else { "noshuffle" },
                    "typesize": self.sample_type.bytes_per_sample(),
                    "blocksize": 0,
                },
            }));
        }

        let dimension_names: Vec<&str> = layout
            .dims()
            .iter()
            .rev()
            .map(|d| d.name.as_str())
            .collect();

        let mut array = json!({
            "zarr_format": 3,
            "node_type": "array",
            "shape": layout.array_shape(frames),
            "data_type": self.sample_type.zarr3_dtype(),
            "chunk_grid": {
                "name": "regular",
                "configuration": {"chunk_shape": layout.shard_shape()},
            },
            "chunk_key_encoding": {
                "name": "default",
                "configuration": {"separator": "/"},
            },
            "fill_value": self.fill_value(),
            "codecs": [{
                "name": "sharding_indexed",
                "configuration": {
                    "chunk_shape": layout.chunk_shape(),
                    "codecs": inner_codecs,
                    "index_codecs": [
                        {"name": "bytes", "configuration": {"endian": "little"}},
                        {"name": "crc32c"},
                    ],
                    "index_location": "end",
                },
            }],
            "dimension_names": dimension_names,
        });
        if let Some(metadata) = &self.metadata {
            array["attributes"] = metadata.clone();
        }
        self.write_json(self.root.join("0").join("zarr.json"), &array)
    }
}

#[async_trait]
impl StorageWriter for ZarrWriter {
    fn capabilities(&self) -> StorageCapabilities {
        match self.version {
            ZarrVersion::V2 => StorageCapabilities {
                chunking_is_supported: true,
                sharding_is_supported: false,
                multiscale_is_supported: true,
            },
            ZarrVersion::V3 => StorageCapabilities {
                chunking_is_supported: true,
                sharding_is_supported: true,
                multiscale_is_supported: false,
            },
        }
    }

    async fn init(&mut self, config: &WriterConfig) -> AcqResult<()> {
        self.settings = config.settings.clone();
        self.sample_type = config.sample_type;
        self.root = uri_to_path(&config.settings.uri);

        let base = ChunkLayout::new(
            &config.settings.acquisition_dimensions,
            config.frame_shape,
            config.sample_type,
        )?;
        let layouts = if config.settings.enable_multiscale {
            plan_levels(&base)?
        } else {
            vec![base]
        };
        self.levels = layouts
            .into_iter()
            .map(|layout| {
                let shards = (self.version == ZarrVersion::V3)
                    .then(|| ShardAccumulator::new(layout.chunks_per_shard()));
                Level {
                    chunker: FrameChunker::new(layout),
                    shards,
                }
            })
            .collect();

        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;
        info!(
            "zarr sink open at '{}' ({} level{})",
            self.root.display(),
            self.levels.len(),
            if self.levels.len() == 1 { "" } else { "s" }
        );
        Ok(())
    }

    async fn set_metadata(&mut self, metadata: Option<&Value>) -> AcqResult<()> {
        self.metadata = metadata.cloned();
        Ok(())
    }

    async fn write(&mut self, frames: &[VideoFrame]) -> AcqResult<()> {
        for frame in frames {
            let mut image = frame.clone();
            for level in 0..self.levels.len() {
                let flushed = self.levels[level].chunker.write_frame(&image)?;
                self.emit_chunks(level, flushed)?;
                if level + 1 < self.levels.len() {
                    image = downsample_half(&image);
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> AcqResult<()> {
        for level in 0..self.levels.len() {
            let flushed = self.levels[level].chunker.finish();
            self.emit_chunks(level, flushed)?;
            if let Some(mut accumulator) = self.levels[level].shards.take() {
                for (shard_coords, shard) in accumulator.finish() {
                    let path = self.chunk_path(level, &shard_coords);
                    ensure_parent(&path)?;
                    std::fs::write(path, shard)?;
                }
            }
        }
        match self.version {
            ZarrVersion::V2 => self.write_v2_metadata()?,
            ZarrVersion::V3 => self.write_v3_metadata()?,
        }
        info!(
            "zarr sink '{}' closed with {} frames",
            self.root.display(),
            self.levels.first().map_or(0, |l| l.chunker.frames_written())
        );
        Ok(())
    }
}
