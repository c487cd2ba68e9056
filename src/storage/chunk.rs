//! Chunk layout and frame-to-chunk tiling.
//!
//! Chunked sinks describe their array with [`StorageDimension`]s ordered
//! fastest-varying first: `x`, `y`, optional interior axes (channel and the
//! like), and one unbounded append axis last. On disk the array is C-order,
//! so file metadata and chunk keys use the reverse of that order.
//!
//! [`FrameChunker`] turns the incoming frame sequence into chunk payloads.
//! Frames tile across the spatial chunk grid; whole slabs of chunks complete
//! each time the append axis crosses a chunk boundary. Chunks hold exactly
//! the in-bounds samples: edge chunks are clipped to the array extent and a
//! trailing partial chunk is emitted at whatever length it reached, never
//! padded out to the nominal chunk shape.

use crate::core::{SampleType, VideoFrame};
use crate::error::{AcqError, AcqResult};
use crate::properties::StorageDimension;

// ============================================================================
// Layout
// ============================================================================

/// Validated dimension list plus the derived numbers every chunked sink
/// needs: chunk grids, clipped extents, and file-order shapes.
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    dims: Vec<StorageDimension>,
    sample_type: SampleType,
}

impl ChunkLayout {
    /// Build a layout from fastest-first dimensions.
    ///
    /// `frame_shape` is the `(width, height)` every incoming frame will
    /// have; the first two axes must match it exactly.
    pub fn new(
        dims: &[StorageDimension],
        frame_shape: (u32, u32),
        sample_type: SampleType,
    ) -> AcqResult<Self> {
        if dims.len() < 3 {
            return Err(AcqError::Config(format!(
                "chunked storage needs at least x, y and an append axis, got {} axes",
                dims.len()
            )));
        }
        let append_count = dims.iter().filter(|d| d.is_append()).count();
        if append_count != 1 || !dims[dims.len() - 1].is_append() {
            return Err(AcqError::Config(
                "exactly one append axis is allowed and it must come last".to_string(),
            ));
        }
        for d in dims {
            if d.chunk_size_px == 0 {
                return Err(AcqError::Config(format!(
                    "axis '{}' has zero chunk size",
                    d.name
                )));
            }
        }
        if dims[0].array_size_px != frame_shape.0 || dims[1].array_size_px != frame_shape.1 {
            return Err(AcqError::Config(format!(
                "array axes ({}, {}) do not match the {}x{} video frame",
                dims[0].array_size_px, dims[1].array_size_px, frame_shape.0, frame_shape.1
            )));
        }
        for d in &dims[2..dims.len() - 1] {
            if d.array_size_px == 0 {
                return Err(AcqError::Config(format!(
                    "interior axis '{}' must have a fixed extent",
                    d.name
                )));
            }
        }
        Ok(Self {
            dims: dims.to_vec(),
            sample_type,
        })
    }

    /// The dimensions, fastest-varying first, as configured.
    pub fn dims(&self) -> &[StorageDimension] {
        &self.dims
    }

    /// Sample type of the array.
    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    fn bytes_per_sample(&self) -> usize {
        self.sample_type.bytes_per_sample()
    }

    fn append(&self) -> &StorageDimension {
        &self.dims[self.dims.len() - 1]
    }

    /// Axes between `y` and the append axis, fastest first. Usually empty
    /// or a single channel axis.
    fn interior(&self) -> &[StorageDimension] {
        &self.dims[2..self.dims.len() - 1]
    }

    /// Frames consumed per append-axis step: the product of interior
    /// extents. One for the plain `x, y, t` case.
    pub fn frames_per_append_step(&self) -> u64 {
        self.interior()
            .iter()
            .map(|d| u64::from(d.array_size_px))
            .product()
    }

    /// Effective chunk extent along a non-append axis, clamped to the
    /// array so oversized requests behave as one whole-axis chunk.
    fn effective_chunk(&self, d: &StorageDimension) -> u64 {
        if d.is_append() {
            u64::from(d.chunk_size_px)
        } else {
            u64::from(d.chunk_size_px.min(d.array_size_px))
        }
    }

    /// Chunk count along a non-append axis.
    fn chunk_count(&self, d: &StorageDimension) -> u64 {
        let size = u64::from(d.array_size_px);
        size.div_ceil(self.effective_chunk(d))
    }

    /// In-bounds extent of chunk `index` along `d`.
    fn chunk_extent(&self, d: &StorageDimension, index: u64) -> u64 {
        let chunk = self.effective_chunk(d);
        let size = u64::from(d.array_size_px);
        chunk.min(size - index * chunk)
    }

    /// Append-axis extent after `frames` frames.
    pub fn append_extent(&self, frames: u64) -> u64 {
        frames.div_ceil(self.frames_per_append_step())
    }

    /// Array shape in file (slowest-first) order for a finished stream.
    pub fn array_shape(&self, frames: u64) -> Vec<u64> {
        let mut shape: Vec<u64> = self
            .dims
            .iter()
            .rev()
            .map(|d| u64::from(d.array_size_px))
            .collect();
        shape[0] = self.append_extent(frames);
        shape
    }

    /// Nominal chunk shape in file order, clamped to the array extents.
    pub fn chunk_shape(&self) -> Vec<u64> {
        self.dims.iter().rev().map(|d| self.effective_chunk(d)).collect()
    }

    /// Chunk-grid counts in file order for a finished stream.
    pub fn chunk_counts(&self, frames: u64) -> Vec<u64> {
        let mut counts: Vec<u64> = self.dims.iter().rev().map(|d| self.chunk_count(d)).collect();
        counts[0] = self
            .append_extent(frames)
            .div_ceil(u64::from(self.append().chunk_size_px));
        counts
    }

    /// Shard shape in file order: chunk shape times chunks-per-shard.
    /// Axes with no shard request count as one chunk per shard.
    pub fn shard_shape(&self) -> Vec<u64> {
        self.dims
            .iter()
            .rev()
            .map(|d| self.effective_chunk(d) * u64::from(d.shard_size_chunks.max(1)))
            .collect()
    }

    /// Chunks per shard in file order.
    pub fn chunks_per_shard(&self) -> Vec<u64> {
        self.dims
            .iter()
            .rev()
            .map(|d| u64::from(d.shard_size_chunks.max(1)))
            .collect()
    }

    /// Total samples in one full nominal chunk.
    pub fn chunk_sample_count(&self) -> u64 {
        self.chunk_shape().iter().product()
    }
}

// ============================================================================
// Chunker
// ============================================================================

/// One chunk's worth of accumulation state.
#[derive(Debug)]
struct ChunkBuf {
    /// Chunk indices along each non-append axis, file order.
    coords: Vec<u64>,
    /// Per-axis extents of this chunk in file order, append axis first.
    /// The append entry is the nominal chunk size; spatial and interior
    /// entries are clipped to the array.
    extents: Vec<u64>,
    data: Vec<u8>,
    /// Bytes written so far. Fills strictly front to back because frames
    /// arrive in order, so the filled prefix is always contiguous.
    filled: usize,
}

impl ChunkBuf {
    fn stride_below(&self, axis: usize, bytes_per_sample: usize) -> usize {
        self.extents[axis + 1..]
            .iter()
            .map(|&e| e as usize)
            .product::<usize>()
            * bytes_per_sample
    }
}

/// A completed chunk payload, ready for a sink to encode and write.
#[derive(Debug)]
pub struct FlushedChunk {
    /// Chunk indices in file order, append axis first.
    pub coords: Vec<u64>,
    /// In-bounds samples in C order. Shorter than the nominal chunk when
    /// the chunk is clipped or the stream stopped mid-chunk.
    pub data: Vec<u8>,
}

/// Splits the incoming frame sequence into chunks.
pub struct FrameChunker {
    layout: ChunkLayout,
    slab: Vec<ChunkBuf>,
    slab_index: u64,
    frames_written: u64,
}

impl FrameChunker {
    /// Create a chunker and allocate the chunk buffers for one append slab.
    pub fn new(layout: ChunkLayout) -> Self {
        let slab = Self::build_slab(&layout);
        Self {
            layout,
            slab,
            slab_index: 0,
            frames_written: 0,
        }
    }

    fn build_slab(layout: &ChunkLayout) -> Vec<ChunkBuf> {
        // Grid over non-append axes in file order.
        let grid_dims: Vec<&StorageDimension> = layout.dims.iter().rev().skip(1).collect();
        let counts: Vec<u64> = grid_dims.iter().map(|d| layout.chunk_count(d)).collect();
        let total: u64 = counts.iter().product();
        let bps = layout.bytes_per_sample();
        let append_chunk = u64::from(layout.append().chunk_size_px);

        let mut slab = Vec::with_capacity(total as usize);
        for linear in 0..total {
            let mut coords = vec![0u64; counts.len()];
            let mut rem = linear;
            for axis in (0..counts.len()).rev() {
                coords[axis] = rem % counts[axis];
                rem /= counts[axis];
            }
            let mut extents = Vec::with_capacity(coords.len() + 1);
            extents.push(append_chunk);
            for (d, &c) in grid_dims.iter().zip(&coords) {
                extents.push(layout.chunk_extent(d, c));
            }
            let nbytes = extents.iter().product::<u64>() as usize * bps;
            slab.push(ChunkBuf {
                coords,
                extents,
                data: vec![0u8; nbytes],
                filled: 0,
            });
        }
        slab
    }

    /// The layout this chunker was built from.
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Frames accepted so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Tile one frame into the open slab. Returns the chunks completed by
    /// crossing an append-chunk boundary, which is empty for most frames.
    pub fn write_frame(&mut self, frame: &VideoFrame) -> AcqResult<Vec<FlushedChunk>> {
        let bps = self.layout.bytes_per_sample();
        let (w, h) = (
            u64::from(self.layout.dims[0].array_size_px),
            u64::from(self.layout.dims[1].array_size_px),
        );
        if (u64::from(frame.shape.0), u64::from(frame.shape.1)) != (w, h) {
            return Err(AcqError::Config(format!(
                "frame is {}x{} but the array was configured for {}x{}",
                frame.shape.0, frame.shape.1, w, h
            )));
        }
        if frame.data.len() != (w * h) as usize * bps {
            return Err(AcqError::Config(format!(
                "frame carries {} bytes, layout expects {}",
                frame.data.len(),
                (w * h) as usize * bps
            )));
        }

        // Position of this frame along the interior and append axes.
        let mut rem = self.frames_written;
        let mut interior_idx = Vec::with_capacity(self.layout.interior().len());
        for d in self.layout.interior() {
            interior_idx.push(rem % u64::from(d.array_size_px));
            rem /= u64::from(d.array_size_px);
        }
        let append_idx = rem;
        let append_chunk = u64::from(self.layout.append().chunk_size_px);
        let slab_index = append_idx / append_chunk;
        let append_off = append_idx % append_chunk;

        let mut flushed = Vec::new();
        if slab_index != self.slab_index {
            self.flush_slab(&mut flushed);
            self.slab_index = slab_index;
        }

        // Chunk coordinate and in-chunk offset per interior axis, file
        // order (slowest interior axis first).
        let interior_coords: Vec<(u64, u64)> = self
            .layout
            .interior()
            .iter()
            .zip(&interior_idx)
            .map(|(d, &i)| {
                let chunk = self.layout.effective_chunk(d);
                (i / chunk, i % chunk)
            })
            .rev()
            .collect();

        let x_dim = &self.layout.dims[0];
        let y_dim = &self.layout.dims[1];
        let chunk_x = self.layout.effective_chunk(x_dim);
        let chunk_y = self.layout.effective_chunk(y_dim);
        let nx = self.layout.chunk_count(x_dim);
        let ny = self.layout.chunk_count(y_dim);
        let interior_counts: Vec<u64> = self
            .layout
            .interior()
            .iter()
            .map(|d| self.layout.chunk_count(d))
            .rev()
            .collect();

        for cy in 0..ny {
            for cx in 0..nx {
                // Linear grid index in file order: interior, then y, then x.
                let mut linear = 0u64;
                for ((coord, _), count) in interior_coords.iter().zip(&interior_counts) {
                    linear = linear * count + coord;
                }
                linear = (linear * ny + cy) * nx + cx;
                let buf = &mut self.slab[linear as usize];

                let ex = self.layout.chunk_extent(x_dim, cx) as usize;
                let ey = self.layout.chunk_extent(y_dim, cy);

                // In-buffer offset of this frame's tile: append step, then
                // interior offsets, row by row below.
                let mut base = append_off as usize * buf.stride_below(0, bps);
                for (axis, (_, off)) in interior_coords.iter().enumerate() {
                    base += *off as usize * buf.stride_below(axis + 1, bps);
                }

                let row_bytes = ex * bps;
                for row in 0..ey {
                    let src = ((cy * chunk_y + row) * w + cx * chunk_x) as usize * bps;
                    let dst = base + row as usize * row_bytes;
                    buf.data[dst..dst + row_bytes]
                        .copy_from_slice(&frame.data[src..src + row_bytes]);
                }
                let end = base + ey as usize * row_bytes;
                buf.filled = buf.filled.max(end);
            }
        }

        self.frames_written += 1;
        Ok(flushed)
    }

    fn flush_slab(&mut self, out: &mut Vec<FlushedChunk>) {
        for buf in &mut self.slab {
            if buf.filled == 0 {
                continue;
            }
            let mut coords = Vec::with_capacity(buf.coords.len() + 1);
            coords.push(self.slab_index);
            coords.extend_from_slice(&buf.coords);
            out.push(FlushedChunk {
                coords,
                data: buf.data[..buf.filled].to_vec(),
            });
            buf.filled = 0;
        }
    }

    /// Flush the open slab, trailing partial chunks included.
    pub fn finish(&mut self) -> Vec<FlushedChunk> {
        let mut flushed = Vec::new();
        self.flush_slab(&mut flushed);
        flushed
    }
}
