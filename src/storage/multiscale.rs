//! Spatial pyramid generation for multiscale sinks.
//!
//! Each level halves the frame plane with a 2x2 box filter; nothing else is
//! decimated, so every level sees every frame and the append axis keeps its
//! full extent. Levels are added until the image fits inside a single chunk
//! on both frame axes, at which point a further level would buy nothing.

use crate::core::VideoFrame;
use crate::error::AcqResult;
use crate::properties::StorageDimension;
use crate::storage::chunk::ChunkLayout;
use bytes::Bytes;

/// Halved extent, rounding odd sizes up so the last row or column
/// survives.
fn half(extent: u32) -> u32 {
    extent.div_ceil(2).max(1)
}

/// Downsample one frame by averaging each in-bounds 2x2 neighborhood.
///
/// Edge pixels of odd-sized frames average the one or two samples that
/// exist rather than padding. The mean is computed in `f64` and cast back
/// to the frame's sample type with saturation.
pub fn downsample_half(frame: &VideoFrame) -> VideoFrame {
    let (w, h) = frame.shape;
    let (ow, oh) = (half(w), half(h));
    let sample_type = frame.sample_type;
    let mut out = vec![0u8; (ow * oh) as usize * sample_type.bytes_per_sample()];

    for oy in 0..oh {
        for ox in 0..ow {
            let mut sum = 0.0;
            let mut count = 0u32;
            for dy in 0..2u32 {
                for dx in 0..2u32 {
                    let x = ox * 2 + dx;
                    let y = oy * 2 + dy;
                    if x < w && y < h {
                        sum += sample_type.read_f64(&frame.data, (y * w + x) as usize);
                        count += 1;
                    }
                }
            }
            sample_type.write_f64(
                &mut out,
                (oy * ow + ox) as usize,
                sum / f64::from(count),
            );
        }
    }

    VideoFrame {
        metadata: frame.metadata,
        shape: (ow, oh),
        sample_type,
        data: Bytes::from(out),
    }
}

/// Chunk layouts for every pyramid level, level 0 first.
///
/// Level `n + 1` exists only while level `n` is wider or taller than one
/// chunk; chunk sizes carry over, clamped to the shrinking image. Sinks
/// without multiscale enabled use only the first entry.
pub fn plan_levels(base: &ChunkLayout) -> AcqResult<Vec<ChunkLayout>> {
    let mut levels = vec![base.clone()];
    let chunk_x = base.dims()[0].chunk_size_px;
    let chunk_y = base.dims()[1].chunk_size_px;
    let (mut w, mut h) = (base.dims()[0].array_size_px, base.dims()[1].array_size_px);

    while w > chunk_x || h > chunk_y {
        w = half(w);
        h = half(h);
        let mut dims: Vec<StorageDimension> = base.dims().to_vec();
        dims[0].array_size_px = w;
        dims[0].chunk_size_px = chunk_x.min(w);
        dims[1].array_size_px = h;
        dims[1].chunk_size_px = chunk_y.min(h);
        levels.push(ChunkLayout::new(&dims, (w, h), base.sample_type())?);
    }
    Ok(levels)
}
