//! Blosc1-framed chunk compression.
//!
//! Compressed zarr devices wrap every chunk in a blosc1 frame: a 16-byte
//! header followed by a single compressed block. The header records the
//! uncompressed size, the codec, and whether byte shuffling was applied, so
//! a chunk file is self-describing. When compression would grow the payload
//! the frame falls back to store mode and carries the (shuffled) bytes
//! verbatim.
//!
//! Layout of the 16-byte header, all integers little-endian:
//!
//! ```text
//! offset 0   u8   format version (2)
//! offset 1   u8   codec format version (1)
//! offset 2   u8   flags: bit 0 byte shuffle, bit 1 store mode,
//!                 bits 5..7 compressor code (0 = blosclz, 1 = lz4,
//!                 4 = zstd)
//! offset 3   u8   typesize in bytes
//! offset 4   u32  nbytes, uncompressed payload size
//! offset 8   u32  blocksize (equals nbytes; one block per frame)
//! offset 12  u32  cbytes, total frame size including the header
//! ```

use crate::error::{AcqError, AcqResult};

const HEADER_SIZE: usize = 16;
const FORMAT_VERSION: u8 = 2;
const CODEC_FORMAT_VERSION: u8 = 1;

const FLAG_SHUFFLE: u8 = 0x01;
const FLAG_STORED: u8 = 0x02;

const CODE_BLOSCLZ: u8 = 0;
const CODE_LZ4: u8 = 1;
const CODE_ZSTD: u8 = 4;

/// Compression level used by the built-in devices. The device names carry
/// it ("Blosc1"), so it is not configurable per stream.
pub const CLEVEL: u8 = 1;

/// The inner compressor of a blosc frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloscCompressor {
    /// Blosclz. No Rust implementation is linked, so frames are always
    /// written in store mode; non-stored blosclz frames cannot be read.
    BloscLz,
    /// Zstandard. Requires the `compress_zstd` feature.
    Zstd,
    /// LZ4 block format. Requires the `compress_lz4` feature.
    Lz4,
}

impl BloscCompressor {
    /// The `cname` string used in zarr compressor metadata.
    pub fn cname(&self) -> &'static str {
        match self {
            Self::BloscLz => "blosclz",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::BloscLz => CODE_BLOSCLZ,
            Self::Zstd => CODE_ZSTD,
            Self::Lz4 => CODE_LZ4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            CODE_BLOSCLZ => Some(Self::BloscLz),
            CODE_ZSTD => Some(Self::Zstd),
            CODE_LZ4 => Some(Self::Lz4),
            _ => None,
        }
    }

    fn compress(&self, data: &[u8]) -> AcqResult<Vec<u8>> {
        match self {
            // Identity, so the encoder's size comparison always picks
            // store mode.
            Self::BloscLz => Ok(data.to_vec()),
            #[cfg(feature = "compress_zstd")]
            Self::Zstd => Ok(zstd::bulk::compress(data, i32::from(CLEVEL))?),
            #[cfg(not(feature = "compress_zstd"))]
            Self::Zstd => Err(AcqError::FeatureNotEnabled("compress_zstd".to_string())),
            #[cfg(feature = "compress_lz4")]
            Self::Lz4 => Ok(lz4_flex::block::compress(data)),
            #[cfg(not(feature = "compress_lz4"))]
            Self::Lz4 => Err(AcqError::FeatureNotEnabled("compress_lz4".to_string())),
        }
    }

    fn decompress(&self, data: &[u8], nbytes: usize) -> AcqResult<Vec<u8>> {
        match self {
            Self::BloscLz => Err(AcqError::Config(
                "blosclz frames are only readable in store mode".to_string(),
            )),
            #[cfg(feature = "compress_zstd")]
            Self::Zstd => Ok(zstd::bulk::decompress(data, nbytes)?),
            #[cfg(not(feature = "compress_zstd"))]
            Self::Zstd => Err(AcqError::FeatureNotEnabled("compress_zstd".to_string())),
            #[cfg(feature = "compress_lz4")]
            Self::Lz4 => lz4_flex::block::decompress(data, nbytes)
                .map_err(|e| AcqError::Config(format!("corrupt lz4 chunk: {}", e))),
            #[cfg(not(feature = "compress_lz4"))]
            Self::Lz4 => Err(AcqError::FeatureNotEnabled("compress_lz4".to_string())),
        }
    }
}

/// One compressed-chunk configuration: compressor plus shuffle choice.
///
/// The built-in devices always byte-shuffle; the flag exists so tests can
/// exercise both framings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloscCodec {
    /// Inner compressor.
    pub compressor: BloscCompressor,
    /// Transpose bytes by sample size before compressing.
    pub shuffle: bool,
}

impl BloscCodec {
    /// The configuration the `...ByteShuffle` device names select.
    pub fn byte_shuffle(compressor: BloscCompressor) -> Self {
        Self {
            compressor,
            shuffle: true,
        }
    }

    /// Encode one chunk into a blosc frame.
    pub fn encode(&self, data: &[u8], typesize: usize) -> AcqResult<Vec<u8>> {
        let typesize = typesize.clamp(1, 255);
        let payload_src;
        let shuffled;
        if self.shuffle && typesize > 1 {
            shuffled = byte_shuffle(data, typesize);
            payload_src = shuffled.as_slice();
        } else {
            payload_src = data;
        }

        let compressed = self.compressor.compress(payload_src)?;
        // Store mode when compression does not pay for itself.
        let (payload, stored) = if compressed.len() < payload_src.len() {
            (compressed, false)
        } else {
            (payload_src.to_vec(), true)
        };

        let mut flags = self.compressor.code() << 5;
        if self.shuffle && typesize > 1 {
            flags |= FLAG_SHUFFLE;
        }
        if stored {
            flags |= FLAG_STORED;
        }

        let nbytes = data.len() as u32;
        let cbytes = (HEADER_SIZE + payload.len()) as u32;
        let mut frame = Vec::with_capacity(cbytes as usize);
        frame.push(FORMAT_VERSION);
        frame.push(CODEC_FORMAT_VERSION);
        frame.push(flags);
        frame.push(typesize as u8);
        frame.extend_from_slice(&nbytes.to_le_bytes());
        frame.extend_from_slice(&nbytes.to_le_bytes()); // blocksize: one block
        frame.extend_from_slice(&cbytes.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a blosc frame produced by [`BloscCodec::encode`].
    ///
    /// The codec is taken from the frame header, not from `self`, so any
    /// instance can decode any frame this module wrote.
    pub fn decode(frame: &[u8]) -> AcqResult<Vec<u8>> {
        if frame.len() < HEADER_SIZE {
            return Err(AcqError::Config(format!(
                "blosc frame too short: {} bytes",
                frame.len()
            )));
        }
        let flags = frame[2];
        let typesize = frame[3] as usize;
        let nbytes = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        let cbytes = u32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]) as usize;
        if cbytes != frame.len() {
            return Err(AcqError::Config(format!(
                "blosc frame size mismatch: header says {} bytes, got {}",
                cbytes,
                frame.len()
            )));
        }
        let payload = &frame[HEADER_SIZE..];

        let mut data = if flags & FLAG_STORED != 0 {
            if payload.len() != nbytes {
                return Err(AcqError::Config(
                    "stored blosc frame has wrong payload size".to_string(),
                ));
            }
            payload.to_vec()
        } else {
            let compressor = BloscCompressor::from_code(flags >> 5).ok_or_else(|| {
                AcqError::Config(format!("unknown blosc compressor code {}", flags >> 5))
            })?;
            compressor.decompress(payload, nbytes)?
        };

        if flags & FLAG_SHUFFLE != 0 && typesize > 1 {
            data = byte_unshuffle(&data, typesize);
        }
        if data.len() != nbytes {
            return Err(AcqError::Config(format!(
                "blosc frame decoded to {} bytes, header says {}",
                data.len(),
                nbytes
            )));
        }
        Ok(data)
    }
}

/// Group the k-th byte of every sample together. Trailing bytes that do not
/// make up a whole sample are carried through unchanged.
fn byte_shuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    let count = data.len() / typesize;
    let mut out = vec![0u8; data.len()];
    for i in 0..count {
        for j in 0..typesize {
            out[j * count + i] = data[i * typesize + j];
        }
    }
    let tail = count * typesize;
    out[tail..].copy_from_slice(&data[tail..]);
    out
}

fn byte_unshuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    let count = data.len() / typesize;
    let mut out = vec![0u8; data.len()];
    for i in 0..count {
        for j in 0..typesize {
            out[i * typesize + j] = data[j * count + i];
        }
    }
    let tail = count * typesize;
    out[tail..].copy_from_slice(&data[tail..]);
    out
}
