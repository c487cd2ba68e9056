//! Frame staging between stream tasks and the caller.
//!
//! Each video stream owns a [`PacketBuffer`]. The stream task pushes frames
//! in; the caller periodically takes everything staged so far as one
//! [`AvailableData`] packet. Taking is non-blocking and never waits for the
//! producer, so a caller polling an idle stream gets an empty packet rather
//! than a stall.
//!
//! # Backpressure
//!
//! The buffer holds at most `capacity` frames. The producer awaits a permit
//! per frame and blocks when the buffer is full; permits are returned the
//! moment a packet is taken, so capture resumes while the caller is still
//! working through the packet. Frames are never dropped: per-stream frame
//! ids stay contiguous from the camera all the way to storage.
//!
//! # Handle invalidation
//!
//! Frame handles borrow from their packet via a weak reference. Once the
//! packet is dropped, every handle taken from it fails with
//! [`AcqError::Invalidated`] instead of reading freed data.

use crate::core::{SampleType, VideoFrame, VideoFrameMetadata};
use crate::error::{AcqError, AcqResult};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Semaphore;

// ============================================================================
// Staging buffer
// ============================================================================

/// Bounded staging area between one producer task and one consumer.
#[derive(Debug)]
pub struct PacketBuffer {
    staged: Mutex<Vec<VideoFrame>>,
    /// One permit per free slot. `push` consumes, `take` refunds.
    slots: Arc<Semaphore>,
}

impl PacketBuffer {
    /// Create a buffer that holds at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            staged: Mutex::new(Vec::new()),
            slots: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Stage one frame, waiting for a free slot when the buffer is full.
    ///
    /// Fails with [`AcqError::ChannelClosed`] after [`PacketBuffer::close`],
    /// which is how an aborting stream task learns to wind down.
    pub async fn push(&self, frame: VideoFrame) -> AcqResult<()> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| AcqError::ChannelClosed("packet buffer"))?;
        // The slot stays consumed until `take` hands the frame onward.
        permit.forget();
        match self.staged.lock() {
            Ok(mut staged) => {
                staged.push(frame);
                Ok(())
            }
            Err(_) => Err(AcqError::ChannelClosed("packet buffer")),
        }
    }

    /// Take everything staged so far as one packet. Never blocks; an idle
    /// buffer yields an empty packet.
    pub fn take(&self) -> AvailableData {
        let frames = match self.staged.lock() {
            Ok(mut staged) => std::mem::take(&mut *staged),
            Err(_) => Vec::new(),
        };
        // Refund the slots immediately so capture continues while the
        // caller holds the packet.
        self.slots.add_permits(frames.len());
        AvailableData::from_frames(frames)
    }

    /// Frames currently staged.
    pub fn len(&self) -> usize {
        self.staged.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard staged frames and refund their slots. Used on abort, where
    /// in-flight frames are dropped rather than delivered.
    pub fn clear(&self) {
        if let Ok(mut staged) = self.staged.lock() {
            let n = staged.len();
            staged.clear();
            self.slots.add_permits(n);
        }
    }

    /// Wake a producer blocked in [`PacketBuffer::push`] with an error.
    pub fn close(&self) {
        self.slots.close();
    }
}

// ============================================================================
// Packets and frame handles
// ============================================================================

#[derive(Debug)]
struct PacketInner {
    frames: Vec<VideoFrame>,
    /// Shared iteration cursor; see [`AvailableData::frames`].
    cursor: AtomicUsize,
}

/// A batch of frames taken from a stream.
///
/// The packet owns its frames. Handles and iterators derived from it stop
/// working the moment the packet is dropped, so hold the packet for as long
/// as the frames are needed and no longer; while the packet is alive the
/// frames it holds count against nothing and capture continues unimpeded.
#[derive(Debug, Clone)]
pub struct AvailableData {
    inner: Arc<PacketInner>,
}

impl AvailableData {
    fn from_frames(frames: Vec<VideoFrame>) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                frames,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// An empty packet. Returned for streams with nothing staged.
    pub fn empty() -> Self {
        Self::from_frames(Vec::new())
    }

    /// Number of frames in this packet.
    pub fn frame_count(&self) -> usize {
        self.inner.frames.len()
    }

    /// Iterate over the packet's frames as handles.
    ///
    /// The cursor lives in the packet, not the iterator: a second call to
    /// `frames()` resumes where the first stopped rather than starting
    /// over. This mirrors consuming the packet exactly once, spread over
    /// several loops if the caller wants.
    pub fn frames(&self) -> Frames<'_> {
        Frames { packet: &self.inner }
    }
}

/// Iterator over a packet's frames. See [`AvailableData::frames`].
pub struct Frames<'a> {
    packet: &'a Arc<PacketInner>,
}

impl Iterator for Frames<'_> {
    type Item = VideoFrameHandle;

    fn next(&mut self) -> Option<VideoFrameHandle> {
        let index = self.packet.cursor.fetch_add(1, Ordering::Relaxed);
        if index < self.packet.frames.len() {
            Some(VideoFrameHandle {
                packet: Arc::downgrade(self.packet),
                index,
            })
        } else {
            None
        }
    }
}

/// A reference to one frame inside a packet.
///
/// Handles are cheap to clone and may outlive their packet, but every
/// accessor fails with [`AcqError::Invalidated`] once the packet is gone.
#[derive(Debug, Clone)]
pub struct VideoFrameHandle {
    packet: Weak<PacketInner>,
    index: usize,
}

impl VideoFrameHandle {
    fn with_frame<T>(&self, f: impl FnOnce(&VideoFrame) -> T) -> AcqResult<T> {
        let packet = self.packet.upgrade().ok_or(AcqError::Invalidated)?;
        match packet.frames.get(self.index) {
            Some(frame) => Ok(f(frame)),
            None => Err(AcqError::Invalidated),
        }
    }

    /// The frame's metadata (id and timestamps).
    pub fn metadata(&self) -> AcqResult<VideoFrameMetadata> {
        self.with_frame(|f| f.metadata)
    }

    /// The frame's pixel data. Cloning `Bytes` is a refcount bump, but the
    /// returned buffer keeps the frame's allocation alive independently of
    /// the packet.
    pub fn data(&self) -> AcqResult<Bytes> {
        self.with_frame(|f| f.data.clone())
    }

    /// Frame shape as `(width, height)`.
    pub fn shape(&self) -> AcqResult<(u32, u32)> {
        self.with_frame(|f| f.shape)
    }

    /// The frame's sample type.
    pub fn sample_type(&self) -> AcqResult<SampleType> {
        self.with_frame(|f| f.sample_type)
    }
}
