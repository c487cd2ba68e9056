//! Per-stream capture pipeline.
//!
//! Each running video stream is one tokio task that pulls frames from its
//! camera, optionally averages them, and fans every output frame out to the
//! stream's packet buffer (for the client) and its storage writer (for
//! disk). The task ends when the frame budget is met or the runtime signals
//! a halt; either way the writer is shut down so trailing partial chunks
//! reach disk.
//!
//! Halting is a `watch` channel rather than a oneshot so every await point
//! in the loop can race against it: the signal is sticky, and a halt that
//! loses one `select!` is picked up at the next.

use crate::camera::Camera;
use crate::core::VideoFrame;
use crate::error::{AcqError, AcqResult};
use crate::packet::PacketBuffer;
use crate::storage::{StorageWriter, WriterConfig};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Software trigger pulses queued ahead of the capture loop.
const TRIGGER_QUEUE_DEPTH: usize = 64;

// ============================================================================
// Frame averaging
// ============================================================================

/// Non-overlapping N-frame box average.
///
/// Accumulates in `f64` and casts back to the source sample type when a
/// window completes. Windows never span a halt; frames left in an open
/// window when the stream ends are dropped.
pub(crate) struct FrameAverager {
    window: u32,
    acc: Vec<f64>,
    count: u32,
    head: Option<VideoFrame>,
}

impl FrameAverager {
    pub(crate) fn new(window: u32) -> Self {
        Self {
            window,
            acc: Vec::new(),
            count: 0,
            head: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.window <= 1
    }

    /// Feed one camera frame. Returns an output frame when a window
    /// completes; in passthrough mode every frame comes straight back.
    pub(crate) fn push(&mut self, frame: VideoFrame) -> Option<VideoFrame> {
        if self.is_passthrough() {
            return Some(frame);
        }

        let samples = frame.sample_count();
        if self.count == 0 {
            self.acc.clear();
            self.acc.resize(samples, 0.0);
            self.head = Some(frame.clone());
        }
        let sample_type = frame.sample_type;
        for i in 0..samples {
            self.acc[i] += sample_type.read_f64(&frame.data, i);
        }
        self.count += 1;
        if self.count < self.window {
            return None;
        }

        // Window complete: the output frame carries the metadata of the
        // first frame it was averaged from.
        let head = self.head.take()?;
        let mut data = vec![0u8; samples * sample_type.bytes_per_sample()];
        let n = f64::from(self.window);
        for i in 0..samples {
            sample_type.write_f64(&mut data, i, self.acc[i] / n);
        }
        self.count = 0;
        Some(VideoFrame {
            metadata: head.metadata,
            shape: head.shape,
            sample_type,
            data: Bytes::from(data),
        })
    }
}

// ============================================================================
// Stream task
// ============================================================================

/// Everything a stream task needs, handed over at spawn time.
pub(crate) struct StreamSpec {
    pub id: usize,
    pub camera: Box<dyn Camera>,
    pub writer: Box<dyn StorageWriter>,
    pub writer_config: WriterConfig,
    pub metadata: Option<Value>,
    pub buffer: Arc<PacketBuffer>,
    pub max_frame_count: u64,
    pub frame_average_count: u32,
    pub first_frame_id: u64,
    pub triggered: bool,
}

/// Runtime-side handle to one running stream.
pub(crate) struct StreamHandle {
    pub id: usize,
    pub buffer: Arc<PacketBuffer>,
    pub triggered: bool,
    pub max_frame_count: u64,
    task: JoinHandle<AcqResult<u64>>,
    halt_tx: watch::Sender<bool>,
    trigger_tx: mpsc::Sender<()>,
}

impl StreamHandle {
    /// Ask the task to stop at its next await point and finalize storage.
    pub(crate) fn halt(&self) {
        let _ = self.halt_tx.send(true);
    }

    /// Queue one software trigger pulse.
    pub(crate) fn fire_trigger(&self) -> AcqResult<()> {
        self.trigger_tx
            .try_send(())
            .map_err(|_| AcqError::stream_fault(self.id, "trigger queue full or stream ended"))
    }

    /// Last-resort cancellation for a task that ignored [`halt`].
    pub(crate) fn force_abort(&self) {
        self.task.abort();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task and return how many frames it delivered. Safe to
    /// retry if an enclosing timeout cancels the wait before completion.
    pub(crate) async fn join(&mut self) -> AcqResult<u64> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(join_error) => Err(AcqError::stream_fault(self.id, join_error)),
        }
    }
}

/// Spawn the capture task for one configured stream.
pub(crate) fn spawn(handle: &tokio::runtime::Handle, spec: StreamSpec) -> StreamHandle {
    let (halt_tx, halt_rx) = watch::channel(false);
    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
    let id = spec.id;
    let buffer = spec.buffer.clone();
    let triggered = spec.triggered;
    let max_frame_count = spec.max_frame_count;
    let task = handle.spawn(run_stream(spec, halt_rx, trigger_rx));
    StreamHandle {
        id,
        buffer,
        triggered,
        max_frame_count,
        task,
        halt_tx,
        trigger_tx,
    }
}

async fn run_stream(
    spec: StreamSpec,
    mut halt_rx: watch::Receiver<bool>,
    mut trigger_rx: mpsc::Receiver<()>,
) -> AcqResult<u64> {
    let StreamSpec {
        id,
        mut camera,
        mut writer,
        writer_config,
        metadata,
        buffer,
        max_frame_count,
        frame_average_count,
        first_frame_id,
        triggered,
    } = spec;

    writer.init(&writer_config).await?;
    writer.set_metadata(metadata.as_ref()).await?;
    camera.start().await?;
    tracing::debug!(
        "stream {} started (camera '{}', {} gating)",
        id,
        camera.identifier().name,
        if triggered { "trigger" } else { "free-run" }
    );

    let mut averager = FrameAverager::new(frame_average_count);
    let mut produced: u64 = 0;
    let mut fault: Option<AcqError> = None;

    'capture: while produced < max_frame_count {
        if *halt_rx.borrow() {
            break;
        }
        if triggered {
            tokio::select! {
                _ = halt_rx.changed() => break 'capture,
                pulse = trigger_rx.recv() => {
                    if pulse.is_none() {
                        break 'capture;
                    }
                }
            }
        }

        let frame = tokio::select! {
            _ = halt_rx.changed() => break 'capture,
            result = camera.next_frame() => match result {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!("stream {} camera fault: {}", id, e);
                    fault = Some(e);
                    break 'capture;
                }
            }
        };

        let Some(mut output) = averager.push(frame) else {
            continue;
        };
        output.metadata.frame_id = first_frame_id + produced;

        // Disk first, so a stalled packet consumer cannot hold back
        // storage.
        if let Err(e) = writer.write(std::slice::from_ref(&output)).await {
            tracing::error!("stream {} storage write failed: {}", id, e);
            fault = Some(e);
            break 'capture;
        }
        tokio::select! {
            _ = halt_rx.changed() => break 'capture,
            pushed = buffer.push(output) => {
                if let Err(e) = pushed {
                    fault = Some(e);
                    break 'capture;
                }
            }
        }
        produced += 1;
    }

    if let Err(e) = camera.stop().await {
        tracing::warn!("stream {} camera stop failed: {}", id, e);
    }
    writer.shutdown().await?;
    tracing::info!("stream {} finished with {} frames", id, produced);

    match fault {
        Some(e) => Err(e),
        None => Ok(produced),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::create_camera;
    use crate::core::{DeviceKind, SampleType, VideoFrameMetadata, VideoFrameTimestamps};
    use crate::properties::{CameraSettings, StorageSettings};
    use crate::registry::DeviceRegistry;
    use crate::storage::raw::TrashWriter;
    use std::time::Duration;

    fn test_frame(id: u64, value: u8) -> VideoFrame {
        VideoFrame {
            metadata: VideoFrameMetadata {
                frame_id: id,
                timestamps: VideoFrameTimestamps::default(),
            },
            shape: (4, 2),
            sample_type: SampleType::U8,
            data: Bytes::from(vec![value; 8]),
        }
    }

    fn empty_camera(w: u32, h: u32, exposure_us: f32) -> Box<dyn Camera> {
        let registry = DeviceRegistry::with_simulated_devices();
        let identifier = registry
            .select(DeviceKind::Camera, Some(".*empty"))
            .unwrap();
        let mut camera = create_camera(&identifier).unwrap();
        camera
            .apply_settings(&CameraSettings {
                shape: (w, h),
                exposure_time_us: exposure_us,
                ..Default::default()
            })
            .unwrap();
        camera
    }

    fn spec(
        camera: Box<dyn Camera>,
        buffer: Arc<PacketBuffer>,
        max_frame_count: u64,
        frame_average_count: u32,
        triggered: bool,
    ) -> StreamSpec {
        StreamSpec {
            id: 0,
            camera,
            writer: Box::new(TrashWriter::new()),
            writer_config: WriterConfig {
                settings: StorageSettings::default(),
                frame_shape: (16, 8),
                sample_type: SampleType::U8,
                max_frame_count,
            },
            metadata: None,
            buffer,
            max_frame_count,
            frame_average_count,
            first_frame_id: 0,
            triggered,
        }
    }

    #[test]
    fn test_averager_means_whole_windows() {
        let mut averager = FrameAverager::new(2);
        assert!(averager.push(test_frame(0, 10)).is_none());
        let out = averager.push(test_frame(1, 20)).unwrap();
        assert!(out.data.iter().all(|&b| b == 15));
        assert_eq!(out.metadata.frame_id, 0);
        // A new window opens; one frame alone emits nothing.
        assert!(averager.push(test_frame(2, 99)).is_none());
    }

    #[test]
    fn test_averager_passthrough_when_disabled() {
        for window in [0, 1] {
            let mut averager = FrameAverager::new(window);
            let out = averager.push(test_frame(7, 42)).unwrap();
            assert_eq!(out.metadata.frame_id, 7);
            assert!(out.data.iter().all(|&b| b == 42));
        }
    }

    #[tokio::test]
    async fn test_stream_stops_at_frame_budget() {
        let buffer = Arc::new(PacketBuffer::new(64));
        let mut handle = spawn(
            &tokio::runtime::Handle::current(),
            spec(empty_camera(16, 8, 0.0), buffer.clone(), 5, 0, false),
        );
        let produced = handle.join().await.unwrap();
        assert_eq!(produced, 5);

        let packet = buffer.take();
        assert_eq!(packet.frame_count(), 5);
        let ids: Vec<u64> = packet
            .frames()
            .map(|f| f.metadata().unwrap().frame_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stream_averaging_renumbers_outputs() {
        let buffer = Arc::new(PacketBuffer::new(64));
        let mut handle = spawn(
            &tokio::runtime::Handle::current(),
            spec(empty_camera(16, 8, 0.0), buffer.clone(), 3, 2, false),
        );
        // Budget counts averaged output frames, not camera frames.
        assert_eq!(handle.join().await.unwrap(), 3);

        let packet = buffer.take();
        let ids: Vec<u64> = packet
            .frames()
            .map(|f| f.metadata().unwrap().frame_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_halt_ends_unbounded_stream() {
        let buffer = Arc::new(PacketBuffer::new(8));
        let mut handle = spawn(
            &tokio::runtime::Handle::current(),
            spec(
                empty_camera(16, 8, 100.0),
                buffer.clone(),
                u64::MAX,
                0,
                false,
            ),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.halt();
        let produced = handle.join().await.unwrap();
        assert!(produced > 0);
        assert_eq!(buffer.take().frame_count() as u64, produced);
    }

    #[tokio::test]
    async fn test_triggered_stream_emits_one_frame_per_pulse() {
        let buffer = Arc::new(PacketBuffer::new(64));
        let mut handle = spawn(
            &tokio::runtime::Handle::current(),
            spec(empty_camera(16, 8, 0.0), buffer.clone(), u64::MAX, 0, true),
        );

        // Nothing arrives until a pulse does.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(buffer.take().frame_count(), 0);

        for _ in 0..3 {
            handle.fire_trigger().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let packet = buffer.take();
        assert_eq!(packet.frame_count(), 3);
        let ids: Vec<u64> = packet
            .frames()
            .map(|f| f.metadata().unwrap().frame_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        handle.halt();
        handle.join().await.unwrap();
    }
}
