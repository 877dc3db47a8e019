//! Frame capture: fence-synchronised readback of the output texture.
//!
//! Per iteration, when armed:
//!
//! 1. [`CapturePipeline::issue_transfer`] enqueues an RGBA8 texture-to-staging copy (through the
//!    pool's RGBA8 frame texture when the pool format differs). This happens before the
//!    iteration's fence is recorded so the fence covers it.
//! 2. [`CapturePipeline::complete`] polls that fence, maps staging into the output image (black
//!    if the map is refused), then serves the pending screenshot and/or the recording stream.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use morpho_core::{EngineError, EngineEvent, Extent, FenceToken};

use crate::backend::{FenceStatus, Filter, GpuBackend, TextureId};
use crate::pool::TexturePool;

/// Accepted frames between two [`EngineEvent::FrameRecorded`] notifications.
pub const FRAME_RECORDED_EVERY: u64 = 60;

/// Receiving end of a recording stream (the video encoder lives behind it).
pub trait FrameSink: Send {
    /// Offer one frame. `false` means "not now": the stream pauses until [`FrameSink::poll_ready`]
    /// returns `true`.
    fn send_frame(&mut self, frame: &RgbaImage) -> bool;

    /// Readiness signal after a rejection.
    fn poll_ready(&mut self) -> bool {
        true
    }

    /// The consumer is gone for good. A closed sink ends the stream.
    fn is_closed(&self) -> bool {
        false
    }
}

/// [`FrameSink`] over a bounded channel. A full channel is backpressure.
#[derive(Debug)]
pub struct ChannelSink {
    tx: SyncSender<RgbaImage>,
    ready: Arc<AtomicBool>,
    closed: bool,
}

/// Consumer side of a [`ChannelSink`].
#[derive(Debug)]
pub struct ChannelSinkReceiver {
    rx: Receiver<RgbaImage>,
    ready: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, ChannelSinkReceiver) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let ready = Arc::new(AtomicBool::new(true));
        (
            Self {
                tx,
                ready: Arc::clone(&ready),
                closed: false,
            },
            ChannelSinkReceiver { rx, ready },
        )
    }
}

impl FrameSink for ChannelSink {
    fn send_frame(&mut self, frame: &RgbaImage) -> bool {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.ready.store(false, Ordering::Release);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.closed = true;
                false
            }
        }
    }

    fn poll_ready(&mut self) -> bool {
        !self.closed && self.ready.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ChannelSinkReceiver {
    /// Take one frame, if any. Draining re-signals readiness.
    pub fn try_recv(&self) -> Option<RgbaImage> {
        let frame = self.rx.try_recv().ok();
        if frame.is_some() {
            self.ready.store(true, Ordering::Release);
        }
        frame
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RgbaImage> {
        let frame = self.rx.recv_timeout(timeout).ok();
        if frame.is_some() {
            self.ready.store(true, Ordering::Release);
        }
        frame
    }

    pub fn drain(&self) -> Vec<RgbaImage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

struct Stream {
    sink: Box<dyn FrameSink>,
    ready: bool,
    accepted: u64,
}

pub struct CapturePipeline {
    once: Option<Option<PathBuf>>,
    stream: Option<Stream>,
    image: RgbaImage,
    poll_timeout: Duration,
    in_flight: bool,
}

impl fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("once", &self.once)
            .field("streaming", &self.stream.is_some())
            .field("dimensions", &self.image.dimensions())
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

fn save_screenshot(image: &RgbaImage, path: &Path) -> Result<(), EngineError> {
    image
        .save(path)
        .map_err(|e| EngineError::Capture(format!("save {}: {e}", path.display())))
}

fn black(extent: Extent) -> RgbaImage {
    RgbaImage::from_pixel(extent.width, extent.height, Rgba([0, 0, 0, 255]))
}

impl CapturePipeline {
    pub fn new(extent: Extent, poll_timeout: Duration) -> Self {
        Self {
            once: None,
            stream: None,
            image: black(extent),
            poll_timeout,
            in_flight: false,
        }
    }

    /// CPU mirror of the last captured output. Always the current pool extent.
    pub fn output_image(&self) -> &RgbaImage {
        &self.image
    }

    /// Arm a one-shot capture that only refreshes [`CapturePipeline::output_image`].
    pub fn request_capture(&mut self) {
        if self.once.is_none() {
            self.once = Some(None);
        }
    }

    /// Arm a one-shot capture written to `path` (format from the extension).
    pub fn request_screenshot(&mut self, path: impl AsRef<Path>) {
        self.once = Some(Some(path.as_ref().to_path_buf()));
    }

    pub fn start_stream(&mut self, sink: Box<dyn FrameSink>) {
        tracing::debug!("recording stream started");
        self.stream = Some(Stream {
            sink,
            ready: true,
            accepted: 0,
        });
    }

    /// Stops the stream and hands the sink back.
    pub fn stop_stream(&mut self) -> Option<Box<dyn FrameSink>> {
        self.stream.take().map(|s| {
            tracing::debug!(frames = s.accepted, "recording stream stopped");
            s.sink
        })
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Frames accepted by the current stream.
    pub fn frames_recorded(&self) -> u64 {
        self.stream.as_ref().map_or(0, |s| s.accepted)
    }

    /// Whether this iteration needs a readback. Polls a paused stream for readiness.
    pub fn is_armed(&mut self) -> bool {
        if let Some(s) = self.stream.as_mut() {
            if !s.ready && s.sink.poll_ready() {
                tracing::debug!("recording sink ready again");
                s.ready = true;
            }
        }
        self.once.is_some() || self.stream.as_ref().is_some_and(|s| s.ready)
    }

    /// New pool extent: the output image is reset to black at that size.
    pub fn resize(&mut self, extent: Extent) {
        self.image = black(extent);
    }

    /// Enqueue the readback of `output` (if any). Must run before the iteration's fence.
    pub fn issue_transfer<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        pool: &TexturePool,
        output: Option<TextureId>,
    ) {
        self.in_flight = false;
        let Some(src) = output else {
            return;
        };
        let extent = pool.extent();
        let src = if pool.format().is_rgba8() {
            src
        } else {
            match pool.texture(pool.frame_texture()) {
                Some(frame) => {
                    gpu.blit(src, extent, frame, extent, Filter::Nearest);
                    frame
                }
                None => return,
            }
        };
        gpu.read_to_staging(src, extent);
        self.in_flight = true;
    }

    /// Wait for `fence`, fill the output image and serve the armed consumers.
    pub fn complete<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        fence: FenceToken,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        if self.in_flight {
            loop {
                match gpu.poll_fence(fence, self.poll_timeout) {
                    FenceStatus::Signaled => break,
                    FenceStatus::Pending => continue,
                    FenceStatus::Failed => {
                        tracing::warn!(fence = fence.0, "fence wait failed");
                        break;
                    }
                }
            }
            if !gpu.map_staging(&mut self.image) {
                tracing::warn!("readback map refused; output image falls back to black");
                self.fill_black();
            }
        } else {
            self.fill_black();
        }
        self.in_flight = false;

        if let Some(target) = self.once.take() {
            if let Some(path) = target {
                let ok = match save_screenshot(&self.image, &path) {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), "screenshot saved");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "screenshot failed");
                        false
                    }
                };
                events.push(EngineEvent::ScreenshotSaved { path, ok });
            }
        }

        if let Err(e) = self.serve_stream(&mut events) {
            tracing::warn!(error = %e, "recording stream ended");
        }

        events
    }

    /// Offer the output image to a ready stream. A closed sink drops the stream.
    fn serve_stream(&mut self, events: &mut Vec<EngineEvent>) -> Result<(), EngineError> {
        let Some(s) = self.stream.as_mut().filter(|s| s.ready) else {
            return Ok(());
        };
        if s.sink.send_frame(&self.image) {
            s.accepted += 1;
            if s.accepted % FRAME_RECORDED_EVERY == 0 {
                events.push(EngineEvent::FrameRecorded(s.accepted));
            }
            return Ok(());
        }
        if s.sink.is_closed() {
            let accepted = s.accepted;
            self.stream = None;
            return Err(EngineError::Capture(format!(
                "recording consumer disconnected after {accepted} frames"
            )));
        }
        tracing::warn!("recording sink rejected frame; pausing stream");
        s.ready = false;
        Ok(())
    }

    fn fill_black(&mut self) {
        for px in self.image.pixels_mut() {
            *px = Rgba([0, 0, 0, 255]);
        }
    }
}
