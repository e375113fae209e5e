//! Periodic frame capture.
//!
//! A [`FrameSource`] produces raw frames; [`FrameCapture::spawn`] drives
//! it from a Tokio task at a fixed rate, or immediately when the host
//! signals a display change through [`CaptureTrigger`]. Frames are
//! published on a `watch` channel that only keeps the newest frame, so
//! capture never waits for the encoder or any viewer.
//!
//! A source error ends the task with [`ShareError::CaptureFailure`];
//! the owner is expected to close the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ShareError;
use crate::stream::types::{PixelFormat, RawFrame};

// ── FrameSource ──────────────────────────────────────────────────

/// A producer of raw screen images.
///
/// `capture` is called from a blocking-pool thread, so implementations
/// may block briefly on the platform API.
pub trait FrameSource: Send + 'static {
    /// Grab the current screen.
    ///
    /// `Ok(None)` means no new content is available this tick.
    fn capture(&mut self) -> Result<Option<RawFrame>, ShareError>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn capture(&mut self) -> Result<Option<RawFrame>, ShareError> {
        (**self).capture()
    }
}

// ── PatternSource ────────────────────────────────────────────────

/// Synthetic source rendering a static gradient with a vertical bar
/// that moves a few pixels per capture.
#[derive(Debug, Clone)]
pub struct PatternSource {
    width: u32,
    height: u32,
    bar_width: u32,
    step: u32,
    tick: u64,
    background: Vec<u8>,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let bpp = PixelFormat::Bgra8.bytes_per_pixel();
        let mut background = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height {
            for x in 0..width {
                background.extend_from_slice(&[
                    (x * 255 / width) as u8,
                    (y * 255 / height) as u8,
                    0x40,
                    0xFF,
                ]);
            }
        }
        Self {
            width,
            height,
            bar_width: 16.min(width),
            step: 8,
            tick: 0,
            background,
        }
    }

    /// Pixels the bar advances per capture.
    pub fn with_step(mut self, step: u32) -> Self {
        self.step = step;
        self
    }

    /// Render the frame for `tick` without advancing.
    pub fn render(&self, tick: u64) -> RawFrame {
        let bpp = PixelFormat::Bgra8.bytes_per_pixel();
        let stride = self.width as usize * bpp;
        let mut data = self.background.clone();

        let travel = (self.width - self.bar_width + 1) as u64;
        let left = ((tick * self.step as u64) % travel) as usize;
        for y in 0..self.height as usize {
            let row = &mut data[y * stride..(y + 1) * stride];
            for px in row[left * bpp..(left + self.bar_width as usize) * bpp].chunks_exact_mut(bpp) {
                px.copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
            }
        }

        RawFrame {
            width: self.width,
            height: self.height,
            stride: stride as u32,
            format: PixelFormat::Bgra8,
            data,
            timestamp: Instant::now(),
        }
    }
}

impl FrameSource for PatternSource {
    fn capture(&mut self) -> Result<Option<RawFrame>, ShareError> {
        let frame = self.render(self.tick);
        self.tick += 1;
        Ok(Some(frame))
    }
}

// ── CaptureConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Captures per second (1..=60).
    pub rate_hz: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { rate_hz: 20 }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz.clamp(1, 60) as f64)
    }
}

// ── CaptureTrigger ───────────────────────────────────────────────

/// Requests an immediate capture outside the regular cadence.
#[derive(Debug, Clone, Default)]
pub struct CaptureTrigger(Arc<Notify>);

impl CaptureTrigger {
    /// Signal that the display content changed.
    pub fn display_changed(&self) {
        self.0.notify_one();
    }
}

// ── FrameCapture ─────────────────────────────────────────────────

/// Latest captured frame, `None` until the first capture.
pub type FrameSlot = Option<Arc<RawFrame>>;

/// Handle to a running capture task.
pub struct FrameCapture {
    frames: watch::Receiver<FrameSlot>,
    trigger: CaptureTrigger,
    task: JoinHandle<Result<(), ShareError>>,
}

impl FrameCapture {
    /// Start capturing from `source` until `cancel` fires or the source
    /// fails.
    pub fn spawn<S: FrameSource>(
        source: S,
        config: CaptureConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, frames) = watch::channel(None);
        let trigger = CaptureTrigger::default();
        let task = tokio::spawn(capture_loop(source, config, tx, trigger.clone(), cancel));
        Self {
            frames,
            trigger,
            task,
        }
    }

    /// A fresh subscription; it observes the newest frame first.
    pub fn subscribe(&self) -> watch::Receiver<FrameSlot> {
        self.frames.clone()
    }

    pub fn trigger(&self) -> CaptureTrigger {
        self.trigger.clone()
    }

    /// Split into the frame receiver and the task handle.
    pub fn into_parts(self) -> (watch::Receiver<FrameSlot>, JoinHandle<Result<(), ShareError>>) {
        (self.frames, self.task)
    }
}

async fn capture_loop<S: FrameSource>(
    mut source: S,
    config: CaptureConfig,
    tx: watch::Sender<FrameSlot>,
    trigger: CaptureTrigger,
    cancel: CancellationToken,
) -> Result<(), ShareError> {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(rate_hz = config.rate_hz, "capture started");

    let mut captured: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = trigger.0.notified() => {}
        }

        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = source.capture();
            (source, result)
        })
        .await
        .map_err(|e| ShareError::CaptureFailure(format!("capture thread failed: {e}")))?;
        source = returned;

        match result {
            Ok(Some(frame)) => {
                captured += 1;
                tx.send_replace(Some(Arc::new(frame)));
            }
            Ok(None) => debug!("no new content"),
            Err(e) => {
                error!("capture failed: {e}");
                return Err(match e {
                    ShareError::CaptureFailure(_) => e,
                    other => ShareError::CaptureFailure(other.to_string()),
                });
            }
        }
    }

    info!(captured, "capture stopped");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
