//! Capture → encode → broadcast for one session.
//!
//! The capture task publishes into a newest-frame `watch` slot; the
//! encode task picks up whatever is newest, encodes it on the blocking
//! pool and hands the result to the session's [`BroadcastTransport`].
//! Neither task ever waits on a viewer.
//!
//! Both tasks run under the session's cancellation token. A capture
//! failure or a fatal encode failure closes the session.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broadcast::BroadcastTransport;
use crate::error::ShareError;
use crate::session::{SessionId, SessionManager, SessionState};
use crate::stream::capture::{CaptureConfig, CaptureTrigger, FrameCapture, FrameSlot, FrameSource};
use crate::stream::encoder::{EncoderConfig, EncoderStats, FrameEncoder};

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
}

/// Handle to a session's running pipeline.
pub struct StreamPipeline {
    session_id: SessionId,
    trigger: CaptureTrigger,
    stats: watch::Receiver<EncoderStats>,
    task: JoinHandle<Result<(), ShareError>>,
}

impl StreamPipeline {
    /// Start streaming `source` into an active session.
    pub async fn spawn<S: FrameSource>(
        manager: Arc<SessionManager>,
        session_id: SessionId,
        source: S,
        config: PipelineConfig,
    ) -> Result<Self, ShareError> {
        let session = manager
            .session(session_id)
            .await
            .ok_or(ShareError::SessionClosed)?;
        if session.state().await != SessionState::Active {
            return Err(ShareError::SessionClosed);
        }

        let cancel = session.cancel_token();
        let transport = session.transport();
        let capture = FrameCapture::spawn(source, config.capture, cancel.clone());
        let trigger = capture.trigger();
        let encoder =
            FrameEncoder::with_keyframe_request(config.encoder, transport.keyframe_request());
        let (stats_tx, stats) = watch::channel(EncoderStats::default());

        let task = tokio::spawn(supervise(
            manager, session_id, capture, encoder, transport, stats_tx, cancel,
        ));
        info!(session = %session_id, "stream pipeline started");

        Ok(Self {
            session_id,
            trigger,
            stats,
            task,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Ask for an immediate capture (display content changed).
    pub fn trigger(&self) -> CaptureTrigger {
        self.trigger.clone()
    }

    pub fn stats(&self) -> EncoderStats {
        *self.stats.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pipeline to stop; returns the failure that ended it,
    /// if any.
    pub async fn join(self) -> Result<(), ShareError> {
        self.task
            .await
            .map_err(|e| ShareError::EncodeFailure(format!("pipeline task failed: {e}")))?
    }
}

async fn supervise(
    manager: Arc<SessionManager>,
    session_id: SessionId,
    capture: FrameCapture,
    encoder: FrameEncoder,
    transport: Arc<BroadcastTransport>,
    stats: watch::Sender<EncoderStats>,
    cancel: CancellationToken,
) -> Result<(), ShareError> {
    let (frames, capture_task) = capture.into_parts();

    let encoded = encode_loop(frames, encoder, &transport, &stats, &cancel).await;
    if let Err(e) = &encoded {
        error!(session = %session_id, "encoder failed: {e}");
        manager.close_session(session_id).await;
    }

    let captured = capture_task
        .await
        .map_err(|e| ShareError::CaptureFailure(format!("capture task failed: {e}")))
        .and_then(|r| r);
    if let Err(e) = &captured {
        error!(session = %session_id, "capture failed: {e}");
        manager.close_session(session_id).await;
    }

    info!(
        session = %session_id,
        frames = transport.frames_broadcast(),
        "stream pipeline stopped"
    );
    encoded.and(captured)
}

async fn encode_loop(
    mut frames: watch::Receiver<FrameSlot>,
    mut encoder: FrameEncoder,
    transport: &BroadcastTransport,
    stats: &watch::Sender<EncoderStats>,
    cancel: &CancellationToken,
) -> Result<(), ShareError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            changed = frames.changed() => {
                // Sender dropped: the capture task has ended.
                if changed.is_err() {
                    return Ok(());
                }
            }
        }

        let Some(raw) = frames.borrow_and_update().clone() else {
            continue;
        };

        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = encoder.encode(&raw);
            (encoder, result)
        })
        .await
        .map_err(|e| ShareError::EncodeFailure(format!("encode thread failed: {e}")))?;
        encoder = returned;
        stats.send_replace(encoder.stats());

        if let Some(frame) = result? {
            let seq = frame.sequence;
            let queued = transport.broadcast(frame).await;
            debug!(seq, queued, "frame broadcast");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
