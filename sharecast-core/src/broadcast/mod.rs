//! Fan-out of encoded frames to every admitted viewer.
//!
//! Each viewer owns an [`OutboundQueue`] and a send task that drains
//! it into the viewer's [`FrameSink`]. A broadcast only touches the
//! queues, so a slow viewer never delays or drops frames for another
//! one. The viewer set is snapshotted per broadcast: a viewer added
//! mid-broadcast starts with the next frame, and a removed viewer's
//! queue is closed under its own lock so nothing is sent after removal.

pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ShareError;
use crate::session::SessionId;
use crate::stream::bandwidth::SendMeter;
use crate::stream::encoder::KeyframeRequest;
use crate::stream::types::Frame;
use crate::viewer::{DisconnectReason, PhaseTracker, ViewerConnection, ViewerId, ViewerPhase};

pub use queue::{DropReason, OutboundQueue, PushOutcome};

// ── FrameSink ────────────────────────────────────────────────────

/// Write side of one viewer's transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Called once before the first frame is written.
    async fn open(&mut self, _session: SessionId) -> Result<(), ShareError> {
        Ok(())
    }

    async fn send_frame(&mut self, session: SessionId, frame: &Frame) -> Result<(), ShareError>;

    /// Called once after the viewer was disconnected.
    async fn close(&mut self, reason: DisconnectReason) -> Result<(), ShareError>;
}

/// What an in-process viewer receives from a [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Opened(SessionId),
    Frame(Frame),
    Closed(DisconnectReason),
}

/// Sink backed by a bounded channel; a full channel applies
/// backpressure exactly like a slow socket.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn open(&mut self, session: SessionId) -> Result<(), ShareError> {
        self.tx
            .send(SinkEvent::Opened(session))
            .await
            .map_err(|_| ShareError::TransportError("viewer channel closed".into()))
    }

    async fn send_frame(&mut self, _session: SessionId, frame: &Frame) -> Result<(), ShareError> {
        self.tx
            .send(SinkEvent::Frame(frame.clone()))
            .await
            .map_err(|_| ShareError::TransportError("viewer channel closed".into()))
    }

    async fn close(&mut self, reason: DisconnectReason) -> Result<(), ShareError> {
        // A viewer that stopped reading must not hold up teardown.
        let _ = self.tx.try_send(SinkEvent::Closed(reason));
        Ok(())
    }
}

// ── BroadcastConfig ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Queue budget in multiples of the last keyframe size.
    pub queue_keyframes: usize,
    /// Lower bound on the queue budget in bytes.
    pub min_queue_bytes: usize,
    /// A stalled viewer (or a single blocked write) is disconnected
    /// after this long.
    pub stall_timeout: Duration,
    /// Unacknowledged frames tolerated before a resync is requested.
    pub loss_threshold: u64,
    /// Time allowed for the goodbye write on teardown.
    pub close_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_keyframes: 3,
            min_queue_bytes: 64 * 1024,
            stall_timeout: Duration::from_secs(5),
            loss_threshold: 60,
            close_timeout: Duration::from_secs(1),
        }
    }
}

// ── StreamCursor ─────────────────────────────────────────────────

/// Position of the session's encode stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCursor {
    pub last_sequence: Option<u64>,
    pub last_keyframe: Option<u64>,
    pub last_keyframe_len: usize,
}

// ── ViewerSlot ───────────────────────────────────────────────────

struct SlotState {
    queue: OutboundQueue,
    last_acked: Option<u64>,
    /// First sequence offered; stands in for the ack mark until the
    /// viewer acknowledges anything.
    baseline: Option<u64>,
    /// Sequence at which the last resync was requested for this viewer.
    resync_at: Option<u64>,
    meter: SendMeter,
}

struct ViewerSlot {
    id: ViewerId,
    identity: String,
    joined_at: Instant,
    phase: PhaseTracker,
    state: Mutex<SlotState>,
    ready: Notify,
    cancel: CancellationToken,
}

impl ViewerSlot {
    async fn next_frame(&self) -> Option<Arc<Frame>> {
        loop {
            {
                let mut st = self.state.lock().await;
                if st.queue.is_closed() {
                    return None;
                }
                if let Some(frame) = st.queue.pop() {
                    return Some(frame);
                }
            }
            self.ready.notified().await;
        }
    }

    async fn stall_expired(&self, timeout: Duration) -> bool {
        self.state.lock().await.queue.stall_expired(timeout, Instant::now())
    }

    async fn shutdown(&self, reason: DisconnectReason) {
        self.state.lock().await.queue.close();
        let _ = self.phase.apply(|p| p.disconnect(reason));
        self.cancel.cancel();
        self.ready.notify_one();
    }

    async fn snapshot(&self) -> ViewerConnection {
        let st = self.state.lock().await;
        ViewerConnection {
            id: self.id,
            identity: self.identity.clone(),
            phase: self.phase.current(),
            last_acked: st.last_acked,
            queue_depth: st.queue.len(),
            queued_bytes: st.queue.queued_bytes(),
            send_latency: st.meter.latency(),
            bytes_per_sec: st.meter.bytes_per_sec(),
            dropped_frames: st.queue.dropped(),
            joined_at: self.joined_at,
        }
    }
}

// ── BroadcastTransport ───────────────────────────────────────────

/// Per-session fan-out hub.
pub struct BroadcastTransport {
    session_id: SessionId,
    config: BroadcastConfig,
    keyframe_request: KeyframeRequest,
    viewers: RwLock<HashMap<ViewerId, Arc<ViewerSlot>>>,
    cursor: Mutex<StreamCursor>,
    next_viewer: AtomicU64,
    frames_broadcast: AtomicU64,
    closed: AtomicBool,
}

impl BroadcastTransport {
    pub fn new(session_id: SessionId, config: BroadcastConfig) -> Self {
        Self {
            session_id,
            config,
            keyframe_request: KeyframeRequest::default(),
            viewers: RwLock::new(HashMap::new()),
            cursor: Mutex::new(StreamCursor::default()),
            next_viewer: AtomicU64::new(1),
            frames_broadcast: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Resync handle shared with the session's encoder.
    pub fn keyframe_request(&self) -> KeyframeRequest {
        self.keyframe_request.clone()
    }

    pub async fn cursor(&self) -> StreamCursor {
        *self.cursor.lock().await
    }

    /// Frames handed to [`broadcast`](Self::broadcast) so far.
    pub fn frames_broadcast(&self) -> u64 {
        self.frames_broadcast.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Admit a viewer and start its send task.
    ///
    /// `phase` must be `Authenticating`; it moves to `Streaming` here.
    pub async fn register(
        self: &Arc<Self>,
        identity: String,
        sink: Box<dyn FrameSink>,
        phase: PhaseTracker,
    ) -> Result<ViewerId, ShareError> {
        let id = ViewerId::new(self.next_viewer.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ViewerSlot {
            id,
            identity,
            joined_at: Instant::now(),
            phase,
            state: Mutex::new(SlotState {
                queue: OutboundQueue::new(),
                last_acked: None,
                baseline: None,
                resync_at: None,
                meter: SendMeter::new(),
            }),
            ready: Notify::new(),
            cancel: CancellationToken::new(),
        });

        {
            let mut viewers = self.viewers.write().await;
            if self.is_closed() {
                return Err(ShareError::SessionClosed);
            }
            slot.phase.apply(ViewerPhase::admit)?;
            viewers.insert(id, Arc::clone(&slot));
        }

        info!(session = %self.session_id, viewer = %id, identity = %slot.identity, "viewer streaming");
        tokio::spawn(Arc::clone(self).send_loop(slot, sink));
        // Late joiners start at the next keyframe; do not make them wait
        // for the periodic one.
        self.keyframe_request.request();
        Ok(id)
    }

    /// Remove a viewer; returns `false` if it was already gone.
    pub async fn disconnect(&self, id: ViewerId, reason: DisconnectReason) -> bool {
        let slot = self.viewers.write().await.remove(&id);
        match slot {
            Some(slot) => {
                slot.shutdown(reason).await;
                info!(session = %self.session_id, viewer = %id, %reason, "viewer disconnected");
                true
            }
            None => false,
        }
    }

    /// Disconnect every viewer and refuse new ones.
    pub async fn close_all(&self, reason: DisconnectReason) -> usize {
        let drained: Vec<_> = {
            let mut viewers = self.viewers.write().await;
            self.closed.store(true, Ordering::Release);
            viewers.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.shutdown(reason).await;
        }
        if !drained.is_empty() {
            info!(session = %self.session_id, viewers = drained.len(), %reason, "all viewers disconnected");
        }
        drained.len()
    }

    /// Offer one encoded frame to every current viewer.
    ///
    /// Returns how many viewers queued it.
    pub async fn broadcast(&self, frame: Frame) -> usize {
        let frame = Arc::new(frame);
        let budget = {
            let mut cursor = self.cursor.lock().await;
            cursor.last_sequence = Some(frame.sequence);
            if frame.is_keyframe() {
                cursor.last_keyframe = Some(frame.sequence);
                cursor.last_keyframe_len = frame.payload_len();
            }
            (cursor.last_keyframe_len * self.config.queue_keyframes).max(self.config.min_queue_bytes)
        };
        self.frames_broadcast.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<Arc<ViewerSlot>> = self.viewers.read().await.values().cloned().collect();
        let now = Instant::now();
        let mut queued = 0;
        let mut resync = false;
        let mut expired = Vec::new();

        for slot in snapshot {
            let mut st = slot.state.lock().await;
            let outcome = st
                .queue
                .push(Arc::clone(&frame), budget, self.config.stall_timeout, now);

            match outcome {
                PushOutcome::Queued => queued += 1,
                PushOutcome::Stalled { entered } => {
                    queued += 1;
                    if entered {
                        warn!(viewer = %slot.id, queued_bytes = st.queue.queued_bytes(), "viewer stalled");
                        let _ = slot.phase.apply(ViewerPhase::stall);
                        resync = true;
                    }
                }
                PushOutcome::Dropped(reason) => {
                    debug!(viewer = %slot.id, seq = frame.sequence, ?reason, "frame withheld");
                }
                PushOutcome::StallExpired => {
                    expired.push(slot.id);
                    continue;
                }
                PushOutcome::Closed => continue,
            }
            slot.ready.notify_one();

            let baseline = *st.baseline.get_or_insert(frame.sequence);
            let low = st.last_acked.unwrap_or(baseline);
            let gap = frame.sequence.saturating_sub(low);
            let since_resync = st.resync_at.map(|at| frame.sequence.saturating_sub(at));
            if gap > self.config.loss_threshold
                && since_resync.is_none_or(|d| d > self.config.loss_threshold)
            {
                debug!(viewer = %slot.id, gap, "ack gap over threshold; requesting resync");
                st.resync_at = Some(frame.sequence);
                resync = true;
            }
        }

        if resync {
            self.keyframe_request.request();
        }
        for id in expired {
            warn!(viewer = %id, "stall timeout");
            self.disconnect(id, DisconnectReason::StallTimeout).await;
        }
        queued
    }

    /// Record a viewer's acknowledgement. Marks beyond what was sent to
    /// the viewer are clamped.
    pub async fn acknowledge(&self, id: ViewerId, sequence: u64) -> Result<(), ShareError> {
        let slot = self
            .viewers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ShareError::ProtocolViolation("ack from unknown viewer"))?;
        let mut st = slot.state.lock().await;
        let Some(sent) = st.queue.last_sent() else {
            return Ok(());
        };
        let mark = sequence.min(sent);
        if st.last_acked.is_none_or(|prev| mark > prev) {
            st.last_acked = Some(mark);
        }
        Ok(())
    }

    pub async fn viewers(&self) -> Vec<ViewerConnection> {
        let snapshot: Vec<Arc<ViewerSlot>> = self.viewers.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for slot in snapshot {
            out.push(slot.snapshot().await);
        }
        out.sort_by_key(|v| v.id);
        out
    }

    pub async fn viewer(&self, id: ViewerId) -> Option<ViewerConnection> {
        let slot = self.viewers.read().await.get(&id).cloned()?;
        Some(slot.snapshot().await)
    }

    pub async fn stalled_count(&self) -> usize {
        self.viewers
            .read()
            .await
            .values()
            .filter(|slot| slot.phase.current().is_stalled())
            .count()
    }

    // ── Send task ────────────────────────────────────────────────

    async fn send_loop(self: Arc<Self>, slot: Arc<ViewerSlot>, mut sink: Box<dyn FrameSink>) {
        let failure = match sink.open(self.session_id).await {
            Ok(()) => self.pump(&slot, sink.as_mut()).await,
            Err(e) => {
                warn!(viewer = %slot.id, "opening stream failed: {e}");
                Some(DisconnectReason::TransportError)
            }
        };
        if let Some(reason) = failure {
            self.disconnect(slot.id, reason).await;
        }

        let reason = slot
            .phase
            .current()
            .disconnect_reason()
            .unwrap_or(DisconnectReason::TransportError);
        match tokio::time::timeout(self.config.close_timeout, sink.close(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(viewer = %slot.id, "close failed: {e}"),
            Err(_) => debug!(viewer = %slot.id, "close timed out"),
        }
    }

    /// Drain the viewer's queue until it is closed or a write fails.
    async fn pump(&self, slot: &ViewerSlot, sink: &mut dyn FrameSink) -> Option<DisconnectReason> {
        let stall_timeout = self.config.stall_timeout;
        loop {
            // Wake up at least once per timeout so a stall is noticed
            // even when the encoder has nothing new to send.
            let next = tokio::time::timeout(stall_timeout, slot.next_frame());
            let frame = tokio::select! {
                _ = slot.cancel.cancelled() => return None,
                next = next => match next {
                    Ok(frame) => frame?,
                    Err(_) => {
                        if slot.stall_expired(stall_timeout).await {
                            warn!(viewer = %slot.id, "stall timeout");
                            return Some(DisconnectReason::StallTimeout);
                        }
                        continue;
                    }
                },
            };

            let started = Instant::now();
            let write = tokio::time::timeout(
                stall_timeout,
                sink.send_frame(self.session_id, &frame),
            );
            let result = tokio::select! {
                _ = slot.cancel.cancelled() => return None,
                result = write => result,
            };

            match result {
                Ok(Ok(())) => {
                    let mut st = slot.state.lock().await;
                    st.meter.record(frame.payload_len() as u64, started.elapsed());
                    if st.queue.settle() {
                        let _ = slot.phase.apply(ViewerPhase::resume);
                        info!(viewer = %slot.id, "viewer caught up");
                        if st.queue.is_awaiting_keyframe() {
                            self.keyframe_request.request();
                        }
                    } else if st.queue.stall_expired(stall_timeout, Instant::now()) {
                        warn!(viewer = %slot.id, "stall timeout");
                        return Some(DisconnectReason::StallTimeout);
                    }
                }
                Ok(Err(e)) => {
                    warn!(viewer = %slot.id, "send failed: {e}");
                    return Some(DisconnectReason::TransportError);
                }
                Err(_) => {
                    warn!(viewer = %slot.id, timeout = ?stall_timeout, "write blocked");
                    return Some(DisconnectReason::StallTimeout);
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::FrameKind;
    use bytes::Bytes;

    fn frame(seq: u64, kind: FrameKind, len: usize) -> Frame {
        Frame {
            sequence: seq,
            kind,
            captured_at: Instant::now(),
            payload: Bytes::from(vec![1u8; len]),
        }
    }

    fn authenticating() -> PhaseTracker {
        let phase = PhaseTracker::new();
        phase.apply(ViewerPhase::submit_code).unwrap();
        phase
    }

    async fn next_frame(rx: &mut mpsc::Receiver<SinkEvent>) -> Frame {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(SinkEvent::Frame(f))) => return f,
                Ok(Some(SinkEvent::Opened(_))) => continue,
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    fn transport(config: BroadcastConfig) -> Arc<BroadcastTransport> {
        Arc::new(BroadcastTransport::new(SessionId::new(1), config))
    }

    #[tokio::test]
    async fn register_requests_keyframe_and_streams() {
        let t = transport(BroadcastConfig::default());
        let (sink, mut rx) = ChannelSink::new(16);
        let phase = authenticating();
        let id = t.register("alice".into(), Box::new(sink), phase.clone()).await.unwrap();

        assert!(phase.current().is_streaming());
        assert!(t.keyframe_request().is_pending());
        assert!(matches!(rx.recv().await, Some(SinkEvent::Opened(_))));

        t.broadcast(frame(0, FrameKind::Keyframe, 100)).await;
        t.broadcast(frame(1, FrameKind::Delta { reference: 0 }, 10)).await;
        assert_eq!(next_frame(&mut rx).await.sequence, 0);
        assert_eq!(next_frame(&mut rx).await.sequence, 1);

        t.acknowledge(id, 1).await.unwrap();
        let info = t.viewer(id).await.unwrap();
        assert_eq!(info.last_acked, Some(1));
        assert_eq!(info.identity, "alice");
    }

    #[tokio::test]
    async fn late_joiner_skips_deltas_until_keyframe() {
        let t = transport(BroadcastConfig::default());
        t.broadcast(frame(0, FrameKind::Keyframe, 100)).await;

        let (sink, mut rx) = ChannelSink::new(16);
        t.register("late".into(), Box::new(sink), authenticating()).await.unwrap();
        t.broadcast(frame(1, FrameKind::Delta { reference: 0 }, 10)).await;
        t.broadcast(frame(2, FrameKind::Keyframe, 100)).await;
        t.broadcast(frame(3, FrameKind::Delta { reference: 2 }, 10)).await;

        assert_eq!(next_frame(&mut rx).await.sequence, 2);
        assert_eq!(next_frame(&mut rx).await.sequence, 3);
    }

    #[tokio::test]
    async fn close_all_disconnects_with_reason() {
        let t = transport(BroadcastConfig::default());
        let (sink, mut rx) = ChannelSink::new(16);
        let phase = authenticating();
        t.register("v".into(), Box::new(sink), phase.clone()).await.unwrap();

        assert_eq!(t.close_all(DisconnectReason::SessionClosed).await, 1);
        assert_eq!(
            phase.current().disconnect_reason(),
            Some(DisconnectReason::SessionClosed)
        );

        let mut saw_closed = false;
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            if let SinkEvent::Closed(reason) = ev {
                assert_eq!(reason, DisconnectReason::SessionClosed);
                saw_closed = true;
            }
        }
        assert!(saw_closed);

        let (sink, _rx) = ChannelSink::new(1);
        assert!(matches!(
            t.register("again".into(), Box::new(sink), authenticating()).await,
            Err(ShareError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn dropped_sink_disconnects_with_transport_error() {
        let t = transport(BroadcastConfig::default());
        let (sink, rx) = ChannelSink::new(1);
        let phase = authenticating();
        t.register("gone".into(), Box::new(sink), phase.clone()).await.unwrap();
        drop(rx);

        t.broadcast(frame(0, FrameKind::Keyframe, 10)).await;
        let mut watch = phase.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            watch.wait_for(|p| p.is_disconnected()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            phase.current().disconnect_reason(),
            Some(DisconnectReason::TransportError)
        );
        assert_eq!(t.viewer_count().await, 0);
    }

    /// Accepts every frame, but takes `delay` per write.
    struct SlowSink {
        delay: Duration,
    }

    #[async_trait]
    impl FrameSink for SlowSink {
        async fn send_frame(&mut self, _session: SessionId, _frame: &Frame) -> Result<(), ShareError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn close(&mut self, _reason: DisconnectReason) -> Result<(), ShareError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stall_times_out_without_further_broadcasts() {
        let t = transport(BroadcastConfig {
            queue_keyframes: 1,
            min_queue_bytes: 0,
            stall_timeout: Duration::from_millis(250),
            ..Default::default()
        });
        let sink = SlowSink {
            delay: Duration::from_millis(100),
        };
        let phase = authenticating();
        t.register("slow".into(), Box::new(sink), phase.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // Frame 0 is being written; 1 is superseded by 2, which stalls.
        t.broadcast(frame(0, FrameKind::Keyframe, 100)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        t.broadcast(frame(1, FrameKind::Keyframe, 100)).await;
        t.broadcast(frame(2, FrameKind::Keyframe, 100)).await;
        assert!(phase.current().is_stalled());

        // Keep one frame queued behind each write, then go quiet.
        tokio::time::sleep(Duration::from_millis(108)).await;
        t.broadcast(frame(3, FrameKind::Keyframe, 100)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        t.broadcast(frame(4, FrameKind::Keyframe, 100)).await;

        let mut watch = phase.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            watch.wait_for(|p| p.is_disconnected()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            phase.current().disconnect_reason(),
            Some(DisconnectReason::StallTimeout)
        );
        assert_eq!(t.viewer_count().await, 0);
    }

    #[tokio::test]
    async fn ack_gap_requests_resync() {
        let t = transport(BroadcastConfig {
            loss_threshold: 5,
            ..Default::default()
        });
        let (sink, mut rx) = ChannelSink::new(64);
        let id = t.register("v".into(), Box::new(sink), authenticating()).await.unwrap();
        t.broadcast(frame(0, FrameKind::Keyframe, 10)).await;
        t.keyframe_request.take();

        for seq in 1..=5 {
            t.broadcast(frame(seq, FrameKind::Delta { reference: seq - 1 }, 1)).await;
        }
        assert!(!t.keyframe_request().is_pending());

        t.broadcast(frame(6, FrameKind::Delta { reference: 5 }, 1)).await;
        assert!(t.keyframe_request().is_pending());
        t.keyframe_request.take();

        for _ in 0..=6 {
            next_frame(&mut rx).await;
        }
        t.acknowledge(id, 6).await.unwrap();
        t.broadcast(frame(7, FrameKind::Delta { reference: 6 }, 1)).await;
        assert!(!t.keyframe_request().is_pending());
    }
}
