//! Viewer-side connection: join with a code, then receive and decode
//! frames.
//!
//! The client acknowledges the newest applied frame every
//! `ack_every` frames or `ack_interval`, whichever comes first. A frame
//! that cannot be applied (broken reference chain) is skipped together
//! with every delta after it, up to the next keyframe.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::WireCodec;
use crate::error::ShareError;
use crate::session::SessionId;
use crate::stream::decoder::FrameDecoder;
use crate::stream::types::Frame;
use crate::viewer::DisconnectReason;
use crate::wire::{Ack, JoinRequest, Message};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Acknowledge after this many applied frames.
    pub ack_every: u64,
    /// Acknowledge at least this often while frames arrive.
    pub ack_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_every: 15,
            ack_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub frames: u64,
    pub keyframes: u64,
    pub deltas: u64,
    /// Frames discarded while waiting for a keyframe.
    pub skipped: u64,
    pub bytes: u64,
}

// ── ViewerClient ─────────────────────────────────────────────────

pub struct ViewerClient {
    framed: Framed<TcpStream, WireCodec>,
    config: ClientConfig,
    session_id: SessionId,
    decoder: FrameDecoder,
    /// Set after a chain error until a keyframe is applied.
    resyncing: bool,
    last_acked: Option<u64>,
    unacked: u64,
    last_ack_at: Instant,
    closed: Option<DisconnectReason>,
    stats: ClientStats,
}

impl ViewerClient {
    pub async fn join(
        addr: impl ToSocketAddrs,
        code: &str,
        identity: &str,
    ) -> Result<Self, ShareError> {
        Self::join_with(addr, code, identity, ClientConfig::default()).await
    }

    /// Connect and present `code`. Admission failures come back as the
    /// matching [`ShareError`] variant.
    pub async fn join_with(
        addr: impl ToSocketAddrs,
        code: &str,
        identity: &str,
        config: ClientConfig,
    ) -> Result<Self, ShareError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, WireCodec);

        framed
            .send(Message::Join(JoinRequest {
                code: code.to_string(),
                identity: identity.to_string(),
            }))
            .await?;

        let reply = tokio::time::timeout(config.join_timeout, framed.next())
            .await
            .map_err(|_| ShareError::Timeout(config.join_timeout))?;
        let session_id = match reply {
            Some(Ok(Message::JoinReply(reply))) => {
                reply.status.into_result()?;
                reply
                    .session_id
                    .map(SessionId::new)
                    .ok_or(ShareError::ProtocolViolation("accepted join without session id"))?
            }
            Some(Ok(Message::Closed(_))) => return Err(ShareError::SessionClosed),
            Some(Ok(_)) => return Err(ShareError::ProtocolViolation("expected join reply")),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ShareError::TransportError(
                    "connection closed during join".into(),
                ));
            }
        };
        info!(session = %session_id, identity, "joined");

        Ok(Self {
            framed,
            config,
            session_id,
            decoder: FrameDecoder::new(),
            resyncing: false,
            last_acked: None,
            unacked: 0,
            last_ack_at: Instant::now(),
            closed: None,
            stats: ClientStats::default(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Why the host ended the stream, once it has.
    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        self.closed
    }

    /// Next applied frame; `Ok(None)` once the stream has ended.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ShareError> {
        if self.closed.is_some() {
            return Ok(None);
        }

        loop {
            let frame = match self.framed.next().await {
                Some(Ok(Message::Frame(wire))) => {
                    if wire.session_id != self.session_id.get() {
                        return Err(ShareError::ProtocolViolation("frame for another session"));
                    }
                    wire.frame
                }
                Some(Ok(Message::Closed(closed))) => {
                    info!(session = %self.session_id, reason = %closed.reason, "stream closed by host");
                    self.closed = Some(closed.reason);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    warn!(kind = ?other.kind(), "unexpected message from host");
                    return Err(ShareError::ProtocolViolation("unexpected message from host"));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.closed = Some(DisconnectReason::TransportError);
                    return Ok(None);
                }
            };

            if self.resyncing && !frame.is_keyframe() {
                self.stats.skipped += 1;
                continue;
            }
            if let Err(e) = self.decoder.apply(&frame) {
                warn!(seq = frame.sequence, "dropping frame: {e}");
                self.stats.skipped += 1;
                self.resyncing = true;
                continue;
            }
            self.resyncing = false;

            self.stats.frames += 1;
            self.stats.bytes += frame.payload_len() as u64;
            if frame.is_keyframe() {
                self.stats.keyframes += 1;
            } else {
                self.stats.deltas += 1;
            }

            self.unacked += 1;
            if self.unacked >= self.config.ack_every
                || self.last_ack_at.elapsed() >= self.config.ack_interval
            {
                self.ack().await?;
            }
            return Ok(Some(frame));
        }
    }

    /// Acknowledge the newest applied frame now.
    pub async fn ack(&mut self) -> Result<(), ShareError> {
        let Some(seq) = self.decoder.last_sequence() else {
            return Ok(());
        };
        if self.last_acked != Some(seq) {
            self.framed
                .send(Message::Ack(Ack {
                    last_acknowledged: seq,
                }))
                .await?;
            debug!(seq, "ack sent");
            self.last_acked = Some(seq);
        }
        self.unacked = 0;
        self.last_ack_at = Instant::now();
        Ok(())
    }

    /// Tell the host we are leaving and close the connection.
    pub async fn leave(mut self) -> Result<(), ShareError> {
        if self.closed.is_none() {
            self.framed.send(Message::Leave).await?;
        }
        self.framed.close().await
    }
}
