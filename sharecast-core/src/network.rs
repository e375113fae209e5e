//! TCP front end for viewers.
//!
//! One task per connection. The connection's write half is shared
//! between the handler (for the rejection reply) and the viewer's
//! [`TcpFrameSink`], which the broadcast transport drives once the
//! viewer is admitted. The handler keeps reading acks until the viewer
//! leaves, the stream fails or the viewer is disconnected server-side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::FrameSink;
use crate::codec::WireCodec;
use crate::error::ShareError;
use crate::session::{SessionId, SessionManager, ViewerRef};
use crate::stream::types::Frame;
use crate::viewer::{DisconnectReason, ViewerId, ViewerPhase};
use crate::wire::{Closed, JoinReply, JoinStatus, Message, WireFrame};

type WireWriter = SplitSink<Framed<TcpStream, WireCodec>, Message>;
type WireReader = SplitStream<Framed<TcpStream, WireCodec>>;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// How long a fresh connection may take to present its code.
    pub join_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
        }
    }
}

// ── TcpFrameSink ─────────────────────────────────────────────────

/// [`FrameSink`] writing wire messages to a viewer's socket.
pub struct TcpFrameSink {
    writer: Arc<Mutex<WireWriter>>,
}

impl TcpFrameSink {
    fn new(writer: Arc<Mutex<WireWriter>>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    /// The accepting reply goes out before any frame.
    async fn open(&mut self, session: SessionId) -> Result<(), ShareError> {
        self.writer
            .lock()
            .await
            .send(Message::JoinReply(JoinReply {
                status: JoinStatus::Ok,
                session_id: Some(session.get()),
            }))
            .await
    }

    async fn send_frame(&mut self, session: SessionId, frame: &Frame) -> Result<(), ShareError> {
        self.writer
            .lock()
            .await
            .send(Message::Frame(WireFrame {
                session_id: session.get(),
                frame: frame.clone(),
            }))
            .await
    }

    async fn close(&mut self, reason: DisconnectReason) -> Result<(), ShareError> {
        let mut writer = self.writer.lock().await;
        if reason.is_server_initiated() {
            writer.send(Message::Closed(Closed { reason })).await?;
        }
        writer.close().await
    }
}

// ── Server ───────────────────────────────────────────────────────

/// Accept viewers until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    config: NetworkConfig,
    cancel: CancellationToken,
) -> Result<(), ShareError> {
    info!(addr = ?listener.local_addr().ok(), "accepting viewers");
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {e}");
        }
        let manager = Arc::clone(&manager);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_viewer(stream, peer, manager, &config).await {
                debug!(%peer, "viewer connection ended: {e}");
            }
        });
    }
    info!("listener stopped");
    Ok(())
}

/// Drive one viewer connection from join to disconnect.
pub async fn serve_viewer(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    config: &NetworkConfig,
) -> Result<(), ShareError> {
    let (writer, mut reader) = Framed::new(stream, WireCodec).split();
    let writer = Arc::new(Mutex::new(writer));

    let request = match tokio::time::timeout(config.join_timeout, reader.next()).await {
        Err(_) => return Err(ShareError::Timeout(config.join_timeout)),
        Ok(None) => return Ok(()),
        Ok(Some(Err(e))) => return Err(e),
        Ok(Some(Ok(Message::Join(request)))) => request,
        Ok(Some(Ok(other))) => {
            warn!(%peer, kind = ?other.kind(), "expected join");
            return Err(ShareError::ProtocolViolation("first message must be a join"));
        }
    };
    debug!(%peer, identity = %request.identity, "join requested");

    let viewer = ViewerRef::new(request.identity, TcpFrameSink::new(Arc::clone(&writer)));
    let admission = match manager.validate_and_join(&request.code, viewer).await {
        Ok(admission) => admission,
        Err(e) => {
            let mut writer = writer.lock().await;
            writer
                .send(Message::JoinReply(JoinReply {
                    status: e.join_status(),
                    session_id: None,
                }))
                .await?;
            let _ = writer.close().await;
            return Ok(());
        }
    };

    let (session, viewer) = (admission.session_id, admission.viewer_id);
    info!(%peer, %session, %viewer, "viewer connected");
    if let Some(reason) = read_acks(&mut reader, &manager, session, viewer, admission.phase).await {
        manager.disconnect_viewer(session, viewer, reason).await;
    }
    Ok(())
}

/// Returns the reason to disconnect with, or `None` when the viewer is
/// already gone.
async fn read_acks(
    reader: &mut WireReader,
    manager: &SessionManager,
    session: SessionId,
    viewer: ViewerId,
    mut phase: watch::Receiver<ViewerPhase>,
) -> Option<DisconnectReason> {
    loop {
        let gone = phase.borrow_and_update().is_disconnected();
        if gone {
            return None;
        }

        tokio::select! {
            changed = phase.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            msg = reader.next() => match msg {
                Some(Ok(Message::Ack(ack))) => {
                    if let Err(e) = manager.acknowledge(session, viewer, ack.last_acknowledged).await {
                        debug!(%viewer, "ack ignored: {e}");
                    }
                }
                Some(Ok(Message::Leave)) => return Some(DisconnectReason::ViewerLeft),
                Some(Ok(other)) => {
                    warn!(%viewer, kind = ?other.kind(), "unexpected message from viewer");
                    return Some(DisconnectReason::TransportError);
                }
                Some(Err(e)) => {
                    warn!(%viewer, "read failed: {e}");
                    return Some(DisconnectReason::TransportError);
                }
                None => {
                    debug!(%viewer, "connection closed without leave");
                    return Some(DisconnectReason::TransportError);
                }
            },
        }
    }
}
