//! Integration tests: join, stream and teardown over a real TCP
//! connection on localhost, plus fan-out isolation between viewers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sharecast_core::{
    BroadcastConfig, ChannelSink, CodePolicy, DisconnectReason, Frame, FrameKind, HostRef,
    InviteCode, NetworkConfig, PatternSource, PipelineConfig, SessionConfig, SessionId,
    SessionManager, SessionOptions, ShareError, SinkEvent, StreamPipeline, ViewerClient,
    ViewerRef, serve,
};
use sharecast_core::stream::CaptureConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

/// Start a server on an OS-assigned port.
async fn start_server(config: SessionConfig) -> (Arc<SessionManager>, SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = Arc::new(SessionManager::in_memory(config));
    let cancel = CancellationToken::new();
    tokio::spawn(serve(
        listener,
        Arc::clone(&manager),
        NetworkConfig::default(),
        cancel.clone(),
    ));
    (manager, addr, cancel)
}

async fn session_with_code(manager: &SessionManager, code: &str, max_uses: Option<u32>) -> SessionId {
    manager
        .create_session_with(
            HostRef::new("desk"),
            SessionOptions {
                code: Some(InviteCode::parse(code).unwrap()),
                policy: Some(CodePolicy {
                    max_uses,
                    ..CodePolicy::default()
                }),
            },
        )
        .await
        .unwrap()
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        capture: CaptureConfig { rate_hz: 30 },
        ..PipelineConfig::default()
    }
}

fn synthetic(seq: u64, keyframe_every: u64) -> Frame {
    let (kind, len) = if seq % keyframe_every == 0 {
        (FrameKind::Keyframe, 10_000)
    } else {
        (FrameKind::Delta { reference: seq - 1 }, 2_000)
    };
    Frame {
        sequence: seq,
        kind,
        captured_at: Instant::now(),
        payload: Bytes::from(vec![0xAB; len]),
    }
}

// ── End to end ───────────────────────────────────────────────────

#[tokio::test]
async fn test_join_stream_and_close() {
    let (manager, addr, cancel) = start_server(SessionConfig::default()).await;
    let id = session_with_code(&manager, "AB12CD", Some(2)).await;
    let pipeline = StreamPipeline::spawn(
        Arc::clone(&manager),
        id,
        PatternSource::new(160, 90),
        pipeline_config(),
    )
    .await
    .unwrap();

    let mut alice = ViewerClient::join(addr, "AB12CD", "alice").await.unwrap();
    let _bob = ViewerClient::join(addr, "ab12cd", "bob").await.unwrap();
    assert_eq!(alice.session_id(), id);

    // Third join: the code is used up.
    assert!(matches!(
        ViewerClient::join(addr, "AB12CD", "carol").await,
        Err(ShareError::CodeExhausted)
    ));

    // Alice starts at a keyframe and every frame applies cleanly.
    let mut last = None;
    for i in 0..5 {
        let frame = tokio::time::timeout(Duration::from_secs(5), alice.next_frame())
            .await
            .expect("timeout")
            .unwrap()
            .expect("stream ended early");
        if i == 0 {
            assert!(frame.is_keyframe());
        }
        if let Some(prev) = last {
            assert!(frame.sequence > prev);
        }
        last = Some(frame.sequence);
    }
    assert_eq!(alice.decoder().dimensions().map(|d| (d.0, d.1)), Some((160, 90)));
    assert_eq!(manager.list_sessions().await[0].viewers, 2);

    manager.close_session(id).await;
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while alice.next_frame().await.unwrap().is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "stream did not end after close");
    assert_eq!(alice.closed_reason(), Some(DisconnectReason::SessionClosed));
    assert!(pipeline.join().await.is_ok());

    assert!(matches!(
        ViewerClient::join(addr, "AB12CD", "dave").await,
        Err(ShareError::SessionClosed)
    ));
    cancel.cancel();
}

#[tokio::test]
async fn test_rejections_over_tcp() {
    let (manager, addr, cancel) = start_server(SessionConfig::default()).await;
    let id = session_with_code(&manager, "QWERTY", None).await;

    assert!(matches!(
        ViewerClient::join(addr, "NOPE99", "x").await,
        Err(ShareError::InvalidCode)
    ));

    manager.revoke_code(&InviteCode::parse("QWERTY").unwrap()).await.unwrap();
    assert!(matches!(
        ViewerClient::join(addr, "QWERTY", "x").await,
        Err(ShareError::InvalidCode)
    ));

    let expired = manager
        .issue_code(id, Some(CodePolicy::default().with_expiry(Duration::ZERO)))
        .await
        .unwrap();
    assert!(matches!(
        ViewerClient::join(addr, expired.as_str(), "x").await,
        Err(ShareError::ExpiredCode)
    ));
    cancel.cancel();
}

#[tokio::test]
async fn test_concurrent_joins_respect_use_limit() {
    let (manager, addr, cancel) = start_server(SessionConfig::default()).await;
    session_with_code(&manager, "RACE42", Some(3)).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            ViewerClient::join(addr, "RACE42", &format!("viewer{i}")).await
        }));
    }

    let mut admitted = Vec::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(client) => admitted.push(client),
            Err(ShareError::CodeExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted.len(), 3);
    assert_eq!(exhausted, 7);
    cancel.cancel();
}

#[tokio::test]
async fn test_leave_removes_viewer() {
    let (manager, addr, cancel) = start_server(SessionConfig::default()).await;
    let id = session_with_code(&manager, "LEAVE1", None).await;

    let client = ViewerClient::join(addr, "LEAVE1", "erin").await.unwrap();
    assert_eq!(manager.viewers(id).await.len(), 1);
    client.leave().await.unwrap();

    let gone = tokio::time::timeout(Duration::from_secs(5), async {
        while !manager.viewers(id).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "viewer still registered after leave");
    cancel.cancel();
}

// ── Fan-out isolation ────────────────────────────────────────────

#[tokio::test]
async fn test_slow_viewer_does_not_hold_back_fast_viewer() {
    let manager = SessionManager::in_memory(SessionConfig {
        broadcast: BroadcastConfig {
            stall_timeout: Duration::from_millis(200),
            ..BroadcastConfig::default()
        },
        ..SessionConfig::default()
    });
    let id = session_with_code(&manager, "ISO123", None).await;

    let (fast_sink, mut fast_rx) = ChannelSink::new(1024);
    // Never read past the first frame.
    let (slow_sink, _slow_rx) = ChannelSink::new(1);
    manager
        .validate_and_join("ISO123", ViewerRef::new("fast", fast_sink))
        .await
        .unwrap();
    let slow = manager
        .validate_and_join("ISO123", ViewerRef::new("slow", slow_sink))
        .await
        .unwrap();

    let transport = manager.transport(id).await.unwrap();
    for seq in 0..150 {
        transport.broadcast(synthetic(seq, 10)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // The fast viewer got every frame, in order.
    let mut received = Vec::new();
    while received.len() < 150 {
        match tokio::time::timeout(Duration::from_secs(2), fast_rx.recv()).await {
            Ok(Some(SinkEvent::Frame(f))) => received.push(f.sequence),
            Ok(Some(SinkEvent::Opened(_))) => {}
            other => panic!("fast viewer: unexpected {other:?}"),
        }
    }
    assert_eq!(received, (0..150).collect::<Vec<_>>());

    // The slow viewer was cut off for blocking, not the session.
    let mut phase = slow.phase.clone();
    tokio::time::timeout(Duration::from_secs(2), phase.wait_for(|p| p.is_disconnected()))
        .await
        .expect("slow viewer never disconnected")
        .unwrap();
    assert_eq!(
        phase.borrow().disconnect_reason(),
        Some(DisconnectReason::StallTimeout)
    );
    assert_eq!(manager.viewers(id).await.len(), 1);
}

#[tokio::test]
async fn test_no_orphan_deltas_under_pressure() {
    let manager = SessionManager::in_memory(SessionConfig {
        broadcast: BroadcastConfig {
            min_queue_bytes: 8_000,
            queue_keyframes: 1,
            ..BroadcastConfig::default()
        },
        ..SessionConfig::default()
    });
    let id = session_with_code(&manager, "CHAIN1", None).await;
    let (sink, mut rx) = ChannelSink::new(4096);
    manager
        .validate_and_join("CHAIN1", ViewerRef::new("v", sink))
        .await
        .unwrap();

    // Broadcast in bursts so the queue overflows between drains.
    let transport = manager.transport(id).await.unwrap();
    for seq in 0..300 {
        transport.broadcast(synthetic(seq, 25)).await;
        if seq % 20 == 19 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.close_session(id).await;

    let mut delivered = std::collections::HashSet::new();
    let mut last = None;
    while let Some(event) = rx.recv().await {
        if let SinkEvent::Frame(frame) = event {
            if let Some(prev) = last {
                assert!(frame.sequence > prev, "out of order");
            }
            if let Some(reference) = frame.reference() {
                assert!(delivered.contains(&reference), "orphan delta {}", frame.sequence);
            }
            delivered.insert(frame.sequence);
            last = Some(frame.sequence);
        }
    }
    assert!(delivered.contains(&0));
}
