//! Receive loop with periodic statistics.

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sharecast_core::{DisconnectReason, ShareError, ViewerClient};

/// Totals for one viewing run.
#[derive(Debug, Clone)]
pub struct WatchSummary {
    pub frames: u64,
    pub keyframes: u64,
    pub skipped: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Set when the host ended the stream.
    pub closed: Option<DisconnectReason>,
}

/// Receive frames until the stream ends, `stop` fires or `max_frames`
/// have been applied. Logs frame rate and throughput once per second.
pub async fn watch(
    client: &mut ViewerClient,
    max_frames: Option<u64>,
    stop: CancellationToken,
) -> Result<WatchSummary, ShareError> {
    let started = Instant::now();
    let mut report = tokio::time::interval(Duration::from_secs(1));
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = client.stats();

    loop {
        if max_frames.is_some_and(|max| client.stats().frames >= max) {
            break;
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = report.tick() => {
                let now = client.stats();
                info!(
                    fps = now.frames - last.frames,
                    kib_per_sec = (now.bytes - last.bytes) / 1024,
                    skipped = now.skipped,
                    size = ?client.decoder().dimensions().map(|(w, h, _)| (w, h)),
                    "receiving"
                );
                last = now;
            }
            frame = client.next_frame() => {
                if frame?.is_none() {
                    break;
                }
            }
        }
    }

    let stats = client.stats();
    Ok(WatchSummary {
        frames: stats.frames,
        keyframes: stats.keyframes,
        skipped: stats.skipped,
        bytes: stats.bytes,
        elapsed: started.elapsed(),
        closed: client.closed_reason(),
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sharecast_core::stream::CaptureConfig;
    use sharecast_core::{
        HostRef, InviteCode, NetworkConfig, PatternSource, PipelineConfig, SessionConfig,
        SessionManager, SessionOptions, StreamPipeline, serve,
    };
    use tokio::net::TcpListener;

    async fn streaming_host(code: &str) -> (Arc<SessionManager>, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let manager = Arc::new(SessionManager::in_memory(SessionConfig::default()));
        let id = manager
            .create_session_with(
                HostRef::new("test"),
                SessionOptions {
                    code: Some(InviteCode::parse(code).unwrap()),
                    policy: None,
                },
            )
            .await
            .unwrap();
        tokio::spawn(serve(
            listener,
            Arc::clone(&manager),
            NetworkConfig::default(),
            CancellationToken::new(),
        ));
        let config = PipelineConfig {
            capture: CaptureConfig { rate_hz: 60 },
            ..PipelineConfig::default()
        };
        StreamPipeline::spawn(Arc::clone(&manager), id, PatternSource::new(96, 64), config)
            .await
            .unwrap();
        (manager, addr)
    }

    #[tokio::test]
    async fn stops_after_frame_limit() {
        let (_manager, addr) = streaming_host("WATCH1").await;
        let mut client = ViewerClient::join(addr, "WATCH1", "t").await.unwrap();
        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            watch(&mut client, Some(5), CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.frames, 5);
        assert!(summary.keyframes >= 1);
        assert!(summary.closed.is_none());
    }

    #[tokio::test]
    async fn ends_when_host_closes() {
        let (manager, addr) = streaming_host("WATCH2").await;
        let mut client = ViewerClient::join(addr, "WATCH2", "t").await.unwrap();
        let session = client.session_id();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            manager.close_session(session).await;
        });
        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            watch(&mut client, None, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.closed, Some(DisconnectReason::SessionClosed));
    }
}
