//! Host service core logic.
//!
//! Opens one sharing session, streams the capture source into it and
//! accepts viewers until stopped. Stops on Ctrl-C (via the stop
//! handle) or when the pipeline dies, which also closes the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sharecast_core::{
    FrameSource, HostRef, PatternSource, SessionId, SessionManager, SessionOptions,
    StreamPipeline, serve,
};

use crate::config::HostConfig;

/// How often closed sessions are forgotten.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

// ── HostService ──────────────────────────────────────────────────

pub struct HostService {
    config: HostConfig,
    manager: Arc<SessionManager>,
    stop: CancellationToken,
}

impl HostService {
    pub fn new(config: HostConfig) -> Self {
        let manager = Arc::new(SessionManager::in_memory(config.to_session_config()));
        Self {
            config,
            manager,
            stop: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the service.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.manager)
    }

    /// Run with the synthetic test pattern as the capture source.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let source = PatternSource::new(self.config.capture.width, self.config.capture.height);
        self.run_with(source).await
    }

    pub async fn run_with<S: FrameSource>(
        &self,
        source: S,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.listen_addr()?).await?;
        info!("listening on {}", listener.local_addr()?);

        let session = self.open_session().await?;
        let accept_cancel = self.stop.child_token();
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&self.manager),
            self.config.to_network_config(),
            accept_cancel.clone(),
        ));

        let pipeline = StreamPipeline::spawn(
            Arc::clone(&self.manager),
            session,
            source,
            self.config.to_pipeline_config(),
        )
        .await?;

        self.report_until_stopped(session, &pipeline).await;

        self.manager.close_session(session).await;
        let result = pipeline.join().await;
        accept_cancel.cancel();
        let _ = server.await;
        self.manager.reap_closed().await;

        if let Err(e) = &result {
            error!("stream ended with error: {e}");
        }
        info!("host service stopped");
        result.map_err(Into::into)
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn open_session(&self) -> Result<SessionId, Box<dyn std::error::Error>> {
        let options = SessionOptions {
            code: self.config.fixed_code(),
            policy: Some(self.config.to_code_policy()),
        };
        let host = HostRef::new(self.config.session.host_name.clone());
        let session = self.manager.create_session_with(host, options).await?;

        for code in self.manager.session_codes(session).await {
            let uses = code
                .max_uses
                .map_or_else(|| "unlimited".to_string(), |n| n.to_string());
            println!("Invitation code: {}  (uses: {uses})", code.code);
        }
        Ok(session)
    }

    /// Log stream statistics once per second until the service is
    /// stopped or the pipeline ends.
    async fn report_until_stopped(&self, session: SessionId, pipeline: &StreamPipeline) {
        let Some(transport) = self.manager.transport(session).await else {
            return;
        };
        let mut stats = tokio::time::interval(Duration::from_secs(1));
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        let mut last_frames = transport.frames_broadcast();

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    info!("stop requested");
                    return;
                }
                _ = stats.tick() => {
                    if pipeline.is_finished() {
                        return;
                    }
                    let frames = transport.frames_broadcast();
                    let encoder = pipeline.stats();
                    let viewers = transport.viewer_count().await;
                    let stalled = transport.stalled_count().await;
                    info!(
                        fps = frames - last_frames,
                        viewers,
                        stalled,
                        keyframes = encoder.keyframes,
                        deltas = encoder.deltas,
                        "streaming"
                    );
                    last_frames = frames;
                }
                _ = reap.tick() => {
                    let reaped = self.manager.reap_closed().await;
                    if reaped > 0 {
                        info!(reaped, "closed sessions reaped");
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sharecast_core::{ShareError, ViewerClient};

    fn local_config() -> HostConfig {
        let mut cfg = HostConfig::default();
        cfg.network.listen = "127.0.0.1:0".into();
        cfg.session.code = "HOST01".into();
        cfg.capture.width = 64;
        cfg.capture.height = 48;
        cfg
    }

    #[tokio::test]
    async fn stop_handle_ends_run() {
        let svc = HostService::new(local_config());
        let stop = svc.stop_handle();
        let manager = svc.manager();
        let run = tokio::spawn(async move { svc.run().await.map_err(|e| e.to_string()) });

        // Wait for the session to come up.
        let up = tokio::time::timeout(Duration::from_secs(5), async {
            while manager.list_sessions().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(up.is_ok());

        stop.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("service did not stop")
            .unwrap();
        assert!(result.is_ok());
        // Closed and reaped on the way out.
        assert!(manager.list_sessions().await.is_empty());
    }

    struct Broken;

    impl FrameSource for Broken {
        fn capture(&mut self) -> Result<Option<sharecast_core::RawFrame>, ShareError> {
            Err(ShareError::CaptureFailure("no display".into()))
        }
    }

    #[tokio::test]
    async fn capture_failure_stops_service() {
        let svc = HostService::new(local_config());
        let result = tokio::time::timeout(Duration::from_secs(5), svc.run_with(Broken))
            .await
            .expect("service did not stop");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn viewer_can_join_running_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = local_config();
        cfg.network.listen = addr.to_string();
        let svc = HostService::new(cfg);
        let stop = svc.stop_handle();
        let run = tokio::spawn(async move { svc.run().await.map_err(|e| e.to_string()) });

        let mut client = None;
        for _ in 0..50 {
            match ViewerClient::join(addr, "HOST01", "tester").await {
                Ok(c) => {
                    client = Some(c);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut client = client.expect("could not join host");
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(frame.is_keyframe());

        stop.cancel();
        let _ = run.await;
    }
}
