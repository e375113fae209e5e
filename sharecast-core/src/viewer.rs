//! Per-viewer connection state machine.
//!
//! Models the lifecycle of one viewer attachment, with validated
//! transitions that return `Result` instead of panicking.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ShareError;
use crate::wire::JoinStatus;

// ── ViewerId ─────────────────────────────────────────────────────

/// Identifier of a viewer connection, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

impl ViewerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

// ── DisconnectReason ─────────────────────────────────────────────

/// Why a viewer reached `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The viewer left on its own.
    ViewerLeft,
    /// Writing to or reading from the viewer failed.
    TransportError,
    /// The owning session was closed.
    SessionClosed,
    /// The viewer stayed stalled past the resync timeout.
    StallTimeout,
    /// Admission was refused.
    Rejected(JoinStatus),
}

impl DisconnectReason {
    /// Whether the server ended the connection (the viewer is told why).
    pub fn is_server_initiated(self) -> bool {
        matches!(self, Self::SessionClosed | Self::StallTimeout)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ViewerLeft => write!(f, "viewer left"),
            Self::TransportError => write!(f, "transport error"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::StallTimeout => write!(f, "stall timeout"),
            Self::Rejected(status) => write!(f, "rejected: {status:?}"),
        }
    }
}

// ── ViewerPhase ──────────────────────────────────────────────────

/// The current phase of a viewer connection.
///
/// ```text
///  Connecting ──► Authenticating ──► Streaming ◄──► Streaming(stalled)
///       │               │                │                 │
///       └───────────────┴───────► Disconnected ◄───────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ViewerPhase {
    /// Transport is up; no code presented yet.
    #[default]
    Connecting,

    /// A code was submitted and is being validated.
    Authenticating,

    /// Frames are being delivered.
    Streaming {
        since: Instant,
        /// Delivery abandoned in favour of a forced resync.
        stalled: bool,
    },

    /// Terminal.
    Disconnected { reason: DisconnectReason },
}

impl fmt::Display for ViewerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Streaming { stalled: false, .. } => write!(f, "Streaming"),
            Self::Streaming { stalled: true, .. } => write!(f, "Stalled"),
            Self::Disconnected { reason } => write!(f, "Disconnected ({reason})"),
        }
    }
}

impl ViewerPhase {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Streaming { stalled: true, .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::Disconnected { reason } => Some(*reason),
            _ => None,
        }
    }

    /// How long the viewer has been streaming.
    pub fn streaming_duration(&self) -> Option<Duration> {
        match self {
            Self::Streaming { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn submit_code(&mut self) -> Result<(), ShareError> {
        match self {
            Self::Connecting => {
                *self = Self::Authenticating;
                Ok(())
            }
            _ => Err(ShareError::ProtocolViolation(
                "cannot submit code: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Authenticating`.
    pub fn admit(&mut self) -> Result<(), ShareError> {
        match self {
            Self::Authenticating => {
                *self = Self::Streaming {
                    since: Instant::now(),
                    stalled: false,
                };
                Ok(())
            }
            _ => Err(ShareError::ProtocolViolation(
                "cannot admit: not in Authenticating state",
            )),
        }
    }

    /// Valid from: `Authenticating`.
    pub fn reject(&mut self, status: JoinStatus) -> Result<(), ShareError> {
        match self {
            Self::Authenticating => {
                *self = Self::Disconnected {
                    reason: DisconnectReason::Rejected(status),
                };
                Ok(())
            }
            _ => Err(ShareError::ProtocolViolation(
                "cannot reject: not in Authenticating state",
            )),
        }
    }

    /// Valid from: `Streaming` (not yet stalled).
    pub fn stall(&mut self) -> Result<(), ShareError> {
        match self {
            Self::Streaming { stalled, .. } if !*stalled => {
                *stalled = true;
                Ok(())
            }
            _ => Err(ShareError::ProtocolViolation(
                "cannot stall: not in Streaming state",
            )),
        }
    }

    /// Valid from: `Streaming` (stalled).
    pub fn resume(&mut self) -> Result<(), ShareError> {
        match self {
            Self::Streaming { stalled, .. } if *stalled => {
                *stalled = false;
                Ok(())
            }
            _ => Err(ShareError::ProtocolViolation(
                "cannot resume: viewer is not stalled",
            )),
        }
    }

    /// Valid from any non-terminal phase.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> Result<(), ShareError> {
        match self {
            Self::Disconnected { .. } => Err(ShareError::ProtocolViolation(
                "cannot disconnect: already Disconnected",
            )),
            _ => {
                *self = Self::Disconnected { reason };
                Ok(())
            }
        }
    }
}

// ── PhaseTracker ─────────────────────────────────────────────────

/// Shared, observable [`ViewerPhase`].
///
/// The network handler drives the early transitions; the broadcast
/// transport drives the rest. Observers get every change through
/// [`subscribe`](Self::subscribe).
#[derive(Debug, Clone)]
pub struct PhaseTracker(Arc<watch::Sender<ViewerPhase>>);

impl PhaseTracker {
    pub fn new() -> Self {
        Self(Arc::new(watch::Sender::new(ViewerPhase::Connecting)))
    }

    pub fn current(&self) -> ViewerPhase {
        self.0.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewerPhase> {
        self.0.subscribe()
    }

    /// Apply a transition; observers are only woken when it succeeds.
    pub fn apply(
        &self,
        transition: impl FnOnce(&mut ViewerPhase) -> Result<(), ShareError>,
    ) -> Result<(), ShareError> {
        let mut outcome = Ok(());
        self.0.send_if_modified(|phase| {
            outcome = transition(phase);
            outcome.is_ok()
        });
        outcome
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ── ViewerConnection ─────────────────────────────────────────────

/// Point-in-time view of one streaming viewer.
#[derive(Debug, Clone)]
pub struct ViewerConnection {
    pub id: ViewerId,
    pub identity: String,
    pub phase: ViewerPhase,
    /// Highest sequence number the viewer acknowledged.
    pub last_acked: Option<u64>,
    /// Frames waiting in the outbound queue.
    pub queue_depth: usize,
    pub queued_bytes: usize,
    /// Smoothed transport write latency.
    pub send_latency: Duration,
    pub bytes_per_sec: u64,
    /// Frames withheld from this viewer by the queue policy.
    pub dropped_frames: u64,
    pub joined_at: Instant,
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_connecting() {
        assert_eq!(ViewerPhase::default(), ViewerPhase::Connecting);
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = ViewerPhase::default();
        phase.submit_code().unwrap();
        assert_eq!(phase, ViewerPhase::Authenticating);
        phase.admit().unwrap();
        assert!(phase.is_streaming());
        assert!(phase.streaming_duration().is_some());
        phase.stall().unwrap();
        assert!(phase.is_stalled());
        assert_eq!(phase.to_string(), "Stalled");
        phase.resume().unwrap();
        assert!(!phase.is_stalled());
        phase.disconnect(DisconnectReason::ViewerLeft).unwrap();
        assert_eq!(phase.disconnect_reason(), Some(DisconnectReason::ViewerLeft));
    }

    #[test]
    fn rejection_is_terminal() {
        let mut phase = ViewerPhase::Authenticating;
        phase.reject(JoinStatus::CodeExhausted).unwrap();
        assert_eq!(
            phase.disconnect_reason(),
            Some(DisconnectReason::Rejected(JoinStatus::CodeExhausted))
        );
        assert!(phase.admit().is_err());
        assert!(phase.disconnect(DisconnectReason::SessionClosed).is_err());
    }

    #[test]
    fn invalid_transitions() {
        let mut phase = ViewerPhase::Connecting;
        assert!(phase.admit().is_err());
        assert!(phase.stall().is_err());
        phase.submit_code().unwrap();
        assert!(phase.submit_code().is_err());
        assert!(phase.resume().is_err());
        phase.admit().unwrap();
        assert!(phase.resume().is_err());
        phase.stall().unwrap();
        assert!(phase.stall().is_err());
    }

    #[test]
    fn connecting_can_disconnect() {
        let mut phase = ViewerPhase::Connecting;
        phase.disconnect(DisconnectReason::TransportError).unwrap();
        assert!(phase.is_disconnected());
    }

    #[tokio::test]
    async fn tracker_notifies_on_success_only() {
        let tracker = PhaseTracker::new();
        let mut rx = tracker.subscribe();

        assert!(tracker.apply(ViewerPhase::admit).is_err());
        assert!(!rx.has_changed().unwrap());

        tracker.apply(ViewerPhase::submit_code).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ViewerPhase::Authenticating);

        tracker
            .apply(|p| p.disconnect(DisconnectReason::SessionClosed))
            .unwrap();
        assert!(tracker.current().is_disconnected());
    }

    #[test]
    fn server_initiated_reasons() {
        assert!(DisconnectReason::SessionClosed.is_server_initiated());
        assert!(DisconnectReason::StallTimeout.is_server_initiated());
        assert!(!DisconnectReason::ViewerLeft.is_server_initiated());
    }
}
