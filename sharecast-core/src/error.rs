//! Domain-specific error types for sharecast.
//!
//! All fallible operations return `Result<T, ShareError>`.
//! Admission failures are surfaced to the caller as-is; per-viewer
//! failures are recovered locally and never escalate to the session.

use std::time::Duration;
use thiserror::Error;

use crate::wire::JoinStatus;

/// The canonical error type for sharecast.
#[derive(Debug, Error)]
pub enum ShareError {
    // ── Admission Errors ─────────────────────────────────────────
    /// The code does not exist or is not a well-formed invitation code.
    #[error("invalid invitation code")]
    InvalidCode,

    /// The code is past its expiry timestamp.
    #[error("invitation code expired")]
    ExpiredCode,

    /// The code has no remaining uses.
    #[error("invitation code exhausted")]
    CodeExhausted,

    /// The owning session is not accepting viewers.
    #[error("session closed")]
    SessionClosed,

    /// A per-host session limit or per-session viewer limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    // ── Host Pipeline Errors ─────────────────────────────────────
    /// The frame source could not produce a frame. Fatal to the session.
    #[error("capture failure: {0}")]
    CaptureFailure(String),

    /// A frame could not be encoded even as a keyframe.
    #[error("encode failure: {0}")]
    EncodeFailure(String),

    // ── Per-Viewer Errors ────────────────────────────────────────
    /// Writing to a viewer's transport failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A viewer stayed stalled past the forced-resync timeout.
    #[error("viewer stalled for {0:?}")]
    Stalled(Duration),

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the sharecast magic.
    #[error("invalid magic bytes: expected SCS1")]
    InvalidMagic,

    /// The envelope body failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Infrastructure Errors ────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The external code store rejected an operation.
    #[error("code store error: {0}")]
    Store(String),
}

impl ShareError {
    /// The join-protocol status reported to a viewer for this error.
    ///
    /// Errors outside the admission taxonomy are reported as
    /// `ResourceExhausted`; the viewer cannot act on them anyway.
    pub fn join_status(&self) -> JoinStatus {
        match self {
            ShareError::InvalidCode => JoinStatus::InvalidCode,
            ShareError::ExpiredCode => JoinStatus::ExpiredCode,
            ShareError::CodeExhausted => JoinStatus::CodeExhausted,
            ShareError::SessionClosed => JoinStatus::SessionClosed,
            _ => JoinStatus::ResourceExhausted,
        }
    }

    /// Whether this error is an admission failure (never retried).
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            ShareError::InvalidCode
                | ShareError::ExpiredCode
                | ShareError::CodeExhausted
                | ShareError::SessionClosed
                | ShareError::ResourceExhausted(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ShareError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ShareError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for ShareError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ShareError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = ShareError::FrameTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
        assert!(ShareError::ExpiredCode.to_string().contains("expired"));
    }

    #[test]
    fn admission_errors_map_to_join_status() {
        assert_eq!(ShareError::InvalidCode.join_status(), JoinStatus::InvalidCode);
        assert_eq!(ShareError::ExpiredCode.join_status(), JoinStatus::ExpiredCode);
        assert_eq!(
            ShareError::CodeExhausted.join_status(),
            JoinStatus::CodeExhausted
        );
        assert_eq!(
            ShareError::SessionClosed.join_status(),
            JoinStatus::SessionClosed
        );
        assert_eq!(
            ShareError::ResourceExhausted("viewers").join_status(),
            JoinStatus::ResourceExhausted
        );
        assert!(ShareError::CodeExhausted.is_admission());
        assert!(!ShareError::TransportError("reset".into()).is_admission());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: ShareError = io_err.into();
        assert!(matches!(e, ShareError::Io(_)));
    }
}
