//! # sharecast-core
//!
//! Screen-share streaming with invitation-code admission control.
//!
//! This crate contains:
//! - **Admission**: `InviteCode`, `InvitationCode`, `CodeStore`, `SessionManager`
//! - **Stream**: capture, keyframe/delta `FrameEncoder`, `FrameDecoder`, `StreamPipeline`
//! - **Broadcast**: `BroadcastTransport` with one bounded queue per viewer
//! - **Viewer**: `ViewerPhase` state machine and `ViewerConnection` snapshots
//! - **Wire**: `Message` types and the `WireCodec` envelope for framed TCP I/O
//! - **Network**: the TCP server (`serve`) and the `ViewerClient`
//! - **Error**: `ShareError`, a typed `thiserror`-based error hierarchy

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod error;
pub mod invite;
pub mod network;
pub mod session;
pub mod store;
pub mod stream;
pub mod viewer;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use broadcast::{BroadcastConfig, BroadcastTransport, ChannelSink, FrameSink, SinkEvent};
pub use client::{ClientConfig, ClientStats, ViewerClient};
pub use codec::WireCodec;
pub use error::ShareError;
pub use invite::{CodePolicy, CodeRecord, InvitationCode, InviteCode};
pub use network::{NetworkConfig, TcpFrameSink, serve, serve_viewer};
pub use session::{
    Admission, HostRef, SessionConfig, SessionId, SessionManager, SessionOptions, SessionState,
    SessionSummary, ViewerRef,
};
pub use store::{CodeStore, MemoryCodeStore};
pub use stream::{
    CaptureConfig, EncoderConfig, Frame, FrameDecoder, FrameEncoder, FrameKind, FrameSource,
    PatternSource, PipelineConfig, PixelFormat, RawFrame, StreamPipeline,
};
pub use viewer::{DisconnectReason, PhaseTracker, ViewerConnection, ViewerId, ViewerPhase};
pub use wire::{JoinStatus, Message};
