//! Screen stream production and consumption.
//!
//! - [`capture`]: periodic capture from a [`FrameSource`]
//! - [`encoder`]: keyframe/delta encoding with zstd
//! - [`decoder`]: viewer-side reconstruction
//! - [`pipeline`]: per-session capture → encode → broadcast tasks

pub mod bandwidth;
pub mod capture;
pub mod decoder;
pub mod delta;
pub mod encoder;
pub mod pipeline;
pub mod types;

pub use bandwidth::SendMeter;
pub use capture::{CaptureConfig, CaptureTrigger, FrameCapture, FrameSource, PatternSource};
pub use decoder::FrameDecoder;
pub use delta::DeltaDetector;
pub use encoder::{EncoderConfig, EncoderStats, FrameEncoder, KeyframeRequest};
pub use pipeline::{PipelineConfig, StreamPipeline};
pub use types::{Frame, FrameKind, PixelFormat, RawFrame};
