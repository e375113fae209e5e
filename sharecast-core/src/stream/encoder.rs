//! Keyframe/delta encoder with zstd compression.
//!
//! Turns [`RawFrame`]s into sequenced [`Frame`]s:
//!
//! - **Keyframe**: every visible row packed tightly → zstd.
//! - **Delta**: dirty tiles against the previous encoded frame → zstd.
//!
//! The first frame, every `keyframe_interval`-th frame, any geometry
//! change and any explicit resync request produce a keyframe. A delta
//! is only kept when it compresses below `delta_ratio` of the last
//! keyframe; otherwise the encoder falls back to a keyframe.
//!
//! ## Payload layout
//!
//! ```text
//! width:   u32  (4)
//! height:  u32  (4)
//! format:  u8   (1)
//! body:    zstd stream
//! ```
//!
//! A delta body starts with `block_count: u32`, followed by each
//! block's `x, y, width, height` (u32 LE) and its pixel rows.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::ShareError;
use crate::stream::delta::{Block, DeltaDetector};
use crate::stream::types::{Frame, FrameKind, PixelFormat, RawFrame};

/// Bytes preceding the zstd body in every payload.
pub const IMAGE_HEADER_SIZE: usize = 9;

// ── EncoderConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Emit a keyframe at least this often (in emitted frames).
    pub keyframe_interval: u64,
    /// A delta is accepted only below this fraction of a keyframe.
    pub delta_ratio: f64,
    /// Tile size for change detection.
    pub block_size: usize,
    /// zstd level; 1 favours speed.
    pub compression_level: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            keyframe_interval: 120,
            delta_ratio: 0.40,
            block_size: 64,
            compression_level: 1,
        }
    }
}

// ── KeyframeRequest ──────────────────────────────────────────────

/// Cloneable handle that forces the next emitted frame to be a
/// keyframe. Held by the broadcast transport for resync requests.
#[derive(Debug, Clone, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

// ── EncoderStats ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub keyframes: u64,
    pub deltas: u64,
    /// Deltas abandoned for a keyframe (too large or failed).
    pub fallbacks: u64,
    /// Captures skipped because nothing changed.
    pub unchanged: u64,
}

// ── FrameEncoder ─────────────────────────────────────────────────

pub struct FrameEncoder {
    config: EncoderConfig,
    detector: DeltaDetector,
    /// Last successfully encoded raw frame and its sequence number.
    reference: Option<(u64, RawFrame)>,
    next_sequence: u64,
    frames_since_keyframe: u64,
    last_keyframe_len: usize,
    keyframe_request: KeyframeRequest,
    stats: EncoderStats,
}

enum DeltaOutcome {
    Unchanged,
    Encoded { reference: u64, payload: Vec<u8> },
}

impl FrameEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self::with_keyframe_request(config, KeyframeRequest::default())
    }

    /// Encoder that honours resync requests made through `request`.
    pub fn with_keyframe_request(config: EncoderConfig, request: KeyframeRequest) -> Self {
        Self {
            detector: DeltaDetector::new(config.block_size),
            config,
            reference: None,
            next_sequence: 0,
            frames_since_keyframe: 0,
            last_keyframe_len: 0,
            keyframe_request: request,
            stats: EncoderStats::default(),
        }
    }

    /// Handle used by other tasks to request a resync keyframe.
    pub fn keyframe_request(&self) -> KeyframeRequest {
        self.keyframe_request.clone()
    }

    /// Force the next emitted frame to be a keyframe.
    pub fn request_keyframe(&self) {
        self.keyframe_request.request();
    }

    /// Sequence number the next emitted frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Encode one captured frame.
    ///
    /// Returns `Ok(None)` when the capture is identical to the
    /// reference and no frame needs to be sent. Sequence numbers are
    /// only consumed by emitted frames, so the output has no gaps.
    pub fn encode(&mut self, raw: &RawFrame) -> Result<Option<Frame>, ShareError> {
        let forced = self.keyframe_request.take();

        if !forced && !self.keyframe_due(raw) {
            match self.encode_delta(raw) {
                Ok(DeltaOutcome::Unchanged) => {
                    self.stats.unchanged += 1;
                    return Ok(None);
                }
                Ok(DeltaOutcome::Encoded { reference, payload }) => {
                    let limit = self.last_keyframe_len as f64 * self.config.delta_ratio;
                    if (payload.len() as f64) < limit {
                        return Ok(Some(self.emit(raw, FrameKind::Delta { reference }, payload)));
                    }
                    debug!(
                        delta = payload.len(),
                        keyframe = self.last_keyframe_len,
                        "delta over budget; sending keyframe"
                    );
                    self.stats.fallbacks += 1;
                }
                Err(e) => {
                    warn!("delta encode failed ({e}); falling back to keyframe");
                    self.stats.fallbacks += 1;
                }
            }
        }

        let payload = match self.encode_keyframe(raw) {
            Ok(p) => p,
            Err(first) => {
                warn!("keyframe encode failed ({first}); retrying once");
                self.encode_keyframe(raw)
                    .map_err(|e| ShareError::EncodeFailure(e.to_string()))?
            }
        };
        self.last_keyframe_len = payload.len();
        Ok(Some(self.emit(raw, FrameKind::Keyframe, payload)))
    }

    // ── Internal ─────────────────────────────────────────────────

    fn keyframe_due(&self, raw: &RawFrame) -> bool {
        match &self.reference {
            None => true,
            Some((_, prev)) => {
                !prev.same_geometry(raw)
                    || self.frames_since_keyframe + 1 >= self.config.keyframe_interval
            }
        }
    }

    fn emit(&mut self, raw: &RawFrame, kind: FrameKind, payload: Vec<u8>) -> Frame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        match kind {
            FrameKind::Keyframe => {
                self.frames_since_keyframe = 0;
                self.stats.keyframes += 1;
            }
            FrameKind::Delta { .. } => {
                self.frames_since_keyframe += 1;
                self.stats.deltas += 1;
            }
        }
        self.reference = Some((sequence, raw.clone()));

        Frame {
            sequence,
            kind,
            captured_at: raw.timestamp,
            payload: Bytes::from(payload),
        }
    }

    fn encode_keyframe(&self, raw: &RawFrame) -> Result<Vec<u8>, ShareError> {
        check_geometry(raw)?;
        let row_len = raw.row_bytes();
        let mut body = Vec::with_capacity(row_len * raw.height as usize);
        for y in 0..raw.height {
            body.extend_from_slice(&raw.row(y)[..row_len]);
        }
        self.finish_payload(raw, &body)
    }

    fn encode_delta(&self, raw: &RawFrame) -> Result<DeltaOutcome, ShareError> {
        check_geometry(raw)?;
        let (reference, prev) = match &self.reference {
            Some((seq, prev)) => (*seq, prev),
            None => return Err(ShareError::EncodeFailure("no reference frame".into())),
        };

        let changes = self.detector.detect(prev, raw);
        if changes.is_empty() {
            return Ok(DeltaOutcome::Unchanged);
        }

        let body = delta_body(&changes.blocks, raw);
        Ok(DeltaOutcome::Encoded {
            reference,
            payload: self.finish_payload(raw, &body)?,
        })
    }

    fn finish_payload(&self, raw: &RawFrame, body: &[u8]) -> Result<Vec<u8>, ShareError> {
        let compressed = zstd::encode_all(body, self.config.compression_level)
            .map_err(|e| ShareError::EncodeFailure(format!("zstd encode failed: {e}")))?;

        let mut out = BytesMut::with_capacity(IMAGE_HEADER_SIZE + compressed.len());
        out.put_u32_le(raw.width);
        out.put_u32_le(raw.height);
        out.put_u8(raw.format.to_u8());
        out.extend_from_slice(&compressed);
        Ok(out.to_vec())
    }
}

fn check_geometry(raw: &RawFrame) -> Result<(), ShareError> {
    if raw.width == 0 || raw.height == 0 || !raw.is_consistent() {
        return Err(ShareError::EncodeFailure(format!(
            "inconsistent frame geometry {}x{} stride {} len {}",
            raw.width,
            raw.height,
            raw.stride,
            raw.data.len()
        )));
    }
    Ok(())
}

/// `[block_count | (x, y, w, h, pixels)*]`, little-endian.
fn delta_body(blocks: &[Block], raw: &RawFrame) -> Vec<u8> {
    let bpp = raw.format.bytes_per_pixel();
    let mut out = Vec::new();
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());

    for block in blocks {
        out.extend_from_slice(&block.x.to_le_bytes());
        out.extend_from_slice(&block.y.to_le_bytes());
        out.extend_from_slice(&block.width.to_le_bytes());
        out.extend_from_slice(&block.height.to_le_bytes());

        let start_x = block.x as usize * bpp;
        let row_bytes = block.width as usize * bpp;
        for row in 0..block.height {
            let offset = (block.y + row) as usize * raw.stride as usize + start_x;
            out.extend_from_slice(&raw.data[offset..offset + row_bytes]);
        }
    }
    out
}

// ── ImageHeader ──────────────────────────────────────────────────

/// Geometry prefix of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ImageHeader {
    /// Split a payload into its header and zstd body.
    pub fn split(payload: &[u8]) -> Result<(Self, &[u8]), ShareError> {
        if payload.len() < IMAGE_HEADER_SIZE {
            return Err(ShareError::ProtocolViolation("payload shorter than image header"));
        }
        let width = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let height = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let format = PixelFormat::try_from(payload[8])?;
        Ok((
            Self {
                width,
                height,
                format,
            },
            &payload[IMAGE_HEADER_SIZE..],
        ))
    }
}

// ── Tests ────────────────────────────────────────────────────────
