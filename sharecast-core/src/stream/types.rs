//! Shared frame types for the capture → encode → broadcast pipeline.
//!
//! [`RawFrame`] is what a capture source produces; [`Frame`] is what
//! the encoder emits and the broadcast transport fans out.

use std::time::Instant;

use bytes::Bytes;

use crate::error::ShareError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            PixelFormat::Bgra8 => 1,
            PixelFormat::Rgba8 => 2,
            PixelFormat::Rgb8 => 3,
        }
    }
}

impl TryFrom<u8> for PixelFormat {
    type Error = ShareError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PixelFormat::Bgra8),
            2 => Ok(PixelFormat::Rgba8),
            3 => Ok(PixelFormat::Rgb8),
            _ => Err(ShareError::UnknownVariant {
                type_name: "PixelFormat",
                value: value as u64,
            }),
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed screen image obtained from a capture source.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may exceed `width * bytes_per_pixel` when the source pads
/// rows.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl RawFrame {
    /// A tightly packed frame filled with `fill`.
    pub fn filled(width: u32, height: u32, format: PixelFormat, fill: u8) -> Self {
        let stride = width * format.bytes_per_pixel() as u32;
        Self {
            width,
            height,
            stride,
            format,
            data: vec![fill; stride as usize * height as usize],
            timestamp: Instant::now(),
        }
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Bytes of visible pixels per row (no padding).
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Returns a row slice (including possible padding bytes).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.stride as usize]
    }

    /// Whether `data` is large enough for the declared geometry.
    pub fn is_consistent(&self) -> bool {
        self.stride as usize >= self.row_bytes() && self.data.len() >= self.byte_len()
    }

    /// Same width, height and pixel format.
    pub fn same_geometry(&self, other: &RawFrame) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// How a [`Frame`] relates to earlier frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Self-contained; decodable without prior state.
    Keyframe,
    /// Computed against the frame with sequence number `reference`.
    Delta { reference: u64 },
}

/// An encoded frame ready for fan-out.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Session-scoped, gap-free sequence number starting at 0.
    pub sequence: u64,
    pub kind: FrameKind,
    /// Capture timestamp of the source frame.
    pub captured_at: Instant,
    /// Codec payload (see [`crate::stream::encoder`]).
    pub payload: Bytes,
}

impl Frame {
    pub fn is_keyframe(&self) -> bool {
        matches!(self.kind, FrameKind::Keyframe)
    }

    /// Sequence number this frame depends on, if any.
    pub fn reference(&self) -> Option<u64> {
        match self.kind {
            FrameKind::Keyframe => None,
            FrameKind::Delta { reference } => Some(reference),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_discriminants() {
        for f in [PixelFormat::Bgra8, PixelFormat::Rgba8, PixelFormat::Rgb8] {
            assert_eq!(PixelFormat::try_from(f.to_u8()).unwrap(), f);
        }
        assert!(PixelFormat::try_from(9).is_err());
    }

    #[test]
    fn filled_frame_geometry() {
        let f = RawFrame::filled(10, 4, PixelFormat::Rgb8, 7);
        assert_eq!(f.stride, 30);
        assert_eq!(f.byte_len(), 120);
        assert!(f.is_consistent());
        assert_eq!(f.row(3).len(), 30);
    }

    #[test]
    fn delta_reference() {
        let frame = Frame {
            sequence: 5,
            kind: FrameKind::Delta { reference: 4 },
            captured_at: Instant::now(),
            payload: Bytes::from_static(b"x"),
        };
        assert_eq!(frame.reference(), Some(4));
        assert!(!frame.is_keyframe());
    }
}
