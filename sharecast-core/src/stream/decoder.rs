//! Viewer-side frame decoder.
//!
//! Rebuilds the host raster from a keyframe followed by deltas. The
//! decoder enforces the reference chain: a delta is only applied on
//! top of the exact frame it was computed against.

use std::io::Read;

use crate::error::ShareError;
use crate::stream::encoder::ImageHeader;
use crate::stream::types::{Frame, FrameKind, PixelFormat};

/// Largest accepted width or height.
pub const MAX_DIMENSION: u32 = 16_384;

/// Bytes of one block header in a delta body.
const BLOCK_HEADER_SIZE: usize = 16;

// ── DecodedBlock ─────────────────────────────────────────────────

/// A single dirty block extracted from a delta body.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Tightly packed rows: `width * height * bpp` bytes.
    pub data: Vec<u8>,
}

// ── FrameDecoder ─────────────────────────────────────────────────

/// Stateful decoder holding the latest reconstructed image.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Tightly packed pixel rows of the current image.
    frame_buffer: Vec<u8>,
    header: Option<ImageHeader>,
    /// Sequence number of the last applied frame.
    last_sequence: Option<u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last applied frame.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Width, height and pixel format of the current image.
    pub fn dimensions(&self) -> Option<(u32, u32, PixelFormat)> {
        self.header.map(|h| (h.width, h.height, h.format))
    }

    /// Current image (empty before the first keyframe).
    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    /// Apply a frame and return the updated image.
    pub fn apply(&mut self, frame: &Frame) -> Result<&[u8], ShareError> {
        let (header, compressed) = ImageHeader::split(&frame.payload)?;
        if header.width > MAX_DIMENSION || header.height > MAX_DIMENSION {
            return Err(ShareError::ProtocolViolation("frame dimensions too large"));
        }
        let body = decompress(compressed, body_limit(header, frame.kind))?;

        match frame.kind {
            FrameKind::Keyframe => self.apply_keyframe(header, &body)?,
            FrameKind::Delta { reference } => {
                if self.last_sequence != Some(reference) {
                    return Err(ShareError::ProtocolViolation(
                        "delta does not reference the last applied frame",
                    ));
                }
                if self.header != Some(header) {
                    return Err(ShareError::ProtocolViolation("delta geometry mismatch"));
                }
                self.apply_delta(header, &body)?;
            }
        }

        self.last_sequence = Some(frame.sequence);
        Ok(&self.frame_buffer)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn apply_keyframe(&mut self, header: ImageHeader, body: &[u8]) -> Result<(), ShareError> {
        if body.len() != raster_size(header) {
            return Err(ShareError::ProtocolViolation("keyframe size does not match geometry"));
        }
        self.frame_buffer.clear();
        self.frame_buffer.extend_from_slice(body);
        self.header = Some(header);
        Ok(())
    }

    fn apply_delta(&mut self, header: ImageHeader, body: &[u8]) -> Result<(), ShareError> {
        let bpp = header.format.bytes_per_pixel();
        let row_stride = header.width as usize * bpp;

        for block in Self::extract_blocks(body, bpp)? {
            let right = block.x.checked_add(block.width);
            let bottom = block.y.checked_add(block.height);
            if right.is_none_or(|r| r > header.width) || bottom.is_none_or(|b| b > header.height) {
                return Err(ShareError::ProtocolViolation("delta block out of bounds"));
            }
            let block_row = block.width as usize * bpp;
            for row in 0..block.height as usize {
                let dst = (block.y as usize + row) * row_stride + block.x as usize * bpp;
                let src = row * block_row;
                let target = self
                    .frame_buffer
                    .get_mut(dst..dst + block_row)
                    .ok_or(ShareError::ProtocolViolation("delta block out of bounds"))?;
                let pixels = block
                    .data
                    .get(src..src + block_row)
                    .ok_or(ShareError::ProtocolViolation("delta body truncated"))?;
                target.copy_from_slice(pixels);
            }
        }
        Ok(())
    }

    /// Parse a decompressed delta body into individual blocks.
    pub fn extract_blocks(data: &[u8], bpp: usize) -> Result<Vec<DecodedBlock>, ShareError> {
        let mut cursor = Cursor::new(data);
        let count = cursor.u32()? as usize;
        let mut blocks = Vec::with_capacity(count.min(4096));

        for _ in 0..count {
            let x = cursor.u32()?;
            let y = cursor.u32()?;
            let width = cursor.u32()?;
            let height = cursor.u32()?;
            let len = (width as usize)
                .checked_mul(height as usize)
                .and_then(|n| n.checked_mul(bpp))
                .ok_or(ShareError::ProtocolViolation("delta block too large"))?;
            blocks.push(DecodedBlock {
                x,
                y,
                width,
                height,
                data: cursor.take(len)?.to_vec(),
            });
        }

        Ok(blocks)
    }
}

fn raster_size(header: ImageHeader) -> usize {
    header.width as usize * header.height as usize * header.format.bytes_per_pixel()
}

/// Most bytes a well-formed body of this geometry can decompress to.
/// A delta carries at most one header per pixel on top of the pixels.
fn body_limit(header: ImageHeader, kind: FrameKind) -> usize {
    let raster = raster_size(header);
    match kind {
        FrameKind::Keyframe => raster,
        FrameKind::Delta { .. } => {
            let pixels = header.width as usize * header.height as usize;
            raster + 4 + pixels * BLOCK_HEADER_SIZE
        }
    }
}

/// Decompress a zstd body, refusing output beyond `limit` bytes.
fn decompress(compressed: &[u8], limit: usize) -> Result<Vec<u8>, ShareError> {
    let decoder = zstd::stream::read::Decoder::new(compressed)
        .map_err(|e| ShareError::Encoding(format!("zstd decode failed: {e}")))?;
    let mut body = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| ShareError::Encoding(format!("zstd decode failed: {e}")))?;
    if body.len() > limit {
        return Err(ShareError::ProtocolViolation("decompressed body exceeds frame geometry"));
    }
    Ok(body)
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ShareError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(ShareError::ProtocolViolation("delta body truncated"))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, ShareError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ── Tests ────────────────────────────────────────────────────────
