//! Envelope codec for framed TCP I/O via `tokio_util`.
//!
//! ## Envelope (13 bytes, little-endian)
//!
//! ```text
//! magic:    [u8; 4]  "SCS1"
//! kind:     u8       MessageKind
//! checksum: u32      first 4 bytes of blake3(body)
//! body_len: u32
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ShareError;
use crate::wire::{Message, MessageKind};

pub const MAGIC: [u8; 4] = *b"SCS1";
pub const ENVELOPE_SIZE: usize = 13;
/// Largest accepted body.
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Checksum of a message body.
pub fn body_checksum(body: &[u8]) -> u32 {
    let hash = blake3::hash(body);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Codec for [`Message`]s wrapped in the sharecast envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = ShareError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENVELOPE_SIZE {
            return Ok(None);
        }
        if src[0..4] != MAGIC {
            return Err(ShareError::InvalidMagic);
        }

        let kind = MessageKind::try_from(src[4])?;
        let checksum = u32::from_le_bytes([src[5], src[6], src[7], src[8]]);
        let body_len = u32::from_le_bytes([src[9], src[10], src[11], src[12]]) as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(ShareError::FrameTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        if src.len() < ENVELOPE_SIZE + body_len {
            src.reserve(ENVELOPE_SIZE + body_len - src.len());
            return Ok(None);
        }

        src.advance(ENVELOPE_SIZE);
        let body = src.split_to(body_len).freeze();
        if body_checksum(&body) != checksum {
            return Err(ShareError::ChecksumMismatch);
        }

        Message::decode_body(kind, body).map(Some)
    }
}

impl Encoder<Message> for WireCodec {
    type Error = ShareError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.encode_body(&mut body)?;
        if body.len() > MAX_BODY_SIZE {
            return Err(ShareError::FrameTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        dst.reserve(ENVELOPE_SIZE + body.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(item.kind() as u8);
        dst.put_u32_le(body_checksum(&body));
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Ack, JoinRequest};

    fn encoded(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        WireCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn partial_input_waits_for_more() {
        let full = encoded(Message::Join(JoinRequest {
            code: "AB12CD".into(),
            identity: "alice".into(),
        }));

        let mut codec = WireCodec;
        let mut buf = BytesMut::from(&full[..ENVELOPE_SIZE + 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[ENVELOPE_SIZE + 2..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Message::Join(j)) => assert_eq!(j.code, "AB12CD"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn two_messages_in_one_read() {
        let mut buf = encoded(Message::Ack(Ack {
            last_acknowledged: 7,
        }));
        buf.extend_from_slice(&encoded(Message::Leave));

        let mut codec = WireCodec;
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Ack(Ack {
                last_acknowledged: 7
            }))
        ));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Message::Leave)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic() {
        let mut buf = encoded(Message::Leave);
        buf[0] = b'X';
        assert!(matches!(
            WireCodec.decode(&mut buf),
            Err(ShareError::InvalidMagic)
        ));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut buf = encoded(Message::Ack(Ack {
            last_acknowledged: 1,
        }));
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            WireCodec.decode(&mut buf),
            Err(ShareError::ChecksumMismatch)
        ));
    }

    #[test]
    fn oversized_body_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(MessageKind::Frame as u8);
        buf.put_u32_le(0);
        buf.put_u32_le((MAX_BODY_SIZE + 1) as u32);
        assert!(matches!(
            WireCodec.decode(&mut buf),
            Err(ShareError::FrameTooLarge { .. })
        ));
    }
}
