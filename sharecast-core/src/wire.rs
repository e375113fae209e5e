//! Messages exchanged between host and viewers.
//!
//! Control messages are `serde` structs serialised with `bincode`.
//! Frame messages carry a fixed little-endian header followed by the
//! encoded payload:
//!
//! ```text
//! session_id:  u64  (8)
//! sequence:    u64  (8)
//! flag:        u8   (1)   1 = KEYFRAME, 2 = DELTA
//! reference:   u64  (8)   DELTA only
//! payload_len: u32  (4)
//! payload:     [u8]
//! ```

use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ShareError;
use crate::stream::types::{Frame, FrameKind};
use crate::viewer::DisconnectReason;

// ── JoinStatus ───────────────────────────────────────────────────

/// Outcome of a join request as reported to the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinStatus {
    Ok,
    InvalidCode,
    ExpiredCode,
    CodeExhausted,
    SessionClosed,
    ResourceExhausted,
}

impl JoinStatus {
    pub fn is_ok(self) -> bool {
        self == JoinStatus::Ok
    }

    /// The admission error a viewer surfaces for this status.
    pub fn into_result(self) -> Result<(), ShareError> {
        match self {
            JoinStatus::Ok => Ok(()),
            JoinStatus::InvalidCode => Err(ShareError::InvalidCode),
            JoinStatus::ExpiredCode => Err(ShareError::ExpiredCode),
            JoinStatus::CodeExhausted => Err(ShareError::CodeExhausted),
            JoinStatus::SessionClosed => Err(ShareError::SessionClosed),
            JoinStatus::ResourceExhausted => {
                Err(ShareError::ResourceExhausted("refused by host"))
            }
        }
    }
}

// ── MessageKind ──────────────────────────────────────────────────

/// Envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Join = 1,
    JoinReply = 2,
    Ack = 3,
    Frame = 4,
    Leave = 5,
    Closed = 6,
}

impl TryFrom<u8> for MessageKind {
    type Error = ShareError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Join),
            2 => Ok(Self::JoinReply),
            3 => Ok(Self::Ack),
            4 => Ok(Self::Frame),
            5 => Ok(Self::Leave),
            6 => Ok(Self::Closed),
            _ => Err(ShareError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

// ── Control payloads ─────────────────────────────────────────────

/// Viewer → host: present an invitation code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub code: String,
    pub identity: String,
}

/// Host → viewer: admission result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
    pub status: JoinStatus,
    pub session_id: Option<u64>,
}

/// Viewer → host: low-water mark of received frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub last_acknowledged: u64,
}

/// Host → viewer: the stream ended for this viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closed {
    pub reason: DisconnectReason,
}

// ── FrameHeader ──────────────────────────────────────────────────

const FLAG_KEYFRAME: u8 = 1;
const FLAG_DELTA: u8 = 2;

/// Fixed header preceding every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub session_id: u64,
    pub sequence: u64,
    pub kind: FrameKind,
    pub payload_len: u32,
}

impl FrameHeader {
    pub const KEYFRAME_SIZE: usize = 21;
    pub const DELTA_SIZE: usize = 29;

    pub fn encoded_len(&self) -> usize {
        match self.kind {
            FrameKind::Keyframe => Self::KEYFRAME_SIZE,
            FrameKind::Delta { .. } => Self::DELTA_SIZE,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64_le(self.session_id);
        dst.put_u64_le(self.sequence);
        match self.kind {
            FrameKind::Keyframe => dst.put_u8(FLAG_KEYFRAME),
            FrameKind::Delta { reference } => {
                dst.put_u8(FLAG_DELTA);
                dst.put_u64_le(reference);
            }
        }
        dst.put_u32_le(self.payload_len);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self, ShareError> {
        if src.remaining() < Self::KEYFRAME_SIZE {
            return Err(ShareError::ProtocolViolation("frame header truncated"));
        }
        let session_id = src.get_u64_le();
        let sequence = src.get_u64_le();
        let kind = match src.get_u8() {
            FLAG_KEYFRAME => FrameKind::Keyframe,
            FLAG_DELTA => {
                if src.remaining() < Self::DELTA_SIZE - 17 {
                    return Err(ShareError::ProtocolViolation("frame header truncated"));
                }
                FrameKind::Delta {
                    reference: src.get_u64_le(),
                }
            }
            other => {
                return Err(ShareError::UnknownVariant {
                    type_name: "FrameFlag",
                    value: other as u64,
                });
            }
        };
        if src.remaining() < 4 {
            return Err(ShareError::ProtocolViolation("frame header truncated"));
        }
        let payload_len = src.get_u32_le();
        Ok(Self {
            session_id,
            sequence,
            kind,
            payload_len,
        })
    }
}

// ── Message ──────────────────────────────────────────────────────

/// An encoded frame addressed to a viewer of `session_id`.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub session_id: u64,
    pub frame: Frame,
}

#[derive(Debug, Clone)]
pub enum Message {
    Join(JoinRequest),
    JoinReply(JoinReply),
    Ack(Ack),
    Frame(WireFrame),
    Leave,
    Closed(Closed),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join(_) => MessageKind::Join,
            Message::JoinReply(_) => MessageKind::JoinReply,
            Message::Ack(_) => MessageKind::Ack,
            Message::Frame(_) => MessageKind::Frame,
            Message::Leave => MessageKind::Leave,
            Message::Closed(_) => MessageKind::Closed,
        }
    }

    /// Append the message body (no envelope) to `dst`.
    pub fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ShareError> {
        match self {
            Message::Join(m) => put_bincode(dst, m),
            Message::JoinReply(m) => put_bincode(dst, m),
            Message::Ack(m) => put_bincode(dst, m),
            Message::Closed(m) => put_bincode(dst, m),
            Message::Leave => Ok(()),
            Message::Frame(WireFrame { session_id, frame }) => {
                let payload_len = u32::try_from(frame.payload.len()).map_err(|_| {
                    ShareError::FrameTooLarge {
                        size: frame.payload.len(),
                        max: u32::MAX as usize,
                    }
                })?;
                let header = FrameHeader {
                    session_id: *session_id,
                    sequence: frame.sequence,
                    kind: frame.kind,
                    payload_len,
                };
                dst.reserve(header.encoded_len() + frame.payload.len());
                header.encode(dst);
                dst.extend_from_slice(&frame.payload);
                Ok(())
            }
        }
    }

    /// Parse a body of the given kind.
    pub fn decode_body(kind: MessageKind, mut body: Bytes) -> Result<Self, ShareError> {
        Ok(match kind {
            MessageKind::Join => Message::Join(bincode::deserialize(&body)?),
            MessageKind::JoinReply => Message::JoinReply(bincode::deserialize(&body)?),
            MessageKind::Ack => Message::Ack(bincode::deserialize(&body)?),
            MessageKind::Closed => Message::Closed(bincode::deserialize(&body)?),
            MessageKind::Leave => Message::Leave,
            MessageKind::Frame => {
                let header = FrameHeader::decode(&mut body)?;
                if body.len() != header.payload_len as usize {
                    return Err(ShareError::ProtocolViolation(
                        "frame payload length mismatch",
                    ));
                }
                Message::Frame(WireFrame {
                    session_id: header.session_id,
                    frame: Frame {
                        sequence: header.sequence,
                        kind: header.kind,
                        captured_at: Instant::now(),
                        payload: body,
                    },
                })
            }
        })
    }
}

fn put_bincode<T: Serialize>(dst: &mut BytesMut, value: &T) -> Result<(), ShareError> {
    let bytes = bincode::serialize(value)?;
    dst.extend_from_slice(&bytes);
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_message(kind: FrameKind) -> Message {
        Message::Frame(WireFrame {
            session_id: 9,
            frame: Frame {
                sequence: 42,
                kind,
                captured_at: Instant::now(),
                payload: Bytes::from_static(b"pixels"),
            },
        })
    }

    #[test]
    fn delta_header_layout() {
        let mut buf = BytesMut::new();
        frame_message(FrameKind::Delta { reference: 41 })
            .encode_body(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), FrameHeader::DELTA_SIZE + 6);
        assert_eq!(&buf[0..8], &9u64.to_le_bytes());
        assert_eq!(&buf[8..16], &42u64.to_le_bytes());
        assert_eq!(buf[16], FLAG_DELTA);
        assert_eq!(&buf[17..25], &41u64.to_le_bytes());
        assert_eq!(&buf[25..29], &6u32.to_le_bytes());

        match Message::decode_body(MessageKind::Frame, buf.freeze()).unwrap() {
            Message::Frame(wf) => {
                assert_eq!(wf.session_id, 9);
                assert_eq!(wf.frame.kind, FrameKind::Delta { reference: 41 });
                assert_eq!(&wf.frame.payload[..], b"pixels");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keyframe_header_has_no_reference() {
        let mut buf = BytesMut::new();
        frame_message(FrameKind::Keyframe).encode_body(&mut buf).unwrap();
        assert_eq!(buf.len(), FrameHeader::KEYFRAME_SIZE + 6);
        assert_eq!(buf[16], FLAG_KEYFRAME);
    }

    #[test]
    fn payload_length_must_match() {
        let mut buf = BytesMut::new();
        frame_message(FrameKind::Keyframe).encode_body(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            Message::decode_body(MessageKind::Frame, buf.freeze()),
            Err(ShareError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn unknown_frame_flag() {
        let mut buf = BytesMut::new();
        frame_message(FrameKind::Keyframe).encode_body(&mut buf).unwrap();
        buf[16] = 7;
        assert!(matches!(
            Message::decode_body(MessageKind::Frame, buf.freeze()),
            Err(ShareError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn join_reply_body() {
        let reply = JoinReply {
            status: JoinStatus::CodeExhausted,
            session_id: None,
        };
        let mut buf = BytesMut::new();
        Message::JoinReply(reply).encode_body(&mut buf).unwrap();
        match Message::decode_body(MessageKind::JoinReply, buf.freeze()).unwrap() {
            Message::JoinReply(r) => assert_eq!(r, reply),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_maps_to_admission_error() {
        assert!(JoinStatus::Ok.into_result().is_ok());
        assert!(matches!(
            JoinStatus::ExpiredCode.into_result(),
            Err(ShareError::ExpiredCode)
        ));
        assert!(MessageKind::try_from(0).is_err());
        assert_eq!(MessageKind::try_from(4).unwrap(), MessageKind::Frame);
    }
}
