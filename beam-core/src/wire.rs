//! Peer-channel framing: DATA and ACK binary frames, fixed-width big-endian integers.
//!
//! ```text
//! DATA  [0x43][file_id:8][offset:8][timestamp:8][payload:N]   header 25 bytes
//! ACK   [0x41][file_id:8][received:8]                          17 bytes
//! ```

use crate::protocol::FileId;

pub const TAG_DATA: u8 = 0x43;
pub const TAG_ACK: u8 = 0x41;

/// Size of the DATA header preceding the payload.
pub const DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
/// Size of an ACK frame.
pub const ACK_FRAME_LEN: usize = 1 + 8 + 8;

/// One chunk of file content. `payload` is ciphertext (nonce-prefixed) when the transfer is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub file_id: FileId,
    pub offset: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

/// Cumulative acknowledgment: total bytes the receiver has stored for `file_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub file_id: FileId,
    pub received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Ack(AckFrame),
}

/// Encode a DATA frame around an already prepared payload.
pub fn encode_data(file_id: FileId, offset: u64, timestamp_ms: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
    out.push(TAG_DATA);
    out.extend_from_slice(&file_id.get().to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_ack(file_id: FileId, received: u64) -> [u8; ACK_FRAME_LEN] {
    let mut out = [0u8; ACK_FRAME_LEN];
    out[0] = TAG_ACK;
    out[1..9].copy_from_slice(&file_id.get().to_be_bytes());
    out[9..17].copy_from_slice(&received.to_be_bytes());
    out
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Data(d) => encode_data(d.file_id, d.offset, d.timestamp_ms, &d.payload),
            Frame::Ack(a) => encode_ack(a.file_id, a.received).to_vec(),
        }
    }
}

/// Decode one frame occupying all of `bytes`.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    let Some(&tag) = bytes.first() else {
        return Err(FrameDecodeError::Empty);
    };
    match tag {
        TAG_DATA => {
            if bytes.len() < DATA_HEADER_LEN {
                return Err(FrameDecodeError::TooShort {
                    expected: DATA_HEADER_LEN,
                    actual: bytes.len(),
                });
            }
            Ok(Frame::Data(DataFrame {
                file_id: FileId::new(read_u64(&bytes[1..9])),
                offset: read_u64(&bytes[9..17]),
                timestamp_ms: read_u64(&bytes[17..25]),
                payload: bytes[DATA_HEADER_LEN..].to_vec(),
            }))
        }
        TAG_ACK => {
            if bytes.len() < ACK_FRAME_LEN {
                return Err(FrameDecodeError::TooShort {
                    expected: ACK_FRAME_LEN,
                    actual: bytes.len(),
                });
            }
            Ok(Frame::Ack(AckFrame {
                file_id: FileId::new(read_u64(&bytes[1..9])),
                received: read_u64(&bytes[9..17]),
            }))
        }
        other => Err(FrameDecodeError::UnknownTag(other)),
    }
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_be_bytes(buf)
}

/// Error decoding a peer-channel frame. Callers drop the frame; the session continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
}
