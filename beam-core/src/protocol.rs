//! Signaling control messages (JSON over the relay, or text over an open peer channel)
//! and the identifiers shared with the binary framing.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relay-assigned endpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Per-transfer identifier. 64-bit on the wire; JSON carries it as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    pub const fn new(id: u64) -> Self {
        FileId(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(FileId)
    }
}

impl Serialize for FileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = FileId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a file id as decimal string or unsigned integer")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<FileId, E> {
                Ok(FileId(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<FileId, E> {
                u64::try_from(v)
                    .map(FileId)
                    .map_err(|_| E::custom("negative file id"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<FileId, E> {
                v.parse().map_err(E::custom)
            }
        }

        d.deserialize_any(Visitor)
    }
}

/// Issues process-unique file ids derived from wall-clock milliseconds.
/// Two ids issued within the same millisecond are bumped so they never collide.
#[derive(Debug, Default)]
pub struct FileIdGenerator {
    last: u64,
}

impl FileIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> FileId {
        self.next_at(unix_millis())
    }

    fn next_at(&mut self, now_ms: u64) -> FileId {
        let id = now_ms.max(self.last.saturating_add(1));
        self.last = id;
        FileId(id)
    }
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
}

/// Control messages exchanged between two endpoints through the signaling relay.
/// `webrtc_*` payloads belong to the transport collaborator and are forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "file_offer")]
    Offer {
        file_name: String,
        file_size: u64,
        #[serde(default)]
        file_type: String,
        file_id: FileId,
        #[serde(rename = "e2ee_on", default)]
        encrypted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },
    #[serde(rename = "file_response")]
    Response {
        file_id: FileId,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },
    #[serde(rename = "file_cancel")]
    Cancel {
        file_id: FileId,
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "e2ee_fingerprint")]
    Fingerprint { file_id: FileId, fingerprint: String },
    #[serde(rename = "webrtc_offer")]
    NegotiationOffer { offer: serde_json::Value },
    #[serde(rename = "webrtc_answer")]
    NegotiationAnswer { answer: serde_json::Value },
    #[serde(rename = "webrtc_ice")]
    NegotiationIce { candidate: serde_json::Value },
}

impl ControlMessage {
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            ControlMessage::Offer { file_id, .. }
            | ControlMessage::Response { file_id, .. }
            | ControlMessage::Cancel { file_id, .. }
            | ControlMessage::Fingerprint { file_id, .. } => Some(*file_id),
            _ => None,
        }
    }
}

/// Relay-bound envelope: the relay routes on `target_user_id`.
#[derive(Debug, Serialize)]
struct Outbound<'a> {
    target_user_id: &'a PeerId,
    #[serde(flatten)]
    message: &'a ControlMessage,
}

/// Relay-delivered envelope: the relay stamps the origin as `sender_id`.
#[derive(Debug, Deserialize)]
struct Inbound {
    sender_id: PeerId,
    #[serde(flatten)]
    message: ControlMessage,
}

/// Serialize a control message addressed to `target` for the relay.
pub fn encode_signal(target: &PeerId, message: &ControlMessage) -> Result<String, SignalCodecError> {
    Ok(serde_json::to_string(&Outbound {
        target_user_id: target,
        message,
    })?)
}

/// Parse a relay-delivered control message, returning its sender.
pub fn decode_signal(text: &str) -> Result<(PeerId, ControlMessage), SignalCodecError> {
    let inbound: Inbound = serde_json::from_str(text)?;
    Ok((inbound.sender_id, inbound.message))
}

/// Parse a bare control message (text arriving over an open peer channel).
pub fn decode_control(text: &str) -> Result<ControlMessage, SignalCodecError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, thiserror::Error)]
pub enum SignalCodecError {
    #[error("invalid control message: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_uses_relay_field_names() {
        let msg = ControlMessage::Offer {
            file_name: "a.bin".into(),
            file_size: 10,
            file_type: "application/octet-stream".into(),
            file_id: FileId::new(42),
            encrypted: true,
            pubkey: Some("AAAA".into()),
        };
        let text = encode_signal(&PeerId::from("ab12cd34"), &msg).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "file_offer");
        assert_eq!(v["target_user_id"], "ab12cd34");
        assert_eq!(v["file_id"], "42");
        assert_eq!(v["e2ee_on"], true);
        assert_eq!(v["pubkey"], "AAAA");
    }

    #[test]
    fn inbound_accepts_string_or_numeric_file_id() {
        let (from, msg) =
            decode_signal(r#"{"type":"file_cancel","file_id":"7","reason":"x","sender_id":"p1"}"#)
                .unwrap();
        assert_eq!(from, PeerId::from("p1"));
        assert_eq!(msg.file_id(), Some(FileId::new(7)));

        let (_, msg) = decode_signal(
            r#"{"type":"file_response","file_id":8,"status":"rejected","sender_id":"p1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response {
                file_id: FileId::new(8),
                status: ResponseStatus::Rejected,
                reason: None,
                pubkey: None,
            }
        );
    }

    #[test]
    fn negotiation_payload_is_untouched() {
        let text = r#"{"type":"webrtc_ice","candidate":{"candidate":"c0","sdpMid":"0"},"sender_id":"p2"}"#;
        let (_, msg) = decode_signal(text).unwrap();
        match msg {
            ControlMessage::NegotiationIce { candidate } => {
                assert_eq!(candidate["sdpMid"], "0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(decode_signal(r#"{"type":"pong","sender_id":"p"}"#).is_err());
    }

    #[test]
    fn file_ids_are_strictly_increasing() {
        let mut ids = FileIdGenerator::new();
        let a = ids.next_at(1_000);
        let b = ids.next_at(1_000);
        let c = ids.next_at(999);
        let d = ids.next_at(5_000);
        assert_eq!(a.get(), 1_000);
        assert_eq!(b.get(), 1_001);
        assert_eq!(c.get(), 1_002);
        assert_eq!(d.get(), 5_000);
    }
}
