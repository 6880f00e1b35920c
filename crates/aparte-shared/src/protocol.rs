use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{QueueId, RoomId, UserId};

/// Room-scoped signaling envelope carried over the realtime bus.
///
/// Receivers drop envelopes whose `room_id` does not match their current
/// room and envelopes they sent themselves (self-echo suppression).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub room_id: RoomId,
    pub sender: UserId,
    pub signal: RoomSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomSignal {
    /// Presence announcement, sent on subscribe and on demand
    Ready,
    /// SDP offer or answer
    Sdp { kind: SdpKind, sdp: String },
    /// ICE candidate (JSON-encoded candidate init)
    Ice { candidate: String },
    /// Session terminated by the sender
    EndSession,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Consent handshake envelope, published on the target's per-queue-entry
/// topic so signals never leak to unrelated waiting users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentEnvelope {
    /// Queue entry being addressed
    pub target_queue_id: QueueId,
    /// Queue entry of the signaling party
    pub sender_queue_id: QueueId,
    pub sender: UserId,
    pub signal: ConsentSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsentSignal {
    /// The sender consents to a session; carries their topic so the
    /// receiver can render an invitation
    Consent { topic: String },
    /// The sender declines / withdraws
    Reject,
}

impl SignalEnvelope {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl ConsentEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Who produced a chat message, from the local session's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatSender {
    Me,
    Peer,
}

/// A single chat message. Immutable once created; receivers re-tag
/// `sender` as `Peer` regardless of what arrived on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub sender: ChatSender,
}

impl ChatMessage {
    pub fn new(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            timestamp: chrono::Utc::now().timestamp_millis(),
            sender: ChatSender::Me,
        }
    }
}

/// Wire format of the peer data channel: JSON discriminated messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPacket {
    Chat { message: ChatMessage },
    TypingStart,
    TypingStop,
}

impl ChatPacket {
    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the JSON wire form
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMode;

    #[test]
    fn test_signal_envelope_roundtrip() {
        let a = UserId([1u8; 32]);
        let b = UserId([2u8; 32]);
        let msg = SignalEnvelope {
            room_id: RoomId::mint(&a, &b, ChatMode::Voice),
            sender: a,
            signal: RoomSignal::Sdp {
                kind: SdpKind::Offer,
                sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1".to_string(),
            },
        };

        let bytes = msg.to_bytes().unwrap();
        let restored = SignalEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(restored.room_id, msg.room_id);
        assert_eq!(restored.sender, msg.sender);
        if let RoomSignal::Sdp { kind, sdp } = restored.signal {
            assert_eq!(kind, SdpKind::Offer);
            assert!(sdp.starts_with("v=0"));
        } else {
            panic!("signal type mismatch");
        }
    }

    #[test]
    fn test_consent_envelope_roundtrip() {
        let msg = ConsentEnvelope {
            target_queue_id: QueueId::new(),
            sender_queue_id: QueueId::new(),
            sender: UserId([7u8; 32]),
            signal: ConsentSignal::Consent {
                topic: "jazz guitar".to_string(),
            },
        };

        let restored = ConsentEnvelope::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.target_queue_id, msg.target_queue_id);
        match restored.signal {
            ConsentSignal::Consent { topic } => assert_eq!(topic, "jazz guitar"),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn chat_packet_json_shape() {
        // The data channel is a JSON protocol with a `type` discriminator;
        // both ends must agree on the exact field names.
        let start = ChatPacket::TypingStart;
        let json = String::from_utf8(start.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"typing_start"}"#);

        let msg = ChatPacket::Chat {
            message: ChatMessage {
                id: Uuid::nil(),
                text: "hello".into(),
                timestamp: 123,
                sender: ChatSender::Me,
            },
        };
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(json.starts_with(r#"{"type":"chat","#));
        assert!(json.contains(r#""text":"hello""#));

        let restored = ChatPacket::from_json(json.as_bytes()).unwrap();
        assert_eq!(restored, msg);
    }

    #[test]
    fn chat_packet_rejects_garbage() {
        assert!(ChatPacket::from_json(b"not json").is_err());
        assert!(ChatPacket::from_json(br#"{"type":"unknown"}"#).is_err());
    }
}
