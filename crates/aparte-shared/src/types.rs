use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{QUEUE_TOPIC_PREFIX, ROOM_TOPIC_PREFIX};

// User identity = opaque 32-byte id, injected by the embedding application
// (authentication lives outside this workspace)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub [u8; 32]);

impl UserId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Server-assigned id of a queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueueId(pub Uuid);

impl QueueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Per-queue-entry broadcast scope for consent/reject signals.
    pub fn to_topic(&self) -> String {
        format!("{}{}", QUEUE_TOPIC_PREFIX, self.0)
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a matched room. Derived from the sorted peer pair, the mode,
/// a timestamp and a nonce, so exactly one party mints it and both learn the
/// same value through the store. Doubles as the signaling topic scope and the
/// moderation-report key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn derive(a: &UserId, b: &UserId, mode: ChatMode, timestamp_ms: i64, nonce: u64) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new();
        hasher.update(&lo.0);
        hasher.update(&hi.0);
        hasher.update(mode.as_str().as_bytes());
        hasher.update(&timestamp_ms.to_le_bytes());
        hasher.update(&nonce.to_le_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Mint a fresh room id for a pairing being created now.
    pub fn mint(a: &UserId, b: &UserId, mode: ChatMode) -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let nonce: u64 = rand::random();
        Self::derive(a, b, mode, now_ms, nonce)
    }

    /// Room-scoped signaling topic.
    pub fn to_topic(&self) -> String {
        format!("{}{}", ROOM_TOPIC_PREFIX, self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired session mode a user queues with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Voice,
    Chat,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Chat => "chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(Self::Voice),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queue entry row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Matched,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Matched => "matched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "matched" => Some(Self::Matched),
            _ => None,
        }
    }
}
