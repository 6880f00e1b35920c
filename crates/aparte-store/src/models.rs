//! Domain model structs persisted in the shared matchmaking store.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aparte_shared::embedding::Embedding;
use aparte_shared::types::{ChatMode, QueueId, QueueStatus, RoomId, UserId};

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

/// A user's pending matchmaking request.
///
/// At most one active (`waiting`/`matched`) entry exists per user at any
/// time; `enterQueue` self-heals by deleting any pre-existing rows before
/// inserting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: QueueId,
    pub user_id: UserId,
    pub topic: String,
    pub embedding: Embedding,
    pub mode: ChatMode,
    pub status: QueueStatus,
    /// The queue entry this user has provisionally accepted, if any.
    pub consented_queue_id: Option<QueueId>,
    /// Set once the resolver (or a consent pairing) has matched this entry.
    pub room_id: Option<RoomId>,
    /// Heartbeat timestamp; stale entries are evicted.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

/// The resolved pairing of two queue entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub room_id: RoomId,
    /// Canonical order: `peer_a <= peer_b`.
    pub peer_a: UserId,
    pub peer_b: UserId,
    pub topic: String,
    pub mode: ChatMode,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    /// The other participant, or `None` if `me` is not part of the match.
    pub fn other_peer(&self, me: &UserId) -> Option<UserId> {
        if &self.peer_a == me {
            Some(self.peer_b)
        } else if &self.peer_b == me {
            Some(self.peer_a)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver outputs
// ---------------------------------------------------------------------------

/// A firm pairing returned by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub room_id: RoomId,
    pub peer_user_id: UserId,
}

/// Outcome of a mutual-consent pairing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// This call created the pairing — the caller is the initiator.
    Created(MatchOutcome),
    /// The other side already paired us — the caller takes the passive role.
    Existing(MatchOutcome),
}

/// A below-threshold candidate surfaced as a fallback suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub queue_id: QueueId,
    pub topic: String,
    pub similarity: f32,
    /// Whether that candidate has already consented toward the querying user.
    pub peer_consented_to_me: bool,
}

// ---------------------------------------------------------------------------
// Block list
// ---------------------------------------------------------------------------

/// Both directions of a user's block relationships.
#[derive(Debug, Clone, Default)]
pub struct BlockSets {
    /// Users this user has blocked.
    pub blocked: HashSet<UserId>,
    /// Users who have blocked this user.
    pub blocked_by: HashSet<UserId>,
}

impl BlockSets {
    /// The union used as the exclusion set on every resolver call.
    pub fn combined(&self) -> HashSet<UserId> {
        self.blocked.union(&self.blocked_by).copied().collect()
    }
}
