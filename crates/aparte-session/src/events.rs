//! Events the session façade pushes to its consumer.

use aparte_shared::protocol::ChatMessage;
use aparte_shared::types::{QueueId, UserId};
use aparte_store::Suggestion;

use crate::status::SessionStatus;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The composite status changed (also observable via the watch handle).
    StatusChanged(SessionStatus),

    /// The fallback suggestion slot changed; `None` clears it.
    SuggestedMatch(Option<Suggestion>),

    /// The suggested candidate left the queue or is otherwise gone.
    SuggestionUnavailable,

    /// A not-yet-reciprocated consent arrived from an unknown queue entry:
    /// a transient, dismissible invitation.
    InviteReceived { queue_id: QueueId, topic: String },

    /// The chat data channel is open; messages can be sent.
    ChatReady,

    /// A chat message arrived from the peer.
    MessageReceived(ChatMessage),

    /// The peer started (true) or stopped (false) typing.
    PeerTyping(bool),

    /// The peer ended the session; the engine re-enters the queue
    /// automatically.
    PeerLeft,

    /// A report was filed: the peer is now blocked locally and the match
    /// row has been removed.
    PeerReported(UserId),

    /// Transient user-facing notice (infra failures, evictions, ...).
    Notification(String),
}
