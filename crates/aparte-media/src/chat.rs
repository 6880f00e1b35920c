//! Chat protocol layer riding the data channel.
//!
//! Holds the bounded per-session message history and the typing-indicator
//! debounce bookkeeping. Wire encoding lives in
//! [`aparte_shared::protocol::ChatPacket`]; sending lives on
//! [`crate::peer::PeerSession::send_packet`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use aparte_shared::constants::CHAT_HISTORY_CAP;
use aparte_shared::protocol::{ChatMessage, ChatSender};

/// Bounded, ordered message history for one session. Oldest messages are
/// dropped past the cap; nothing is persisted beyond the session.
#[derive(Debug)]
pub struct ChatHistory {
    messages: VecDeque<ChatMessage>,
    cap: usize,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::with_cap(CHAT_HISTORY_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    /// Append a locally sent message (optimistic, no ack).
    pub fn push_local(&mut self, mut message: ChatMessage) {
        message.sender = ChatSender::Me;
        self.push(message);
    }

    /// Append a received message; the sender tag on the wire is ignored.
    pub fn push_remote(&mut self, mut message: ChatMessage) {
        message.sender = ChatSender::Peer;
        self.push(message);
    }

    fn push(&mut self, message: ChatMessage) {
        if self.messages.len() == self.cap {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Typing debounce
// ---------------------------------------------------------------------------

/// What the caller must send after reporting an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    SendStart,
    Nothing,
}

/// Typing-indicator debounce state.
///
/// The first keystroke after idle sends `typing_start`; every keystroke
/// pushes the stop deadline out; 3 seconds of silence sends `typing_stop`.
/// Submitting a message cancels the deadline and sends the stop *before*
/// the chat payload, so the receiver never shows a stale indicator after
/// the message lands.
///
/// The struct is pure state over injected instants; the session runtime
/// owns the actual timer.
#[derive(Debug, Default)]
pub struct TypingState {
    deadline: Option<Instant>,
}

impl TypingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a keystroke at `now`.
    pub fn on_keystroke(&mut self, now: Instant, idle: Duration) -> TypingAction {
        let action = if self.deadline.is_none() {
            TypingAction::SendStart
        } else {
            TypingAction::Nothing
        };
        self.deadline = Some(now + idle);
        action
    }

    /// Report a message submit. Returns whether a `typing_stop` must be
    /// sent (i.e. the peer currently believes we are typing).
    pub fn on_submit(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// The pending stop deadline, if any, for the runtime to sleep on.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Report that the deadline fired. Returns whether `typing_stop` must
    /// be sent (false if the deadline was already cancelled or moved).
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn msg(text: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            text: text.to_string(),
            timestamp: 0,
            sender: ChatSender::Me,
        }
    }

    #[test]
    fn history_drops_oldest_past_cap() {
        let mut history = ChatHistory::with_cap(3);
        for i in 0..5 {
            history.push_remote(msg(&format!("m{i}")));
        }

        assert_eq!(history.len(), 3);
        let texts: Vec<&str> = history.messages().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn history_retags_senders() {
        let mut history = ChatHistory::new();
        let mut incoming = msg("hi");
        incoming.sender = ChatSender::Me; // wire claims "me" — ignored
        history.push_remote(incoming);
        history.push_local(msg("hello"));

        let senders: Vec<ChatSender> = history.messages().map(|m| m.sender).collect();
        assert_eq!(senders, vec![ChatSender::Peer, ChatSender::Me]);
    }

    #[test]
    fn debounce_sends_one_start_then_one_stop() {
        let idle = Duration::from_secs(3);
        let t0 = Instant::now();
        let mut typing = TypingState::new();

        // Keystrokes at t=0, 500ms, 1000ms: exactly one start.
        assert_eq!(typing.on_keystroke(t0, idle), TypingAction::SendStart);
        assert_eq!(
            typing.on_keystroke(t0 + Duration::from_millis(500), idle),
            TypingAction::Nothing
        );
        assert_eq!(
            typing.on_keystroke(t0 + Duration::from_millis(1000), idle),
            TypingAction::Nothing
        );

        // The stop deadline sits at last keystroke + idle = t0 + 4000ms.
        assert_eq!(typing.deadline(), Some(t0 + Duration::from_millis(4000)));
        assert!(!typing.on_deadline(t0 + Duration::from_millis(3999)));
        assert!(typing.on_deadline(t0 + Duration::from_millis(4000)));

        // Once fired, nothing further is pending.
        assert_eq!(typing.deadline(), None);
        assert!(!typing.on_deadline(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn submit_cancels_timer_and_forces_stop() {
        let idle = Duration::from_secs(3);
        let t0 = Instant::now();
        let mut typing = TypingState::new();

        typing.on_keystroke(t0, idle);
        // Submit while "typing": stop must be sent before the chat payload.
        assert!(typing.on_submit());
        assert_eq!(typing.deadline(), None);

        // Submit while idle: no stop owed.
        assert!(!typing.on_submit());
    }
}
