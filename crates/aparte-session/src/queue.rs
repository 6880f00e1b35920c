//! The match queue engine.
//!
//! One actor task per session owns the user's queue membership: the
//! decaying-threshold poll loop, the heartbeat, the mutual-consent
//! handshake for below-threshold suggestions, and the liveness watches on
//! the rows it cares about. External code drives it through
//! [`QueueCommand`]s and observes [`QueueEvent`]s — the same
//! command/notification shape as the bus swarm task, so no callback ever
//! outlives the phase that registered it: timers and subscriptions die
//! with the actor state that owns them.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use aparte_net::{BusMessage, SignalBus};
use aparte_shared::protocol::{ConsentEnvelope, ConsentSignal};
use aparte_shared::types::{ChatMode, QueueId, QueueStatus, RoomId, UserId};
use aparte_store::{Database, PairOutcome, QueueChange, QueueEntry, StoreError, Suggestion};

use crate::config::SessionConfig;
use crate::embedding::Embedder;
use crate::providers::SharedBlockList;
use crate::status::QueuePhase;

/// Commands sent *into* the engine task.
#[derive(Debug)]
pub enum QueueCommand {
    /// Enter the queue with a topic and mode.
    Enter { topic: String, mode: ChatMode },
    /// Leave the queue. Idempotent.
    Leave,
    /// Accept the suggested match (or a received invitation) by queue id.
    AcceptSuggested { queue_id: QueueId },
    /// Reject the current suggested match.
    RejectSuggested,
    /// Dismiss an invitation without touching the suggestion slot.
    RejectInvite { queue_id: QueueId },
    /// Stop the engine.
    Shutdown,
}

/// Notifications sent *from* the engine task.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Waiting/idle/error transitions. Matched has its own event.
    PhaseChanged(QueuePhase),
    /// A firm match: the discoverer/pairing side is the initiator.
    Matched {
        room_id: RoomId,
        peer: UserId,
        is_initiator: bool,
        topic: String,
        mode: ChatMode,
    },
    /// The suggestion slot changed; emitted only on actual change.
    Suggested(Option<Suggestion>),
    /// The suggested candidate disappeared or stopped waiting.
    SuggestionUnavailable,
    /// A consent arrived from a queue entry we neither suggested nor
    /// consented to.
    InviteReceived { queue_id: QueueId, topic: String },
    /// Transient user-facing notice.
    Notification(String),
}

/// Dependencies injected into the engine. Identity is explicit
/// configuration, never ambient state.
pub struct EngineDeps {
    pub user_id: UserId,
    pub db: Arc<Database>,
    pub bus: Arc<dyn SignalBus>,
    pub embedder: Arc<dyn Embedder>,
    pub blocklist: SharedBlockList,
    pub config: SessionConfig,
}

/// Spawn the engine actor. Returns the command sender and event receiver.
pub fn spawn_queue_engine(
    deps: EngineDeps,
) -> (mpsc::Sender<QueueCommand>, mpsc::Receiver<QueueEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);

    tokio::spawn(run_engine(deps, cmd_rx, event_tx));

    (cmd_tx, event_rx)
}

struct EngineState {
    phase: QueuePhase,
    entry: Option<QueueEntry>,
    topic: String,
    mode: ChatMode,
    entered_at: Option<Instant>,
    suggested: Option<Suggestion>,
    /// The queue id we have consented toward, if any.
    consented_to: Option<QueueId>,
    /// Queue ids that have sent us a not-yet-reciprocated consent.
    invites: HashSet<QueueId>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            phase: QueuePhase::Idle,
            entry: None,
            topic: String::new(),
            mode: ChatMode::Chat,
            entered_at: None,
            suggested: None,
            consented_to: None,
            invites: HashSet::new(),
        }
    }

    fn is_waiting(&self) -> bool {
        self.phase == QueuePhase::Waiting && self.entry.is_some()
    }
}

async fn run_engine(
    deps: EngineDeps,
    mut cmd_rx: mpsc::Receiver<QueueCommand>,
    event_tx: mpsc::Sender<QueueEvent>,
) {
    let mut poll = tokio::time::interval(deps.config.poll_interval);
    // A tick whose handler is still in flight must not overlap the next
    // one; handlers run inline in this loop and late ticks coalesce.
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut heartbeat = tokio::time::interval(deps.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut row_events = deps.db.subscribe_queue_changes();
    let mut state = EngineState::new();
    // Subscription to our own per-queue-entry consent topic. Lives outside
    // the state struct so the select arms below stay borrow-disjoint.
    let mut consent_rx: Option<mpsc::Receiver<BusMessage>> = None;

    info!(user = %deps.user_id.short(), "Queue engine started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(QueueCommand::Enter { topic, mode }) => {
                        enter(&deps, &mut state, &event_tx, &mut consent_rx, topic, mode).await;
                    }
                    Some(QueueCommand::Leave) => {
                        leave(&deps, &mut state, &event_tx).await;
                    }
                    Some(QueueCommand::AcceptSuggested { queue_id }) => {
                        accept_suggested(&deps, &mut state, &event_tx, queue_id).await;
                    }
                    Some(QueueCommand::RejectSuggested) => {
                        reject_suggested(&deps, &mut state, &event_tx).await;
                    }
                    Some(QueueCommand::RejectInvite { queue_id }) => {
                        reject_invite(&deps, &mut state, queue_id).await;
                    }
                    Some(QueueCommand::Shutdown) | None => {
                        debug!("Queue engine shutting down");
                        break;
                    }
                }
            }

            _ = poll.tick(), if state.is_waiting() => {
                poll_tick(&deps, &mut state, &event_tx).await;
            }

            _ = heartbeat.tick(), if state.is_waiting() => {
                if let Some(entry) = &state.entry {
                    if let Err(e) = deps.db.touch_queue_entry(entry.id) {
                        // Not retried; the cleanup job may evict us and the
                        // row-watch below will surface that.
                        warn!(error = %e, "Queue heartbeat failed");
                    }
                }
            }

            change = row_events.recv() => {
                match change {
                    Ok(change) => handle_row_change(&deps, &mut state, &event_tx, change).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Row change stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("Row change stream closed, stopping engine");
                        break;
                    }
                }
            }

            msg = recv_consent(&mut consent_rx) => {
                match msg {
                    Some(msg) => handle_consent(&deps, &mut state, &event_tx, msg).await,
                    None => {
                        debug!("Consent subscription ended");
                        consent_rx = None;
                    }
                }
            }
        }

        // The consent subscription only makes sense while waiting; any
        // transition away tears it down before the next await point.
        if !state.is_waiting() {
            consent_rx = None;
        }
    }

    info!(user = %deps.user_id.short(), "Queue engine terminated");
}

async fn recv_consent(rx: &mut Option<mpsc::Receiver<BusMessage>>) -> Option<BusMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn enter(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    consent_rx: &mut Option<mpsc::Receiver<BusMessage>>,
    topic: String,
    mode: ChatMode,
) {
    // Self-heal: drop any orphaned rows from crashed sessions before
    // inserting the fresh one.
    if let Err(e) = deps.db.delete_queue_entries_for_user(&deps.user_id) {
        warn!(error = %e, "Self-heal delete failed");
    }

    reset_match_state(state, event_tx).await;
    state.entry = None;
    state.topic = topic.clone();
    state.mode = mode;

    let embedding = match deps.embedder.embed(&topic).await {
        Ok(embedding) => embedding,
        Err(e) => {
            warn!(error = %e, "Topic embedding failed");
            set_phase(state, event_tx, QueuePhase::Error).await;
            notify(event_tx, "Could not start matchmaking, please try again").await;
            return;
        }
    };

    let entry = match deps
        .db
        .insert_queue_entry(deps.user_id, &topic, embedding, mode)
    {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, "Queue insert failed");
            set_phase(state, event_tx, QueuePhase::Error).await;
            notify(event_tx, "Could not start matchmaking, please try again").await;
            return;
        }
    };

    // Per-queue-entry consent scope, so accept/reject signals reach only us.
    match deps.bus.subscribe(&entry.id.to_topic()).await {
        Ok(rx) => *consent_rx = Some(rx),
        Err(e) => {
            warn!(error = %e, "Consent topic subscribe failed");
            *consent_rx = None;
        }
    }

    info!(
        user = %deps.user_id.short(),
        queue_id = %entry.id,
        mode = %mode,
        "Entered queue"
    );

    state.entry = Some(entry);
    state.entered_at = Some(Instant::now());
    set_phase(state, event_tx, QueuePhase::Waiting).await;
}

async fn leave(deps: &EngineDeps, state: &mut EngineState, event_tx: &mpsc::Sender<QueueEvent>) {
    let entry = state.entry.take();

    // Optimistic local reset before the delete completes: responsiveness
    // over strict consistency. A failed delete leaves a soon-stale row
    // that the next enter self-heals away.
    reset_match_state(state, event_tx).await;
    set_phase(state, event_tx, QueuePhase::Idle).await;

    let Some(entry) = entry else {
        return; // idempotent
    };

    if let Err(e) = deps.db.delete_queue_entry(entry.id) {
        warn!(error = %e, "Queue delete failed (row will be self-healed)");
    }
    info!(user = %deps.user_id.short(), "Left queue");
}

async fn accept_suggested(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    target: QueueId,
) {
    let Some(entry) = state.entry.clone() else {
        debug!("Accept ignored: not in queue");
        return;
    };
    if state.phase != QueuePhase::Waiting {
        debug!("Accept ignored: not waiting");
        return;
    }

    if let Err(e) = deps.db.set_consent(entry.id, Some(target)) {
        warn!(error = %e, "Consent write failed");
        notify(event_tx, "Could not accept the suggestion, please retry").await;
        return;
    }
    state.consented_to = Some(target);

    // Tell the candidate, on their private scope, that we are in.
    publish_consent(
        deps,
        entry.id,
        target,
        ConsentSignal::Consent {
            topic: state.topic.clone(),
        },
    )
    .await;

    // Confirming accept: the other side already signaled consent toward
    // us, so reciprocation is complete and the pairing can be made now.
    let peer_already_consented = state.invites.contains(&target)
        || state
            .suggested
            .as_ref()
            .is_some_and(|s| s.queue_id == target && s.peer_consented_to_me);

    if peer_already_consented {
        attempt_pairing(deps, state, event_tx, target).await;
    }
}

async fn reject_suggested(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
) {
    let Some(entry) = state.entry.clone() else {
        return;
    };

    if state.consented_to.take().is_some() {
        if let Err(e) = deps.db.set_consent(entry.id, None) {
            warn!(error = %e, "Consent clear failed");
        }
    }

    if let Some(suggestion) = state.suggested.take() {
        publish_consent(deps, entry.id, suggestion.queue_id, ConsentSignal::Reject).await;
        let _ = event_tx.send(QueueEvent::Suggested(None)).await;
    }
}

async fn reject_invite(deps: &EngineDeps, state: &mut EngineState, target: QueueId) {
    state.invites.remove(&target);
    if let Some(entry) = &state.entry {
        publish_consent(deps, entry.id, target, ConsentSignal::Reject).await;
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

async fn poll_tick(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
) {
    let Some(entry) = state.entry.clone() else {
        return;
    };
    let elapsed = state.entered_at.map(|t| t.elapsed()).unwrap_or_default();

    let threshold = deps.config.acceptance_threshold(elapsed);
    let excluded = deps.blocklist.combined();

    match deps.db.find_match(
        &deps.user_id,
        &entry.embedding,
        entry.mode,
        &excluded,
        threshold,
    ) {
        Ok(Some(outcome)) => {
            // The side whose poll discovered the match drives negotiation.
            become_matched(state, event_tx, outcome.room_id, outcome.peer_user_id, true).await;
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Match poll failed");
            return;
        }
    }

    // Only once the bar has fully relaxed do we surface weaker candidates.
    if !deps.config.at_floor(threshold) {
        return;
    }

    match deps.db.suggest_matches(
        &deps.user_id,
        &entry.embedding,
        entry.mode,
        entry.id,
        &excluded,
    ) {
        Ok(candidates) => {
            let best = candidates
                .into_iter()
                .next()
                .filter(|s| s.similarity > deps.config.suggestion_floor);
            update_suggestion(state, event_tx, best).await;
        }
        Err(e) => warn!(error = %e, "Suggestion query failed"),
    }
}

/// Replace the suggestion slot only when the candidate identity, topic,
/// similarity, or consent flag actually changed.
async fn update_suggestion(
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    suggestion: Option<Suggestion>,
) {
    if state.suggested == suggestion {
        return;
    }
    state.suggested = suggestion.clone();
    let _ = event_tx.send(QueueEvent::Suggested(suggestion)).await;
}

// ---------------------------------------------------------------------------
// Row-change watches
// ---------------------------------------------------------------------------

async fn handle_row_change(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    change: QueueChange,
) {
    match change {
        QueueChange::Updated(row) => {
            let own_id = state.entry.as_ref().map(|e| e.id);

            if own_id == Some(row.id) {
                // Passive match discovery: the resolver (driven by the
                // other side's poll) flipped our row to matched.
                if state.phase == QueuePhase::Waiting && row.status == QueueStatus::Matched {
                    if let Some(room_id) = row.room_id.clone() {
                        let peer = match deps.db.get_match(&room_id) {
                            Ok(Some(record)) => record.other_peer(&deps.user_id),
                            Ok(None) => None,
                            Err(e) => {
                                warn!(error = %e, "Match row lookup failed");
                                None
                            }
                        };

                        match peer {
                            Some(peer) => {
                                become_matched(state, event_tx, room_id, peer, false).await;
                            }
                            None => {
                                warn!(room = %room_id, "Matched row without match record")
                            }
                        }
                    }
                }
                if let Some(entry) = state.entry.as_mut() {
                    *entry = row;
                }
                return;
            }

            // Liveness watch on the suggested candidate.
            if state.phase == QueuePhase::Waiting
                && state
                    .suggested
                    .as_ref()
                    .is_some_and(|s| s.queue_id == row.id)
                && row.status != QueueStatus::Waiting
            {
                suggestion_gone(state, event_tx).await;
            }
        }

        QueueChange::Deleted(id) => {
            if state.entry.as_ref().is_some_and(|e| e.id == id) {
                if state.phase == QueuePhase::Waiting {
                    // Evicted externally (missed heartbeats, e.g. after a
                    // suspend); surface it instead of silently re-entering.
                    warn!(queue_id = %id, "Own queue entry was evicted");
                    state.entry = None;
                    reset_match_state(state, event_tx).await;
                    set_phase(state, event_tx, QueuePhase::Idle).await;
                    notify(event_tx, "Matchmaking expired, please start again").await;
                }
                return;
            }

            if state.phase == QueuePhase::Waiting
                && state.suggested.as_ref().is_some_and(|s| s.queue_id == id)
            {
                suggestion_gone(state, event_tx).await;
            }
            state.invites.remove(&id);
        }
    }
}

async fn suggestion_gone(state: &mut EngineState, event_tx: &mpsc::Sender<QueueEvent>) {
    debug!("Suggested candidate is no longer available");
    state.suggested = None;
    let _ = event_tx.send(QueueEvent::Suggested(None)).await;
    let _ = event_tx.send(QueueEvent::SuggestionUnavailable).await;
}

// ---------------------------------------------------------------------------
// Consent handshake
// ---------------------------------------------------------------------------

async fn handle_consent(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    msg: BusMessage,
) {
    let envelope = match ConsentEnvelope::from_bytes(&msg.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Dropping undecodable consent message");
            return;
        }
    };

    let Some(entry) = state.entry.clone() else {
        return;
    };
    if envelope.target_queue_id != entry.id {
        debug!("Dropping consent addressed to another entry");
        return;
    }
    if state.phase != QueuePhase::Waiting {
        debug!("Ignoring consent while not waiting");
        return;
    }

    let from = envelope.sender_queue_id;

    match envelope.signal {
        ConsentSignal::Consent { topic } => {
            debug!(from = %from, "Consent received");

            if state.consented_to == Some(from) {
                // Reciprocated: this is the firm-match fallback path.
                attempt_pairing(deps, state, event_tx, from).await;
            } else if let Some(suggestion) = state
                .suggested
                .clone()
                .filter(|s| s.queue_id == from && !s.peer_consented_to_me)
            {
                let mut updated = suggestion;
                updated.peer_consented_to_me = true;
                update_suggestion(state, event_tx, Some(updated)).await;
            } else if state.suggested.as_ref().is_some_and(|s| s.queue_id == from) {
                // Duplicate consent for an already-flagged suggestion.
            } else {
                // Unknown sender: surface a dismissible invitation.
                state.invites.insert(from);
                let _ = event_tx
                    .send(QueueEvent::InviteReceived {
                        queue_id: from,
                        topic,
                    })
                    .await;
            }
        }

        ConsentSignal::Reject => {
            debug!(from = %from, "Reject received");
            state.invites.remove(&from);

            if state.consented_to == Some(from) {
                state.consented_to = None;
                if let Err(e) = deps.db.set_consent(entry.id, None) {
                    warn!(error = %e, "Consent clear failed");
                }
            }
            if state.suggested.as_ref().is_some_and(|s| s.queue_id == from) {
                state.suggested = None;
                let _ = event_tx.send(QueueEvent::Suggested(None)).await;
            }
        }
    }
}

async fn attempt_pairing(
    deps: &EngineDeps,
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    target: QueueId,
) {
    let Some(entry) = state.entry.clone() else {
        return;
    };

    match deps.db.pair_consenting(entry.id, target) {
        Ok(PairOutcome::Created(outcome)) => {
            become_matched(state, event_tx, outcome.room_id, outcome.peer_user_id, true).await;
        }
        Ok(PairOutcome::Existing(outcome)) => {
            // The other side's pairing won the race; take the passive role.
            become_matched(
                state,
                event_tx,
                outcome.room_id,
                outcome.peer_user_id,
                false,
            )
            .await;
        }
        Err(StoreError::CandidateGone) => {
            state.consented_to = None;
            suggestion_gone(state, event_tx).await;
        }
        Err(e) => warn!(error = %e, "Consent pairing failed"),
    }
}

async fn publish_consent(
    deps: &EngineDeps,
    own_queue_id: QueueId,
    target: QueueId,
    signal: ConsentSignal,
) {
    let envelope = ConsentEnvelope {
        target_queue_id: target,
        sender_queue_id: own_queue_id,
        sender: deps.user_id,
        signal,
    };

    let bytes = match envelope.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Consent encode failed");
            return;
        }
    };

    if let Err(e) = deps.bus.publish(&target.to_topic(), bytes).await {
        warn!(error = %e, "Consent publish failed");
    }
}

// ---------------------------------------------------------------------------
// Shared transitions
// ---------------------------------------------------------------------------

async fn become_matched(
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    room_id: RoomId,
    peer: UserId,
    is_initiator: bool,
) {
    if state.phase == QueuePhase::Matched {
        // Duplicate/late delivery; the first transition won.
        return;
    }

    info!(
        room = %room_id,
        peer = %peer.short(),
        is_initiator,
        "Matched"
    );

    state.phase = QueuePhase::Matched;
    state.consented_to = None;
    state.invites.clear();
    if state.suggested.take().is_some() {
        let _ = event_tx.send(QueueEvent::Suggested(None)).await;
    }

    let _ = event_tx
        .send(QueueEvent::Matched {
            room_id,
            peer,
            is_initiator,
            topic: state.topic.clone(),
            mode: state.mode,
        })
        .await;
}

async fn reset_match_state(state: &mut EngineState, event_tx: &mpsc::Sender<QueueEvent>) {
    state.entered_at = None;
    state.consented_to = None;
    state.invites.clear();
    if state.suggested.take().is_some() {
        let _ = event_tx.send(QueueEvent::Suggested(None)).await;
    }
}

async fn set_phase(
    state: &mut EngineState,
    event_tx: &mpsc::Sender<QueueEvent>,
    phase: QueuePhase,
) {
    if state.phase != phase {
        state.phase = phase;
        let _ = event_tx.send(QueueEvent::PhaseChanged(phase)).await;
    }
}

async fn notify(event_tx: &mpsc::Sender<QueueEvent>, message: &str) {
    let _ = event_tx
        .send(QueueEvent::Notification(message.to_string()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use aparte_net::MemoryBus;
    use aparte_shared::embedding::Embedding;

    use crate::embedding::EmbedError;

    /// Deterministic embedder: each known topic maps to a fixed vector.
    struct VectorEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    impl VectorEmbedder {
        fn new(pairs: &[(&str, Vec<f32>)]) -> Arc<Self> {
            Arc::new(Self {
                vectors: pairs
                    .iter()
                    .map(|(topic, v)| (topic.to_string(), v.clone()))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl Embedder for VectorEmbedder {
        async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
            match self.vectors.get(text) {
                Some(v) => Ok(Embedding::new(v.clone()).unwrap()),
                None => Err(EmbedError::Service(format!("unknown topic: {text}"))),
            }
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    fn deps(
        user_id: UserId,
        db: &Arc<Database>,
        bus: &Arc<MemoryBus>,
        embedder: &Arc<VectorEmbedder>,
        config: SessionConfig,
    ) -> EngineDeps {
        EngineDeps {
            user_id,
            db: db.clone(),
            bus: bus.clone(),
            embedder: embedder.clone(),
            blocklist: SharedBlockList::empty(),
            config,
        }
    }

    async fn expect_matched(events: &mut mpsc::Receiver<QueueEvent>) -> (RoomId, UserId, bool) {
        loop {
            let event = timeout(Duration::from_secs(60), events.recv())
                .await
                .expect("timed out waiting for match")
                .expect("engine stopped");
            if let QueueEvent::Matched {
                room_id,
                peer,
                is_initiator,
                ..
            } = event
            {
                return (room_id, peer, is_initiator);
            }
        }
    }

    async fn expect_suggestion(events: &mut mpsc::Receiver<QueueEvent>) -> Suggestion {
        loop {
            let event = timeout(Duration::from_secs(60), events.recv())
                .await
                .expect("timed out waiting for suggestion")
                .expect("engine stopped");
            if let QueueEvent::Suggested(Some(suggestion)) = event {
                return suggestion;
            }
        }
    }

    // Similar topics: cosine 0.9 — above the starting threshold.
    fn similar_vectors() -> Arc<VectorEmbedder> {
        VectorEmbedder::new(&[
            ("music", vec![1.0, 0.0]),
            ("music festivals", vec![0.9, (1.0f32 - 0.81).sqrt()]),
        ])
    }

    // Distant topics: cosine 0.4 — below the floor, above the suggestion
    // cutoff.
    fn distant_vectors() -> Arc<VectorEmbedder> {
        VectorEmbedder::new(&[
            ("urban beekeeping", vec![1.0, 0.0]),
            ("night trains", vec![0.4, (1.0f32 - 0.16).sqrt()]),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn firm_match_splits_initiator_roles() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        let (a_cmd, mut a_events) =
            spawn_queue_engine(deps(alice, &db, &bus, &embedder, fast_config()));
        let (b_cmd, mut b_events) =
            spawn_queue_engine(deps(bob, &db, &bus, &embedder, fast_config()));

        a_cmd
            .send(QueueCommand::Enter {
                topic: "music".into(),
                mode: ChatMode::Voice,
            })
            .await
            .unwrap();
        b_cmd
            .send(QueueCommand::Enter {
                topic: "music festivals".into(),
                mode: ChatMode::Voice,
            })
            .await
            .unwrap();

        let (room_a, peer_a, init_a) = expect_matched(&mut a_events).await;
        let (room_b, peer_b, init_b) = expect_matched(&mut b_events).await;

        // Same room, each sees the other, exactly one initiator.
        assert_eq!(room_a, room_b);
        assert_eq!(peer_a, bob);
        assert_eq!(peer_b, alice);
        assert!(init_a ^ init_b, "exactly one side must initiate");
    }

    #[tokio::test(start_paused = true)]
    async fn distant_peer_becomes_suggestion_after_decay() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = distant_vectors();

        let carol = UserId([3u8; 32]);
        let dave = UserId([4u8; 32]);

        let (c_cmd, mut c_events) =
            spawn_queue_engine(deps(carol, &db, &bus, &embedder, fast_config()));
        let (d_cmd, _d_events) =
            spawn_queue_engine(deps(dave, &db, &bus, &embedder, fast_config()));

        c_cmd
            .send(QueueCommand::Enter {
                topic: "urban beekeeping".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();
        d_cmd
            .send(QueueCommand::Enter {
                topic: "night trains".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();

        // No firm match at 0.4 similarity; once the threshold has decayed
        // to the floor the candidate surfaces as a suggestion instead.
        let suggestion = expect_suggestion(&mut c_events).await;
        assert!((suggestion.similarity - 0.4).abs() < 0.01);
        assert_eq!(suggestion.topic, "night trains");
        assert!(!suggestion.peer_consented_to_me);

        // And it never became a firm match.
        let entry = db.active_entry_for_user(&carol).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn mutual_consent_converges_to_shared_room() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = distant_vectors();

        let carol = UserId([3u8; 32]);
        let dave = UserId([4u8; 32]);

        let (c_cmd, mut c_events) =
            spawn_queue_engine(deps(carol, &db, &bus, &embedder, fast_config()));
        let (d_cmd, mut d_events) =
            spawn_queue_engine(deps(dave, &db, &bus, &embedder, fast_config()));

        c_cmd
            .send(QueueCommand::Enter {
                topic: "urban beekeeping".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();
        d_cmd
            .send(QueueCommand::Enter {
                topic: "night trains".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();

        let c_suggestion = expect_suggestion(&mut c_events).await;
        let d_suggestion = expect_suggestion(&mut d_events).await;

        // Carol consents first; Dave sees his suggestion flip to
        // "peer consented".
        c_cmd
            .send(QueueCommand::AcceptSuggested {
                queue_id: c_suggestion.queue_id,
            })
            .await
            .unwrap();

        let flagged = expect_suggestion(&mut d_events).await;
        assert!(flagged.peer_consented_to_me);

        // Dave reciprocates: both converge on one shared room with
        // exactly one initiator.
        d_cmd
            .send(QueueCommand::AcceptSuggested {
                queue_id: d_suggestion.queue_id,
            })
            .await
            .unwrap();

        let (room_c, peer_c, init_c) = expect_matched(&mut c_events).await;
        let (room_d, peer_d, init_d) = expect_matched(&mut d_events).await;

        assert_eq!(room_c, room_d);
        assert_eq!(peer_c, dave);
        assert_eq!(peer_d, carol);
        assert!(init_c ^ init_d);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_consent_surfaces_invitation() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = distant_vectors();

        let carol = UserId([3u8; 32]);
        let dave = UserId([4u8; 32]);

        // Dave never sees suggestions (floor above any similarity), so
        // Carol's consent arrives from an unknown queue id.
        let mut d_config = fast_config();
        d_config.suggestion_floor = 0.95;

        let (c_cmd, mut c_events) =
            spawn_queue_engine(deps(carol, &db, &bus, &embedder, fast_config()));
        let (d_cmd, mut d_events) = spawn_queue_engine(deps(dave, &db, &bus, &embedder, d_config));

        c_cmd
            .send(QueueCommand::Enter {
                topic: "urban beekeeping".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();
        d_cmd
            .send(QueueCommand::Enter {
                topic: "night trains".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();

        let c_suggestion = expect_suggestion(&mut c_events).await;
        c_cmd
            .send(QueueCommand::AcceptSuggested {
                queue_id: c_suggestion.queue_id,
            })
            .await
            .unwrap();

        // Dave gets an invitation carrying Carol's topic.
        let invite_queue_id = loop {
            let event = timeout(Duration::from_secs(60), d_events.recv())
                .await
                .expect("timed out waiting for invite")
                .expect("engine stopped");
            if let QueueEvent::InviteReceived { queue_id, topic } = event {
                assert_eq!(topic, "urban beekeeping");
                break queue_id;
            }
        };

        // Accepting the invitation is a confirming accept: pairing is
        // immediate.
        d_cmd
            .send(QueueCommand::AcceptSuggested {
                queue_id: invite_queue_id,
            })
            .await
            .unwrap();

        let (room_c, _, _) = expect_matched(&mut c_events).await;
        let (room_d, _, _) = expect_matched(&mut d_events).await;
        assert_eq!(room_c, room_d);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_clears_suggestion_on_both_sides() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = distant_vectors();

        let carol = UserId([3u8; 32]);
        let dave = UserId([4u8; 32]);

        let (c_cmd, mut c_events) =
            spawn_queue_engine(deps(carol, &db, &bus, &embedder, fast_config()));
        let (d_cmd, mut d_events) =
            spawn_queue_engine(deps(dave, &db, &bus, &embedder, fast_config()));

        c_cmd
            .send(QueueCommand::Enter {
                topic: "urban beekeeping".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();
        d_cmd
            .send(QueueCommand::Enter {
                topic: "night trains".into(),
                mode: ChatMode::Chat,
            })
            .await
            .unwrap();

        let c_suggestion = expect_suggestion(&mut c_events).await;
        let _d_suggestion = expect_suggestion(&mut d_events).await;

        c_cmd
            .send(QueueCommand::AcceptSuggested {
                queue_id: c_suggestion.queue_id,
            })
            .await
            .unwrap();
        // Dave sees the consent flag...
        let flagged = expect_suggestion(&mut d_events).await;
        assert!(flagged.peer_consented_to_me);

        // ...then declines. Dave's slot clears immediately.
        d_cmd.send(QueueCommand::RejectSuggested).await.unwrap();
        loop {
            let event = timeout(Duration::from_secs(60), d_events.recv())
                .await
                .expect("timed out")
                .expect("engine stopped");
            if let QueueEvent::Suggested(None) = event {
                break;
            }
        }

        // Carol's consent marker is withdrawn by the reject.
        let withdrawn = timeout(Duration::from_secs(30), async {
            loop {
                let entry = db.active_entry_for_user(&carol).unwrap().unwrap();
                if entry.consented_queue_id.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(withdrawn.is_ok(), "reject must clear the consent marker");
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_users_are_never_paired() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        // Alice blocked Bob; both sessions load their block sets from the
        // store, so the exclusion applies in both directions.
        db.mark_blocked(&alice, &bob).unwrap();

        let mut a_deps = deps(alice, &db, &bus, &embedder, fast_config());
        a_deps.blocklist = SharedBlockList::new(db.block_sets(&alice).unwrap());
        let mut b_deps = deps(bob, &db, &bus, &embedder, fast_config());
        b_deps.blocklist = SharedBlockList::new(db.block_sets(&bob).unwrap());

        let (a_cmd, mut a_events) = spawn_queue_engine(a_deps);
        let (b_cmd, mut b_events) = spawn_queue_engine(b_deps);

        a_cmd
            .send(QueueCommand::Enter {
                topic: "music".into(),
                mode: ChatMode::Voice,
            })
            .await
            .unwrap();
        b_cmd
            .send(QueueCommand::Enter {
                topic: "music festivals".into(),
                mode: ChatMode::Voice,
            })
            .await
            .unwrap();

        // Give the pollers plenty of (virtual) time; no match may appear.
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            while let Ok(event) = a_events.try_recv() {
                assert!(
                    !matches!(event, QueueEvent::Matched { .. }),
                    "blocked peers must never match"
                );
            }
            while let Ok(event) = b_events.try_recv() {
                assert!(
                    !matches!(event, QueueEvent::Matched { .. }),
                    "blocked peers must never match"
                );
            }
        }
        let entry = db.active_entry_for_user(&alice).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_is_idempotent_and_deletes_row() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();
        let alice = UserId([1u8; 32]);

        let (cmd, mut events) = spawn_queue_engine(deps(alice, &db, &bus, &embedder, fast_config()));

        cmd.send(QueueCommand::Enter {
            topic: "music".into(),
            mode: ChatMode::Chat,
        })
        .await
        .unwrap();

        loop {
            if let Some(QueueEvent::PhaseChanged(QueuePhase::Waiting)) = events.recv().await {
                break;
            }
        }
        assert!(db.active_entry_for_user(&alice).unwrap().is_some());

        cmd.send(QueueCommand::Leave).await.unwrap();
        cmd.send(QueueCommand::Leave).await.unwrap(); // no-op

        loop {
            if let Some(QueueEvent::PhaseChanged(QueuePhase::Idle)) = events.recv().await {
                break;
            }
        }
        // The row is gone and nothing re-created it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(db.active_entry_for_user(&alice).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn embedding_failure_surfaces_error_phase() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();
        let alice = UserId([1u8; 32]);

        let (cmd, mut events) = spawn_queue_engine(deps(alice, &db, &bus, &embedder, fast_config()));

        // Topic unknown to the embedder: the external call fails and the
        // engine lands in the error phase with a user-facing notice.
        cmd.send(QueueCommand::Enter {
            topic: "no vector for this".into(),
            mode: ChatMode::Chat,
        })
        .await
        .unwrap();

        let mut saw_error = false;
        let mut saw_notice = false;
        while !(saw_error && saw_notice) {
            match timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out")
                .expect("engine stopped")
            {
                QueueEvent::PhaseChanged(QueuePhase::Error) => saw_error = true,
                QueueEvent::Notification(_) => saw_notice = true,
                _ => {}
            }
        }
        assert!(db.active_entry_for_user(&alice).unwrap().is_none());
    }
}
