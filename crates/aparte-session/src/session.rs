//! The session façade.
//!
//! One [`Session`] per user composes the queue engine, the room signaling
//! channel, the WebRTC orchestrator, the microphone, and the chat layer
//! into a single programmatic API with a watch-observable composite
//! status and an event stream. Internally it is one runtime actor: every
//! callback-ish input (engine events, room signals, transport events,
//! typing/negotiation deadlines) is an arm of the same select loop, so
//! room teardown synchronously silences everything scoped to that room —
//! no stale callback can mutate state after the room is gone.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use aparte_media::{
    new_voice_track, pump_capture, pump_playback, voice_encoder, AudioConfig, AudioDevice,
    ChatHistory, IceConfig, MediaFailure, PeerEvent, PeerSession, RoomChannel, RoomEvent,
    TransportState, TypingAction, TypingState,
};
use aparte_net::SignalBus;
use aparte_shared::protocol::{ChatMessage, ChatPacket, RoomSignal, SdpKind};
use aparte_shared::types::{ChatMode, QueueId, RoomId, UserId};
use aparte_store::{BlockSets, Database};

use crate::config::SessionConfig;
use crate::embedding::Embedder;
use crate::events::SessionEvent;
use crate::providers::{load_ice_config, BlockListProvider, IceServerProvider, SharedBlockList};
use crate::queue::{spawn_queue_engine, EngineDeps, QueueCommand, QueueEvent};
use crate::status::{derive_status, QueuePhase, SessionStatus};

/// Everything a session needs, injected explicitly. Identity is
/// configuration, never ambient state.
pub struct SessionDeps {
    pub user_id: UserId,
    pub db: Arc<Database>,
    pub bus: Arc<dyn SignalBus>,
    pub embedder: Arc<dyn Embedder>,
    /// ICE provisioning; `None` means the STUN-only default.
    pub ice_provider: Option<Arc<dyn IceServerProvider>>,
    /// Block lists; `None` starts with an empty set.
    pub blocklist_provider: Option<Arc<dyn BlockListProvider>>,
    pub config: SessionConfig,
}

enum SessionCommand {
    EnterQueue {
        topic: String,
        mode: ChatMode,
    },
    LeaveQueue,
    AcceptSuggested {
        queue_id: QueueId,
    },
    RejectSuggested,
    RejectInvite {
        queue_id: QueueId,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Keystroke,
    End {
        requeue: bool,
    },
    RequestLocalAudio,
    SetMuted(bool),
    ReportPeer {
        reply: oneshot::Sender<Option<UserId>>,
    },
    History {
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    Shutdown,
}

/// Handle to a running session.
///
/// All methods are cheap message sends into the runtime actor; dropping
/// the handle does not stop the session — call [`Session::shutdown`].
pub struct Session {
    cmd_tx: mpsc::Sender<SessionCommand>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl Session {
    /// Start a session: fetch the block sets, load ICE configuration
    /// (STUN-only fallback on failure), spawn the queue engine and the
    /// runtime actor. Returns the handle and the event stream.
    pub async fn start(deps: SessionDeps) -> (Self, mpsc::Receiver<SessionEvent>) {
        let SessionDeps {
            user_id,
            db,
            bus,
            embedder,
            ice_provider,
            blocklist_provider,
            config,
        } = deps;

        // Consumed once at session start; a report appends locally later.
        let block_sets = match &blocklist_provider {
            Some(provider) => match provider.fetch(&user_id).await {
                Ok(sets) => sets,
                Err(e) => {
                    warn!(error = %e, "Block list fetch failed, starting with an empty set");
                    BlockSets::default()
                }
            },
            None => BlockSets::default(),
        };
        let blocklist = SharedBlockList::new(block_sets);

        let ice = load_ice_config(ice_provider.as_deref()).await;

        let (engine_cmd, engine_events) = spawn_queue_engine(EngineDeps {
            user_id,
            db: db.clone(),
            bus: bus.clone(),
            embedder,
            blocklist: blocklist.clone(),
            config: config.clone(),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);

        let runtime = SessionRuntime {
            user_id,
            db,
            bus,
            config,
            ice,
            blocklist,
            engine_cmd,
            event_tx,
            status_tx,
            queue_phase: QueuePhase::Idle,
            media_failure: None,
            transport: None,
            room: None,
            audio: AudioDevice::new(AudioConfig::default()),
            local_track: None,
            typing: TypingState::new(),
            topic: String::new(),
            mode: ChatMode::Chat,
        };
        tokio::spawn(run_session(runtime, cmd_rx, engine_events));

        (Self { cmd_tx, status_rx }, event_rx)
    }

    /// The current composite status.
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// A watch handle for observing status transitions.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Enter the matchmaking queue with a topic and mode.
    pub async fn enter_queue(&self, topic: impl Into<String>, mode: ChatMode) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::EnterQueue {
                topic: topic.into(),
                mode,
            })
            .await;
    }

    /// Leave the queue. Idempotent.
    pub async fn leave_queue(&self) {
        let _ = self.cmd_tx.send(SessionCommand::LeaveQueue).await;
    }

    /// Accept the current suggestion or a received invitation.
    pub async fn accept_suggested_match(&self, queue_id: QueueId) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::AcceptSuggested { queue_id })
            .await;
    }

    /// Reject the current suggestion.
    pub async fn reject_suggested_match(&self) {
        let _ = self.cmd_tx.send(SessionCommand::RejectSuggested).await;
    }

    /// Dismiss an invitation.
    pub async fn reject_invite(&self, queue_id: QueueId) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::RejectInvite { queue_id })
            .await;
    }

    /// Send a chat message to the peer.
    ///
    /// Returns `false` when there is no open data channel — nothing is
    /// queued or retried, the caller decides what to do with the text.
    pub async fn send_chat_message(&self, text: impl Into<String>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::SendChat {
                text: text.into(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Report a keystroke in the chat input. The first keystroke after
    /// idle sends `typing_start`; the stop follows after the idle window
    /// or immediately before the next message.
    pub async fn typing_keystroke(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Keystroke).await;
    }

    /// End the current session. With `requeue` the engine immediately
    /// looks for a new peer on the same topic; otherwise the user leaves
    /// matchmaking entirely.
    pub async fn end(&self, requeue: bool) {
        let _ = self.cmd_tx.send(SessionCommand::End { requeue }).await;
    }

    /// Acquire the microphone and start feeding it to the session. Once a
    /// transport is live the new track triggers a renegotiation round.
    /// Failures surface through the status (permission denied, no mic,
    /// media error) and are not retried.
    pub async fn request_local_audio(&self) {
        let _ = self.cmd_tx.send(SessionCommand::RequestLocalAudio).await;
    }

    /// Toggle the microphone mute flag.
    pub async fn set_muted(&self, muted: bool) {
        let _ = self.cmd_tx.send(SessionCommand::SetMuted(muted)).await;
    }

    /// File a report against the current peer: the peer joins the local
    /// block set, the match row is deleted, and the session ends. Returns
    /// the blocked peer, or `None` when no session is active.
    pub async fn report_peer(&self) -> Option<UserId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::ReportPeer { reply: reply_tx })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }

    /// Snapshot of the current session's bounded chat history.
    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::History { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Stop the runtime, the queue engine, and the audio device.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Runtime actor
// ---------------------------------------------------------------------------

/// Per-room state, discarded wholesale on room change. Transports are
/// never reused across rooms.
struct RoomRuntime {
    room_id: RoomId,
    peer: UserId,
    channel: RoomChannel,
    session: PeerSession,
    history: ChatHistory,
    /// Armed while negotiating; cleared on `connected`. Expiry abandons
    /// the room and returns to the queue.
    negotiation_deadline: Option<Instant>,
}

struct SessionRuntime {
    user_id: UserId,
    db: Arc<Database>,
    bus: Arc<dyn SignalBus>,
    config: SessionConfig,
    ice: IceConfig,
    blocklist: SharedBlockList,
    engine_cmd: mpsc::Sender<QueueCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    queue_phase: QueuePhase,
    media_failure: Option<MediaFailure>,
    /// Sticky across teardown on terminal transport states, so the caller
    /// sees `ended` until the next queue entry clears it.
    transport: Option<TransportState>,
    room: Option<RoomRuntime>,
    audio: AudioDevice,
    local_track: Option<Arc<aparte_media::TrackLocalStaticSample>>,
    typing: TypingState,
    /// Last entered topic/mode, for automatic re-queue.
    topic: String,
    mode: ChatMode,
}

async fn run_session(
    mut rt: SessionRuntime,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut engine_events: mpsc::Receiver<QueueEvent>,
) {
    // Receivers live outside the runtime struct so the select arms below
    // stay borrow-disjoint; both are bound to the current room only.
    let mut room_rx: Option<mpsc::Receiver<RoomEvent>> = None;
    let mut peer_rx: Option<mpsc::Receiver<PeerEvent>> = None;

    info!(user = %rt.user_id.short(), "Session runtime started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if rt.handle_command(cmd, &mut room_rx, &mut peer_rx).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            event = engine_events.recv() => {
                match event {
                    Some(event) => {
                        rt.handle_queue_event(event, &mut room_rx, &mut peer_rx).await;
                    }
                    None => {
                        warn!("Queue engine stopped, stopping session");
                        break;
                    }
                }
            }

            event = recv_opt(&mut room_rx) => {
                match event {
                    Some(event) => {
                        rt.handle_room_event(event, &mut room_rx, &mut peer_rx).await;
                    }
                    None => room_rx = None,
                }
            }

            event = recv_opt(&mut peer_rx) => {
                match event {
                    Some(event) => {
                        rt.handle_peer_event(event, &mut room_rx, &mut peer_rx).await;
                    }
                    None => peer_rx = None,
                }
            }

            _ = sleep_opt(rt.negotiation_deadline()), if rt.negotiation_deadline().is_some() => {
                rt.on_negotiation_timeout(&mut room_rx, &mut peer_rx).await;
            }

            _ = sleep_opt(rt.typing_deadline()), if rt.typing_deadline().is_some() => {
                rt.on_typing_deadline().await;
            }
        }
    }

    rt.audio.stop();
    let _ = rt.engine_cmd.send(QueueCommand::Shutdown).await;
    info!(user = %rt.user_id.short(), "Session runtime terminated");
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionRuntime {
    fn negotiation_deadline(&self) -> Option<Instant> {
        self.room.as_ref().and_then(|r| r.negotiation_deadline)
    }

    fn typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline().map(Instant::from_std)
    }

    // -- status ------------------------------------------------------------

    async fn push_status(&mut self) {
        let status = derive_status(self.media_failure, self.queue_phase, self.transport);
        let changed = self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.event_tx.send(SessionEvent::StatusChanged(status)).await;
        }
    }

    async fn notify(&self, message: &str) {
        let _ = self
            .event_tx
            .send(SessionEvent::Notification(message.to_string()))
            .await;
    }

    // -- commands ----------------------------------------------------------

    /// Returns `true` when the runtime should stop.
    async fn handle_command(
        &mut self,
        cmd: SessionCommand,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) -> bool {
        match cmd {
            SessionCommand::EnterQueue { topic, mode } => {
                self.close_room_signaled(room_rx, peer_rx).await;
                self.transport = None;
                self.media_failure = None;
                self.topic = topic.clone();
                self.mode = mode;
                let _ = self
                    .engine_cmd
                    .send(QueueCommand::Enter { topic, mode })
                    .await;
                self.push_status().await;
            }

            SessionCommand::LeaveQueue => {
                self.close_room_signaled(room_rx, peer_rx).await;
                self.transport = None;
                self.media_failure = None;
                let _ = self.engine_cmd.send(QueueCommand::Leave).await;
                self.push_status().await;
            }

            SessionCommand::AcceptSuggested { queue_id } => {
                let _ = self
                    .engine_cmd
                    .send(QueueCommand::AcceptSuggested { queue_id })
                    .await;
            }

            SessionCommand::RejectSuggested => {
                let _ = self.engine_cmd.send(QueueCommand::RejectSuggested).await;
            }

            SessionCommand::RejectInvite { queue_id } => {
                let _ = self
                    .engine_cmd
                    .send(QueueCommand::RejectInvite { queue_id })
                    .await;
            }

            SessionCommand::SendChat { text, reply } => {
                let sent = self.send_chat(text).await;
                let _ = reply.send(sent);
            }

            SessionCommand::Keystroke => {
                let now = Instant::now().into_std();
                if self.typing.on_keystroke(now, self.config.typing_idle) == TypingAction::SendStart
                {
                    if let Some(room) = &self.room {
                        room.session.send_packet(&ChatPacket::TypingStart).await;
                    }
                }
            }

            SessionCommand::End { requeue } => {
                self.close_room_signaled(room_rx, peer_rx).await;
                self.transport = None;
                if requeue {
                    self.enter_saved_queue().await;
                } else {
                    let _ = self.engine_cmd.send(QueueCommand::Leave).await;
                }
                self.push_status().await;
            }

            SessionCommand::RequestLocalAudio => {
                self.request_local_audio().await;
            }

            SessionCommand::SetMuted(muted) => {
                self.audio.set_muted(muted);
            }

            SessionCommand::ReportPeer { reply } => {
                let reported = self.report_peer(room_rx, peer_rx).await;
                let _ = reply.send(reported);
            }

            SessionCommand::History { reply } => {
                let messages = self
                    .room
                    .as_ref()
                    .map(|room| room.history.messages().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }

            SessionCommand::Shutdown => {
                self.close_room_signaled(room_rx, peer_rx).await;
                return true;
            }
        }
        false
    }

    async fn send_chat(&mut self, text: String) -> bool {
        let Some(room) = &self.room else {
            return false;
        };

        // Stop-typing goes out first so the receiver never shows a stale
        // indicator after the message lands.
        if self.typing.on_submit() {
            room.session.send_packet(&ChatPacket::TypingStop).await;
        }

        let message = ChatMessage::new(text);
        let sent = room
            .session
            .send_packet(&ChatPacket::Chat {
                message: message.clone(),
            })
            .await;

        if sent {
            // Optimistic append, no ack.
            if let Some(room) = &mut self.room {
                room.history.push_local(message);
            }
        }
        sent
    }

    async fn request_local_audio(&mut self) {
        if self.local_track.is_some() {
            debug!("Local audio already acquired");
            return;
        }

        let config = self.audio.config().clone();
        let encoder = match voice_encoder(&config) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(error = %e, "Opus encoder init failed");
                self.media_failure = Some(MediaFailure::Failed);
                self.push_status().await;
                return;
            }
        };

        let (frame_tx, frame_rx) = mpsc::channel(32);
        if let Err(e) = self.audio.start_capture(frame_tx) {
            warn!(error = %e, "Microphone acquisition failed");
            self.media_failure = Some(e.classify());
            self.push_status().await;
            return;
        }

        let track = new_voice_track(&config);
        tokio::spawn(pump_capture(track.clone(), frame_rx, encoder, config));
        self.local_track = Some(track.clone());
        info!("Local audio acquired");

        // Mid-call grant: the track joins the live transport and this side
        // drives the renegotiation round.
        if let Some(room) = &self.room {
            match room.session.attach_audio_track(track).await {
                Ok(Some(offer_sdp)) => {
                    if let Err(e) = room.channel.send_offer(offer_sdp).await {
                        warn!(error = %e, "Renegotiation offer send failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Track attach failed"),
            }
        }
    }

    async fn report_peer(
        &mut self,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) -> Option<UserId> {
        let (room_id, peer) = match &self.room {
            Some(room) => (room.room_id.clone(), room.peer),
            None => return None,
        };

        let reported = match self.db.file_report(&self.user_id, &room_id) {
            Ok(Some(peer)) => Some(peer),
            Ok(None) => {
                // Match row already gone; the block still applies.
                if let Err(e) = self.db.mark_blocked(&self.user_id, &peer) {
                    warn!(error = %e, "Block write failed");
                }
                Some(peer)
            }
            Err(e) => {
                warn!(error = %e, "Report failed");
                None
            }
        };

        if let Some(peer) = reported {
            self.blocklist.mark_blocked(peer);
            let _ = self.event_tx.send(SessionEvent::PeerReported(peer)).await;

            self.close_room_signaled(room_rx, peer_rx).await;
            self.transport = None;
            let _ = self.engine_cmd.send(QueueCommand::Leave).await;
            self.push_status().await;
        }
        reported
    }

    // -- queue engine events -----------------------------------------------

    async fn handle_queue_event(
        &mut self,
        event: QueueEvent,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        match event {
            QueueEvent::PhaseChanged(phase) => {
                self.queue_phase = phase;
                if phase == QueuePhase::Waiting {
                    // A fresh queue entry clears any leftover transport state.
                    self.transport = None;
                }
                self.push_status().await;
            }

            QueueEvent::Matched {
                room_id,
                peer,
                is_initiator,
                ..
            } => {
                self.queue_phase = QueuePhase::Matched;
                self.open_room(room_id, peer, is_initiator, room_rx, peer_rx)
                    .await;
            }

            QueueEvent::Suggested(suggestion) => {
                let _ = self
                    .event_tx
                    .send(SessionEvent::SuggestedMatch(suggestion))
                    .await;
            }

            QueueEvent::SuggestionUnavailable => {
                let _ = self.event_tx.send(SessionEvent::SuggestionUnavailable).await;
            }

            QueueEvent::InviteReceived { queue_id, topic } => {
                let _ = self
                    .event_tx
                    .send(SessionEvent::InviteReceived { queue_id, topic })
                    .await;
            }

            QueueEvent::Notification(message) => {
                let _ = self
                    .event_tx
                    .send(SessionEvent::Notification(message))
                    .await;
            }
        }
    }

    // -- room lifecycle ----------------------------------------------------

    async fn open_room(
        &mut self,
        room_id: RoomId,
        peer: UserId,
        is_initiator: bool,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        if self.room.is_some() {
            warn!(room = %room_id, "Match arrived while a room is active, ignoring");
            return;
        }

        info!(
            room = %room_id,
            peer = %peer.short(),
            is_initiator,
            "Opening room"
        );

        let (channel, room_events) =
            match RoomChannel::open(self.bus.clone(), room_id.clone(), self.user_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Signaling channel open failed");
                    self.media_failure = Some(MediaFailure::Failed);
                    self.push_status().await;
                    return;
                }
            };

        let (peer_tx, peer_events) = mpsc::channel(64);
        let session = match PeerSession::new(self.ice.clone(), is_initiator, peer_tx).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Transport creation failed");
                self.media_failure = Some(MediaFailure::Failed);
                self.push_status().await;
                return;
            }
        };

        // An already-acquired microphone rides the first negotiation.
        if let Some(track) = &self.local_track {
            if let Err(e) = session.attach_audio_track(track.clone()).await {
                warn!(error = %e, "Track attach failed");
            }
        }

        if is_initiator {
            match session.start_offer().await {
                Ok(sdp) => {
                    if let Err(e) = channel.send_offer(sdp).await {
                        warn!(error = %e, "Offer send failed");
                    }
                }
                Err(e) => warn!(error = %e, "Offer creation failed"),
            }
        }

        self.transport = Some(TransportState::New);
        self.typing = TypingState::new();
        self.room = Some(RoomRuntime {
            room_id,
            peer,
            channel,
            session,
            history: ChatHistory::new(),
            negotiation_deadline: Some(Instant::now() + self.config.negotiation_timeout),
        });
        *room_rx = Some(room_events);
        *peer_rx = Some(peer_events);
        self.push_status().await;
    }

    /// Send `end_session` (best-effort) and discard the room.
    async fn close_room_signaled(
        &mut self,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        if let Some(room) = &self.room {
            let _ = room.channel.send_end().await;
        }
        self.teardown_room(room_rx, peer_rx).await;
    }

    async fn teardown_room(
        &mut self,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        *room_rx = None;
        *peer_rx = None;
        self.typing = TypingState::new();
        if let Some(room) = self.room.take() {
            room.session.close().await;
            debug!(room = %room.room_id, "Room torn down");
        }
    }

    async fn enter_saved_queue(&mut self) {
        if self.topic.is_empty() {
            return;
        }
        let _ = self
            .engine_cmd
            .send(QueueCommand::Enter {
                topic: self.topic.clone(),
                mode: self.mode,
            })
            .await;
    }

    async fn on_negotiation_timeout(
        &mut self,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        warn!("Negotiation deadline expired, abandoning the room");
        self.close_room_signaled(room_rx, peer_rx).await;
        self.transport = None;
        self.notify("Connection timed out, looking for a new match")
            .await;
        self.enter_saved_queue().await;
        self.push_status().await;
    }

    async fn on_typing_deadline(&mut self) {
        let now = Instant::now().into_std();
        if self.typing.on_deadline(now) {
            if let Some(room) = &self.room {
                room.session.send_packet(&ChatPacket::TypingStop).await;
            }
        }
    }

    // -- signaling events --------------------------------------------------

    async fn handle_room_event(
        &mut self,
        event: RoomEvent,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        let Some(room) = &self.room else {
            return;
        };

        match event.signal {
            RoomSignal::Ready => {
                // The remote listener may have attached after our original
                // offer went out; re-send the cached SDP.
                if room.session.is_initiator() {
                    if let Some(sdp) = room.session.cached_offer() {
                        debug!("Late ready, re-sending cached offer");
                        if let Err(e) = room.channel.send_offer(sdp).await {
                            warn!(error = %e, "Offer re-send failed");
                        }
                    }
                }
            }

            RoomSignal::Sdp {
                kind: SdpKind::Offer,
                sdp,
            } => match room.session.handle_offer(sdp).await {
                Ok(answer) => {
                    if let Err(e) = room.channel.send_answer(answer).await {
                        warn!(error = %e, "Answer send failed");
                    }
                }
                Err(e) => warn!(error = %e, "Dropping unusable offer"),
            },

            RoomSignal::Sdp {
                kind: SdpKind::Answer,
                sdp,
            } => {
                // Stale answers are dropped inside the peer session.
                if let Err(e) = room.session.handle_answer(sdp).await {
                    warn!(error = %e, "Dropping unusable answer");
                }
            }

            RoomSignal::Ice { candidate } => {
                room.session.add_remote_candidate(candidate).await;
            }

            RoomSignal::EndSession => {
                info!(peer = %event.sender.short(), "Peer ended the session");
                let _ = self.event_tx.send(SessionEvent::PeerLeft).await;
                self.teardown_room(room_rx, peer_rx).await;
                self.transport = None;
                // Peer left; the user still wants to talk — find someone else.
                self.enter_saved_queue().await;
                self.push_status().await;
            }
        }
    }

    // -- transport events --------------------------------------------------

    async fn handle_peer_event(
        &mut self,
        event: PeerEvent,
        room_rx: &mut Option<mpsc::Receiver<RoomEvent>>,
        peer_rx: &mut Option<mpsc::Receiver<PeerEvent>>,
    ) {
        match event {
            PeerEvent::StateChanged(state) => {
                self.transport = Some(state);
                if state == TransportState::Connected {
                    if let Some(room) = &mut self.room {
                        room.negotiation_deadline = None;
                    }
                    info!("Peer transport connected");
                }
                if state.is_terminal() {
                    // Terminal for this room; no renegotiation is attempted.
                    info!(state = ?state, "Transport ended");
                    self.teardown_room(room_rx, peer_rx).await;
                }
                self.push_status().await;
            }

            PeerEvent::LocalCandidate(candidate) => {
                if let Some(room) = &self.room {
                    if let Err(e) = room.channel.send_ice(candidate).await {
                        warn!(error = %e, "Candidate send failed");
                    }
                }
            }

            PeerEvent::DataChannelOpen => {
                let _ = self.event_tx.send(SessionEvent::ChatReady).await;
            }

            PeerEvent::Packet(ChatPacket::Chat { mut message }) => {
                message.sender = aparte_shared::protocol::ChatSender::Peer;
                if let Some(room) = &mut self.room {
                    room.history.push_remote(message.clone());
                }
                let _ = self
                    .event_tx
                    .send(SessionEvent::MessageReceived(message))
                    .await;
            }

            PeerEvent::Packet(ChatPacket::TypingStart) => {
                let _ = self.event_tx.send(SessionEvent::PeerTyping(true)).await;
            }

            PeerEvent::Packet(ChatPacket::TypingStop) => {
                let _ = self.event_tx.send(SessionEvent::PeerTyping(false)).await;
            }

            PeerEvent::RemoteTrack(track) => {
                let (frame_tx, frame_rx) = mpsc::channel(32);
                tokio::spawn(pump_playback(track, frame_tx, self.audio.config().clone()));
                if let Err(e) = self.audio.start_playback(frame_rx) {
                    warn!(error = %e, "Audio playback start failed");
                    self.media_failure = Some(e.classify());
                    self.push_status().await;
                }
            }
        }
    }
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

    fn similar_vectors() -> Arc<VectorEmbedder> {
        VectorEmbedder::new(&[
            ("music", vec![1.0, 0.0]),
            ("music festivals", vec![0.9, (1.0f32 - 0.81).sqrt()]),
        ])
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    async fn start(
        user: UserId,
        db: &Arc<Database>,
        bus: &Arc<MemoryBus>,
        embedder: &Arc<VectorEmbedder>,
        config: SessionConfig,
    ) -> (Session, mpsc::Receiver<SessionEvent>) {
        Session::start(SessionDeps {
            user_id: user,
            db: db.clone(),
            bus: bus.clone(),
            embedder: embedder.clone(),
            ice_provider: None,
            blocklist_provider: None,
            config,
        })
        .await
    }

    async fn wait_for_status(session: &Session, want: SessionStatus) {
        let mut watch = session.status_watch();
        timeout(Duration::from_secs(20), async {
            loop {
                if *watch.borrow_and_update() == want {
                    return;
                }
                watch.changed().await.expect("session runtime stopped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for status {want:?}"));
    }

    async fn expect_event<F>(events: &mut mpsc::Receiver<SessionEvent>, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        timeout(Duration::from_secs(20), async {
            loop {
                let event = events.recv().await.expect("session runtime stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    #[tokio::test]
    async fn enter_then_leave_round_trip() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();
        let alice = UserId([1u8; 32]);

        let (session, _events) = start(alice, &db, &bus, &embedder, fast_config()).await;
        assert_eq!(session.status(), SessionStatus::Idle);

        session.enter_queue("music", ChatMode::Chat).await;
        wait_for_status(&session, SessionStatus::Waiting).await;
        assert!(db.active_entry_for_user(&alice).unwrap().is_some());

        session.leave_queue().await;
        wait_for_status(&session, SessionStatus::Idle).await;
        assert!(db.active_entry_for_user(&alice).unwrap().is_none());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn chat_send_fails_without_a_session() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let (session, _events) =
            start(UserId([1u8; 32]), &db, &bus, &embedder, fast_config()).await;

        // No room, no data channel: the send reports failure, nothing is
        // queued.
        assert!(!session.send_chat_message("anyone there?").await);
        assert!(session.chat_history().await.is_empty());

        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peer_end_requeues_the_other_side() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        let (a_session, mut a_events) = start(alice, &db, &bus, &embedder, fast_config()).await;
        let (b_session, _b_events) = start(bob, &db, &bus, &embedder, fast_config()).await;

        a_session.enter_queue("music", ChatMode::Chat).await;
        b_session.enter_queue("music festivals", ChatMode::Chat).await;

        // Both sides open a room and start negotiating.
        wait_for_status(&a_session, SessionStatus::Connecting).await;
        wait_for_status(&b_session, SessionStatus::Connecting).await;

        // Bob hangs up for good; Alice is sent back to look for someone
        // else without any action of her own.
        b_session.end(false).await;
        wait_for_status(&b_session, SessionStatus::Idle).await;

        expect_event(&mut a_events, |e| matches!(e, SessionEvent::PeerLeft)).await;
        wait_for_status(&a_session, SessionStatus::Waiting).await;

        a_session.shutdown().await;
        b_session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stalled_negotiation_times_out_and_requeues() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        let mut config = fast_config();
        config.negotiation_timeout = Duration::from_millis(500);

        let (a_session, mut a_events) = start(alice, &db, &bus, &embedder, config).await;

        // Bob exists only as a queue row: he will be matched but never
        // answers, so Alice's negotiation can only stall.
        let bob_embedding = Embedding::new(vec![0.9, (1.0f32 - 0.81).sqrt()]).unwrap();
        db.insert_queue_entry(bob, "music festivals", bob_embedding, ChatMode::Chat)
            .unwrap();

        a_session.enter_queue("music", ChatMode::Chat).await;
        wait_for_status(&a_session, SessionStatus::Connecting).await;

        // The deadline fires, the room is abandoned, and the engine
        // re-enters the queue on the same topic.
        expect_event(&mut a_events, |e| {
            matches!(e, SessionEvent::Notification(msg) if msg.contains("timed out"))
        })
        .await;
        wait_for_status(&a_session, SessionStatus::Waiting).await;

        a_session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn report_blocks_peer_and_prevents_rematch() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        let (a_session, _a_events) = start(alice, &db, &bus, &embedder, fast_config()).await;
        let (b_session, _b_events) = start(bob, &db, &bus, &embedder, fast_config()).await;

        a_session.enter_queue("music", ChatMode::Chat).await;
        b_session.enter_queue("music festivals", ChatMode::Chat).await;
        wait_for_status(&a_session, SessionStatus::Connecting).await;
        wait_for_status(&b_session, SessionStatus::Connecting).await;

        // Alice reports Bob: block recorded, match row gone, session over.
        let reported = a_session.report_peer().await;
        assert_eq!(reported, Some(bob));
        wait_for_status(&a_session, SessionStatus::Idle).await;
        assert!(db.block_sets(&alice).unwrap().blocked.contains(&bob));

        // Bob was pushed back into the queue by the end signal; Alice
        // re-enters too. The pair must never re-form, in either direction.
        wait_for_status(&b_session, SessionStatus::Waiting).await;
        a_session.enter_queue("music", ChatMode::Chat).await;
        wait_for_status(&a_session, SessionStatus::Waiting).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(a_session.status(), SessionStatus::Waiting);
        assert_eq!(b_session.status(), SessionStatus::Waiting);

        a_session.shutdown().await;
        b_session.shutdown().await;
    }

    // Full ICE connectivity needs a routable (non-loopback) interface for
    // host candidates, which containerized CI may not have; run with
    // `cargo test -- --ignored` on a developer machine.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a network interface that produces ICE host candidates"]
    async fn matched_peers_connect_and_exchange_chat() {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = MemoryBus::new();
        let embedder = similar_vectors();

        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        let (a_session, mut a_events) = start(alice, &db, &bus, &embedder, fast_config()).await;
        let (b_session, mut b_events) = start(bob, &db, &bus, &embedder, fast_config()).await;

        a_session.enter_queue("music", ChatMode::Chat).await;
        b_session.enter_queue("music festivals", ChatMode::Chat).await;

        wait_for_status(&a_session, SessionStatus::Connected).await;
        wait_for_status(&b_session, SessionStatus::Connected).await;
        expect_event(&mut a_events, |e| matches!(e, SessionEvent::ChatReady)).await;
        expect_event(&mut b_events, |e| matches!(e, SessionEvent::ChatReady)).await;

        // Typing indicator precedes the message; the stop arrives before
        // the chat payload.
        a_session.typing_keystroke().await;
        expect_event(&mut b_events, |e| {
            matches!(e, SessionEvent::PeerTyping(true))
        })
        .await;

        assert!(a_session.send_chat_message("hey, which festival?").await);
        expect_event(&mut b_events, |e| {
            matches!(e, SessionEvent::PeerTyping(false))
        })
        .await;
        let received = expect_event(&mut b_events, |e| {
            matches!(e, SessionEvent::MessageReceived(_))
        })
        .await;
        match received {
            SessionEvent::MessageReceived(message) => {
                assert_eq!(message.text, "hey, which festival?");
                assert_eq!(message.sender, aparte_shared::protocol::ChatSender::Peer);
            }
            _ => unreachable!(),
        }

        let history = a_session.chat_history().await;
        assert_eq!(history.len(), 1);

        a_session.shutdown().await;
        b_session.shutdown().await;
    }
}
