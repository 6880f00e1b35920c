//! WebRTC peer-connection orchestration for a single room.
//!
//! A [`PeerSession`] owns the transport for exactly one match. The
//! initiator creates the chat data channel and the first offer; the other
//! side answers and accepts the inbound channel by label. Remote ICE
//! candidates arriving before the remote description are buffered and
//! flushed in arrival order once it lands — candidates and SDP travel on
//! independent deliveries, so either ordering must work. The session is
//! discarded wholesale on room change; transports are never reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use aparte_shared::constants::DATA_CHANNEL_LABEL;
use aparte_shared::protocol::ChatPacket;

use crate::ice::IceConfig;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Transport state as surfaced to the session status machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Disconnected/closed/failed are terminal for a room; the orchestrator
    /// never renegotiates a dead transport.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

/// Events the transport pushes up to the session runtime.
#[derive(Debug)]
pub enum PeerEvent {
    StateChanged(TransportState),
    /// Locally gathered ICE candidate (JSON candidate-init), to be relayed
    /// over the signaling channel.
    LocalCandidate(String),
    DataChannelOpen,
    /// A decoded chat-protocol packet from the data channel.
    Packet(ChatPacket),
    /// Remote audio arrived (voice mode).
    RemoteTrack(Arc<TrackRemote>),
}

// ---------------------------------------------------------------------------
// Candidate buffering
// ---------------------------------------------------------------------------

/// Remote candidates may arrive before the remote description. They are
/// held in arrival order and flushed as one batch the moment a remote
/// description is set; candidates arriving after that apply immediately.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    ready: bool,
    pending: Vec<String>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate. Returns it back if it can be applied right away,
    /// or buffers it and returns `None`.
    pub fn offer(&mut self, candidate: String) -> Option<String> {
        if self.ready {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Mark the remote description as set and drain the backlog in
    /// original arrival order.
    pub fn mark_ready(&mut self) -> Vec<String> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Peer session
// ---------------------------------------------------------------------------

pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    is_initiator: bool,
    events_tx: mpsc::Sender<PeerEvent>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    candidates: Arc<Mutex<CandidateBuffer>>,
    /// SDP of the last local offer, re-sent when a late `ready` arrives.
    local_offer: Mutex<Option<String>>,
    /// An offer is outstanding and the next answer is applicable.
    awaiting_answer: AtomicBool,
    /// Mirrors the transport state so late track attachment knows whether
    /// renegotiation is required.
    connected: Arc<AtomicBool>,
}

impl PeerSession {
    /// Create the transport for a freshly matched room.
    ///
    /// The initiator registers the outbound data channel immediately; the
    /// passive side installs a handler that accepts the inbound channel
    /// with the expected label.
    pub async fn new(
        ice: IceConfig,
        is_initiator: bool,
        events_tx: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(ice.into_rtc()).await?);

        let session = Self {
            pc: pc.clone(),
            is_initiator,
            events_tx: events_tx.clone(),
            data_channel: Arc::new(Mutex::new(None)),
            candidates: Arc::new(Mutex::new(CandidateBuffer::new())),
            local_offer: Mutex::new(None),
            awaiting_answer: AtomicBool::new(false),
            connected: Arc::new(AtomicBool::new(false)),
        };

        // Locally gathered candidates are relayed immediately; the remote
        // side does its own buffering.
        {
            let tx = events_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_string(&init) {
                            Ok(json) => {
                                let _ = tx.send(PeerEvent::LocalCandidate(json)).await;
                            }
                            Err(e) => warn!(error = %e, "Failed to encode local candidate"),
                        },
                        Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                    }
                })
            }));
        }

        {
            let tx = events_tx.clone();
            let connected = session.connected.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let tx = tx.clone();
                let connected = connected.clone();
                let mapped = map_state(state);
                Box::pin(async move {
                    debug!(state = ?mapped, "Transport state changed");
                    connected.store(mapped == TransportState::Connected, Ordering::SeqCst);
                    let _ = tx.send(PeerEvent::StateChanged(mapped)).await;
                })
            }));
        }

        {
            let tx = events_tx.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                Box::pin(async move {
                    info!(kind = %track.kind(), "Remote track attached");
                    let _ = tx.send(PeerEvent::RemoteTrack(track)).await;
                })
            }));
        }

        if is_initiator {
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            wire_data_channel(dc, &session.data_channel, &events_tx);
        } else {
            let slot = session.data_channel.clone();
            let tx = events_tx.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        warn!(label = %dc.label(), "Ignoring unexpected data channel");
                        return;
                    }
                    wire_data_channel(dc, &slot, &tx);
                })
            }));
        }

        Ok(session)
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Produce and install the local offer; the caller relays the SDP.
    pub async fn start_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;

        *self.local_offer.lock().expect("offer lock poisoned") = Some(sdp.clone());
        self.awaiting_answer.store(true, Ordering::SeqCst);
        debug!("Local offer installed");
        Ok(sdp)
    }

    /// The cached local offer, for re-sending when a late `ready` arrives
    /// (the remote listener attached after the original send).
    pub fn cached_offer(&self) -> Option<String> {
        self.local_offer.lock().expect("offer lock poisoned").clone()
    }

    /// Apply a remote offer and produce the answer to relay back. Also the
    /// renegotiation path for a late-attached microphone track.
    pub async fn handle_offer(&self, sdp: String) -> Result<String, PeerError> {
        let desc = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(desc).await?;
        self.flush_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        let answer_sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        debug!("Remote offer answered");
        Ok(answer_sdp)
    }

    /// Apply a remote answer. Answers that arrive with no offer
    /// outstanding are stale or duplicated and are dropped.
    pub async fn handle_answer(&self, sdp: String) -> Result<(), PeerError> {
        if !self.awaiting_answer.swap(false, Ordering::SeqCst) {
            debug!("Ignoring answer with no offer outstanding");
            return Ok(());
        }

        let desc = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(desc).await?;
        self.flush_candidates().await;
        debug!("Remote answer applied");
        Ok(())
    }

    /// Apply a remote candidate now, or buffer it until a remote
    /// description exists.
    pub async fn add_remote_candidate(&self, candidate_json: String) {
        let immediate = {
            let mut buffer = self.candidates.lock().expect("candidate lock poisoned");
            buffer.offer(candidate_json)
        };

        if let Some(candidate) = immediate {
            self.apply_candidate(candidate).await;
        }
    }

    async fn flush_candidates(&self) {
        let backlog = {
            let mut buffer = self.candidates.lock().expect("candidate lock poisoned");
            buffer.mark_ready()
        };

        if backlog.is_empty() {
            return;
        }
        debug!(count = backlog.len(), "Flushing buffered candidates");
        // Tolerate individual failures without aborting the rest.
        for candidate in backlog {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate_json: String) {
        let init: RTCIceCandidateInit = match serde_json::from_str(&candidate_json) {
            Ok(init) => init,
            Err(e) => {
                warn!(error = %e, "Dropping malformed remote candidate");
                return;
            }
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!(error = %e, "Failed to apply remote candidate");
        }
    }

    /// Attach the local audio track. Once the transport is connected, an
    /// added track needs a renegotiation round; the returned SDP (if any)
    /// is the fresh offer to relay.
    pub async fn attach_audio_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<Option<String>, PeerError> {
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        if self.connected.load(Ordering::SeqCst) {
            info!("Track attached mid-call, renegotiating");
            let sdp = self.start_offer().await?;
            return Ok(Some(sdp));
        }
        Ok(None)
    }

    /// Send a chat-protocol packet over the data channel.
    ///
    /// Returns `false` when the channel is absent or not open — the caller
    /// must check before assuming delivery; nothing is queued or retried.
    pub async fn send_packet(&self, packet: &ChatPacket) -> bool {
        let channel = {
            let slot = self.data_channel.lock().expect("channel lock poisoned");
            slot.clone()
        };

        let Some(channel) = channel else {
            return false;
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return false;
        }

        let payload = match packet.to_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode chat packet");
                return false;
            }
        };

        match channel.send(&bytes::Bytes::from(payload)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Data channel send failed");
                false
            }
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Error closing peer connection");
        }
    }
}

/// Hook up data-channel callbacks and park the handle in the shared slot.
fn wire_data_channel(
    dc: Arc<RTCDataChannel>,
    slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events_tx: &mpsc::Sender<PeerEvent>,
) {
    {
        let tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                info!("Chat data channel open");
                let _ = tx.send(PeerEvent::DataChannelOpen).await;
            })
        }));
    }

    {
        let tx = events_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                match ChatPacket::from_json(&msg.data) {
                    Ok(packet) => {
                        let _ = tx.send(PeerEvent::Packet(packet)).await;
                    }
                    Err(e) => {
                        // Malformed payloads are dropped, never fatal.
                        debug!(error = %e, "Dropping malformed data channel payload");
                    }
                }
            })
        }));
    }

    dc.on_close(Box::new(|| {
        Box::pin(async {
            debug!("Chat data channel closed");
        })
    }));

    *slot.lock().expect("channel lock poisoned") = Some(dc);
}
