//! # aparte-media
//!
//! Media and transport for a matched room: microphone capture (cpal),
//! Opus encode/decode pumps (audiopus), the WebRTC peer-connection
//! orchestrator (webrtc-rs), the room-scoped signaling channel, and the
//! data-channel chat protocol layer.

pub mod audio;
pub mod chat;
pub mod encoder;
pub mod ice;
pub mod peer;
pub mod signaling;

pub use audio::{AudioConfig, AudioDevice, AudioError, MediaFailure};
pub use chat::{ChatHistory, TypingAction, TypingState};
pub use encoder::{new_voice_track, pump_capture, pump_playback, voice_encoder};
pub use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
pub use webrtc::track::track_remote::TrackRemote;
pub use ice::IceConfig;
pub use peer::{CandidateBuffer, PeerError, PeerEvent, PeerSession, TransportState};
pub use signaling::{RoomChannel, RoomEvent, SignalingError};
