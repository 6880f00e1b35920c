/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/aparte/1.0.0";

/// Application name
pub const APP_NAME: &str = "Aparté";

/// Dimensionality of topic embedding vectors
pub const EMBEDDING_DIM: usize = 768;

/// Initial similarity threshold when entering the queue
pub const THRESHOLD_START: f32 = 0.80;

/// Floor the similarity threshold decays down to
pub const THRESHOLD_FLOOR: f32 = 0.65;

/// Linear threshold decay per second of waiting (start to floor in 30s)
pub const THRESHOLD_DECAY_PER_SEC: f32 = 0.005;

/// Comparison slack at the floor boundary
pub const THRESHOLD_EPSILON: f32 = 0.001;

/// Minimum similarity for a below-threshold suggested match
pub const SUGGESTION_FLOOR: f32 = 0.10;

/// Matchmaking poll interval in seconds
pub const POLL_INTERVAL_SECS: u64 = 3;

/// Queue-entry heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Queue entries without a heartbeat for this long are considered stale
pub const QUEUE_STALE_SECS: i64 = 30;

/// Match rows older than this are treated as absent
pub const MATCH_STALE_SECS: i64 = 300;

/// Maximum chat messages retained for a session (oldest dropped)
pub const CHAT_HISTORY_CAP: usize = 100;

/// Typing indicator idle timeout in seconds
pub const TYPING_IDLE_SECS: u64 = 3;

/// Seconds a room may sit in `connecting` before it is abandoned
pub const NEGOTIATION_TIMEOUT_SECS: u64 = 30;

/// Label of the single chat data channel
pub const DATA_CHANNEL_LABEL: &str = "aparte-chat";

/// Topic prefix for room-scoped signaling
pub const ROOM_TOPIC_PREFIX: &str = "room:";

/// Topic prefix for per-queue-entry consent signaling
pub const QUEUE_TOPIC_PREFIX: &str = "queue:";

/// Fallback STUN server when ICE provisioning fails
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Maximum bus message size in bytes (256 KiB, SDP payloads included)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Default QUIC listen port for the bus swarm
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Audio capture sample rate in Hz
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Audio frame duration in milliseconds
pub const AUDIO_FRAME_MS: u32 = 20;
