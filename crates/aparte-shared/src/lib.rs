//! # aparte-shared
//!
//! Types, wire protocol, and constants shared across the Aparté workspace:
//! identities and room/queue ids, topic-embedding vector math, the signaling
//! and consent envelopes carried over the realtime bus, and the JSON chat
//! packets carried over the peer data channel.

pub mod constants;
pub mod embedding;
pub mod error;
pub mod protocol;
pub mod types;

pub use embedding::Embedding;
pub use error::AparteError;
pub use types::{ChatMode, QueueId, RoomId, UserId};
