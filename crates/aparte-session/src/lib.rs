//! # aparte-session
//!
//! The matchmaking engine and the session façade.
//!
//! [`queue`] runs the queue lifecycle: the decaying-threshold poll loop,
//! heartbeats, and the mutual-consent handshake for below-threshold
//! suggestions. [`session`] composes the engine with the signaling
//! channel, the WebRTC orchestrator, and the media device into one
//! programmatic API with an observable status and an event stream.
//! External collaborators (embedding service, ICE provisioning, block
//! lists) are reached through the seams in [`embedding`] and
//! [`providers`].

pub mod config;
pub mod embedding;
pub mod events;
pub mod providers;
pub mod queue;
pub mod session;
pub mod status;

pub use config::SessionConfig;
pub use embedding::{EmbedError, Embedder, HttpEmbedder};
pub use events::SessionEvent;
pub use providers::{
    BlockListProvider, HttpBlockListProvider, HttpIceProvider, IceServerProvider, ProviderError,
    SharedBlockList, StoreBlockListProvider,
};
pub use queue::{spawn_queue_engine, EngineDeps, QueueCommand, QueueEvent};
pub use session::{Session, SessionDeps};
pub use status::{derive_status, QueuePhase, SessionStatus};
