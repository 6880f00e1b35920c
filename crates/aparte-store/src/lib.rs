//! # aparte-store
//!
//! The shared row store behind matchmaking: queue entries, match records,
//! and block lists, backed by SQLite. The crate exposes a thread-safe
//! [`Database`] handle with typed CRUD helpers, row-level change
//! notifications (a broadcast hub consumers subscribe to), and the match
//! resolver — the one place pairings are reserved, atomically, so two
//! concurrent pollers can never double-match a queue entry.

pub mod blocklist;
pub mod database;
pub mod matches;
pub mod migrations;
pub mod models;
pub mod notify;
pub mod queue;
pub mod resolver;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use notify::QueueChange;
