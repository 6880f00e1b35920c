//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] behind a mutex
//! and guarantees that migrations are run before any other operation. One
//! handle is shared by every session actor touching the queue, so the lock
//! lives inside the handle; the resolver relies on this serialization for
//! its pairing atomicity.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::notify::{ChangeHub, QueueChange};

/// Wrapper around a [`rusqlite::Connection`] plus the row-change hub.
pub struct Database {
    conn: Mutex<Connection>,
    changes: ChangeHub,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/aparte/aparte.db`
    /// - macOS:   `~/Library/Application Support/com.aparte.aparte/aparte.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\aparte\aparte\data\aparte.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "aparte", "aparte").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("aparte.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            changes: ChangeHub::new(),
        })
    }

    /// Open an in-memory database. Used by tests and by single-host
    /// deployments where both parties share a process.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            changes: ChangeHub::new(),
        })
    }

    /// Lock the underlying connection.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn().path().map(PathBuf::from)
    }

    pub(crate) fn hub(&self) -> &ChangeHub {
        &self.changes
    }

    /// Subscribe to row-level queue change notifications.
    pub fn subscribe_queue_changes(&self) -> tokio::sync::broadcast::Receiver<QueueChange> {
        self.changes.subscribe()
    }
}
