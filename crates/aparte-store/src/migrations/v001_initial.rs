//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `queue_entries`, `matches`, and
//! `blocked_users`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Queue entries (one active row per user, enforced by the client's
-- delete-then-insert self-heal)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS queue_entries (
    id                 TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    user_id            TEXT NOT NULL,              -- hex-encoded 32-byte id
    topic              TEXT NOT NULL,
    embedding          BLOB NOT NULL,              -- little-endian f32 vector
    mode               TEXT NOT NULL,              -- voice | chat
    status             TEXT NOT NULL,              -- waiting | matched
    consented_queue_id TEXT,                       -- nullable, UUID of the consented peer entry
    room_id            TEXT,                       -- nullable, set once matched
    updated_at         TEXT NOT NULL               -- ISO-8601 / RFC-3339 heartbeat
);

CREATE INDEX IF NOT EXISTS idx_queue_user ON queue_entries(user_id);
CREATE INDEX IF NOT EXISTS idx_queue_status_mode ON queue_entries(status, mode);

-- ----------------------------------------------------------------
-- Matches (resolved pairings, keyed by room id)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS matches (
    room_id    TEXT PRIMARY KEY NOT NULL,
    peer_a     TEXT NOT NULL,                      -- hex id, sorted: peer_a <= peer_b
    peer_b     TEXT NOT NULL,
    topic      TEXT NOT NULL,
    mode       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Block list (directional: user_id blocked blocked_user_id)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocked_users (
    user_id         TEXT NOT NULL,
    blocked_user_id TEXT NOT NULL,
    created_at      TEXT NOT NULL,

    PRIMARY KEY (user_id, blocked_user_id)
);

CREATE INDEX IF NOT EXISTS idx_blocked_target ON blocked_users(blocked_user_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
