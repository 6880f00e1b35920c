use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use aparte_shared::types::{ChatMode, RoomId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::MatchRecord;

impl Database {
    pub fn insert_match(&self, record: &MatchRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO matches (room_id, peer_a, peer_b, topic, mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.room_id.0,
                record.peer_a.to_hex(),
                record.peer_b.to_hex(),
                record.topic,
                record.mode.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_match(&self, room_id: &RoomId) -> Result<Option<MatchRecord>> {
        self.conn()
            .query_row(
                "SELECT room_id, peer_a, peer_b, topic, mode, created_at
                 FROM matches WHERE room_id = ?1",
                params![room_id.0],
                row_to_match,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Like [`Database::get_match`], but a row older than `max_age_secs`
    /// is treated as absent.
    pub fn get_match_fresh(
        &self,
        room_id: &RoomId,
        max_age_secs: i64,
    ) -> Result<Option<MatchRecord>> {
        let record = self.get_match(room_id)?;
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs);
        Ok(record.filter(|r| r.created_at >= cutoff))
    }

    /// Remove a match row (cleanup or moderation). Either participant may
    /// call this; deleting an already-deleted row is a no-op.
    pub fn delete_match(&self, room_id: &RoomId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM matches WHERE room_id = ?1", params![room_id.0])?;
        Ok(affected > 0)
    }

    /// Delete match rows older than `max_age_secs`. Returns the count.
    pub fn cleanup_stale_matches(&self, max_age_secs: i64) -> Result<u32> {
        let rooms: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT room_id, created_at FROM matches")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs);
            let mut stale = Vec::new();
            for row in rows {
                let (room, ts_str) = row?;
                let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)?.with_timezone(&Utc);
                if ts < cutoff {
                    stale.push(room);
                }
            }

            for room in &stale {
                conn.execute("DELETE FROM matches WHERE room_id = ?1", params![room])?;
            }
            stale
        };

        if !rooms.is_empty() {
            tracing::info!(count = rooms.len(), "evicted stale match rows");
        }
        Ok(rooms.len() as u32)
    }
}

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRecord> {
    let room_id: String = row.get(0)?;
    let peer_a_hex: String = row.get(1)?;
    let peer_b_hex: String = row.get(2)?;
    let topic: String = row.get(3)?;
    let mode_str: String = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let peer_a = UserId::from_hex(&peer_a_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let peer_b = UserId::from_hex(&peer_b_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let mode = ChatMode::parse(&mode_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown mode: {mode_str}").into(),
        )
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(MatchRecord {
        room_id: RoomId(room_id),
        peer_a,
        peer_b,
        topic,
        mode,
        created_at,
    })
}
