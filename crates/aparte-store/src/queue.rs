use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use aparte_shared::embedding::Embedding;
use aparte_shared::types::{ChatMode, QueueId, QueueStatus, RoomId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::QueueEntry;
use crate::notify::QueueChange;

const QUEUE_COLUMNS: &str =
    "id, user_id, topic, embedding, mode, status, consented_queue_id, room_id, updated_at";

impl Database {
    /// Insert a fresh `waiting` entry for the user.
    ///
    /// Callers run [`Database::delete_queue_entries_for_user`] first (the
    /// self-heal against orphaned rows from crashed sessions); this method
    /// only creates.
    pub fn insert_queue_entry(
        &self,
        user_id: UserId,
        topic: &str,
        embedding: Embedding,
        mode: ChatMode,
    ) -> Result<QueueEntry> {
        let entry = QueueEntry {
            id: QueueId::new(),
            user_id,
            topic: topic.to_string(),
            embedding,
            mode,
            status: QueueStatus::Waiting,
            consented_queue_id: None,
            room_id: None,
            updated_at: Utc::now(),
        };

        self.conn().execute(
            "INSERT INTO queue_entries (id, user_id, topic, embedding, mode, status,
                                        consented_queue_id, room_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id.to_string(),
                entry.user_id.to_hex(),
                entry.topic,
                entry.embedding.to_blob(),
                entry.mode.as_str(),
                entry.status.as_str(),
                Option::<String>::None,
                Option::<String>::None,
                entry.updated_at.to_rfc3339(),
            ],
        )?;

        self.hub().notify(QueueChange::Updated(entry.clone()));
        Ok(entry)
    }

    pub fn get_queue_entry(&self, id: QueueId) -> Result<QueueEntry> {
        self.conn()
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.to_string()],
                row_to_queue_entry,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The user's active (`waiting` or `matched`) entry, if any.
    pub fn active_entry_for_user(&self, user_id: &UserId) -> Result<Option<QueueEntry>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_entries
                     WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT 1"
                ),
                params![user_id.to_hex()],
                row_to_queue_entry,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Delete a specific entry. Returns whether a row was removed.
    pub fn delete_queue_entry(&self, id: QueueId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM queue_entries WHERE id = ?1",
            params![id.to_string()],
        )?;

        if affected > 0 {
            self.hub().notify(QueueChange::Deleted(id));
        }
        Ok(affected > 0)
    }

    /// Delete every entry belonging to the user (self-heal on enter).
    pub fn delete_queue_entries_for_user(&self, user_id: &UserId) -> Result<u32> {
        let ids: Vec<QueueId> = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT id FROM queue_entries WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user_id.to_hex()], |row| {
                row.get::<_, String>(0)
            })?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(QueueId(Uuid::parse_str(&row?)?));
            }

            conn.execute(
                "DELETE FROM queue_entries WHERE user_id = ?1",
                params![user_id.to_hex()],
            )?;
            ids
        };

        for id in &ids {
            self.hub().notify(QueueChange::Deleted(*id));
        }
        Ok(ids.len() as u32)
    }

    /// Heartbeat: bump the entry's `updated_at`.
    pub fn touch_queue_entry(&self, id: QueueId) -> Result<()> {
        let now = Utc::now();
        let affected = self.conn().execute(
            "UPDATE queue_entries SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id.to_string()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        let entry = self.get_queue_entry(id)?;
        self.hub().notify(QueueChange::Updated(entry));
        Ok(())
    }

    /// Record (or clear) which peer entry this user has consented to.
    pub fn set_consent(&self, id: QueueId, consented: Option<QueueId>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE queue_entries SET consented_queue_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                consented.map(|q| q.to_string()),
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        let entry = self.get_queue_entry(id)?;
        self.hub().notify(QueueChange::Updated(entry));
        Ok(())
    }

    /// Evict `waiting` entries whose heartbeat is older than `horizon_secs`.
    /// Returns the number of evicted rows.
    pub fn cleanup_stale_entries(&self, horizon_secs: i64) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::seconds(horizon_secs);

        let stale: Vec<QueueId> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, updated_at FROM queue_entries WHERE status = 'waiting'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut stale = Vec::new();
            for row in rows {
                let (id_str, ts_str) = row?;
                let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)?.with_timezone(&Utc);
                if ts < cutoff {
                    stale.push(QueueId(Uuid::parse_str(&id_str)?));
                }
            }

            for id in &stale {
                conn.execute(
                    "DELETE FROM queue_entries WHERE id = ?1",
                    params![id.to_string()],
                )?;
            }
            stale
        };

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "evicted stale queue entries");
        }
        for id in &stale {
            self.hub().notify(QueueChange::Deleted(*id));
        }
        Ok(stale.len() as u32)
    }
}

pub(crate) fn row_to_queue_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let id_str: String = row.get(0)?;
    let user_hex: String = row.get(1)?;
    let topic: String = row.get(2)?;
    let embedding_blob: Vec<u8> = row.get(3)?;
    let mode_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let consented_str: Option<String> = row.get(6)?;
    let room_str: Option<String> = row.get(7)?;
    let ts_str: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let user_id = UserId::from_hex(&user_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let embedding = Embedding::from_blob(&embedding_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let mode = ChatMode::parse(&mode_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown mode: {mode_str}").into(),
        )
    })?;
    let status = QueueStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown status: {status_str}").into(),
        )
    })?;
    let consented_queue_id = match consented_str {
        Some(s) => Some(QueueId(Uuid::parse_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?)),
        None => None,
    };
    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(QueueEntry {
        id: QueueId(id),
        user_id,
        topic,
        embedding,
        mode,
        status,
        consented_queue_id,
        room_id: room_str.map(RoomId),
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding() -> Embedding {
        Embedding::new(vec![1.0, 0.0, 0.0]).unwrap()
    }

    #[test]
    fn insert_and_fetch() {
        let db = Database::in_memory().unwrap();
        let user = UserId([1u8; 32]);

        let entry = db
            .insert_queue_entry(user, "synthesizers", embedding(), ChatMode::Chat)
            .unwrap();

        let fetched = db.get_queue_entry(entry.id).unwrap();
        assert_eq!(fetched, entry);
        assert_eq!(fetched.status, QueueStatus::Waiting);
        assert!(fetched.room_id.is_none());
    }

    #[test]
    fn at_most_one_active_entry_per_user() {
        let db = Database::in_memory().unwrap();
        let user = UserId([1u8; 32]);

        // Simulate a crashed session leaving an orphan, then a clean enter.
        db.insert_queue_entry(user, "old topic", embedding(), ChatMode::Chat)
            .unwrap();
        db.delete_queue_entries_for_user(&user).unwrap();
        db.insert_queue_entry(user, "new topic", embedding(), ChatMode::Chat)
            .unwrap();

        let count: u32 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE user_id = ?1",
                params![user.to_hex()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);

        let active = db.active_entry_for_user(&user).unwrap().unwrap();
        assert_eq!(active.topic, "new topic");
    }

    #[test]
    fn delete_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let user = UserId([1u8; 32]);
        let entry = db
            .insert_queue_entry(user, "topic", embedding(), ChatMode::Voice)
            .unwrap();

        assert!(db.delete_queue_entry(entry.id).unwrap());
        assert!(!db.delete_queue_entry(entry.id).unwrap());
    }

    #[test]
    fn consent_set_and_clear() {
        let db = Database::in_memory().unwrap();
        let user = UserId([1u8; 32]);
        let entry = db
            .insert_queue_entry(user, "topic", embedding(), ChatMode::Chat)
            .unwrap();

        let target = QueueId::new();
        db.set_consent(entry.id, Some(target)).unwrap();
        assert_eq!(
            db.get_queue_entry(entry.id).unwrap().consented_queue_id,
            Some(target)
        );

        db.set_consent(entry.id, None).unwrap();
        assert_eq!(db.get_queue_entry(entry.id).unwrap().consented_queue_id, None);
    }

    #[test]
    fn change_notifications_fire() {
        let db = Database::in_memory().unwrap();
        let mut rx = db.subscribe_queue_changes();
        let user = UserId([1u8; 32]);

        let entry = db
            .insert_queue_entry(user, "topic", embedding(), ChatMode::Chat)
            .unwrap();
        db.delete_queue_entry(entry.id).unwrap();

        match rx.try_recv().unwrap() {
            QueueChange::Updated(e) => assert_eq!(e.id, entry.id),
            other => panic!("expected update, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            QueueChange::Deleted(id) => assert_eq!(id, entry.id),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn stale_entries_are_evicted() {
        let db = Database::in_memory().unwrap();
        let user = UserId([1u8; 32]);
        let entry = db
            .insert_queue_entry(user, "topic", embedding(), ChatMode::Chat)
            .unwrap();

        // Backdate the heartbeat past the horizon.
        let old = (Utc::now() - chrono::Duration::seconds(120)).to_rfc3339();
        db.conn()
            .execute(
                "UPDATE queue_entries SET updated_at = ?1 WHERE id = ?2",
                params![old, entry.id.to_string()],
            )
            .unwrap();

        let evicted = db.cleanup_stale_entries(30).unwrap();
        assert_eq!(evicted, 1);
        assert!(matches!(
            db.get_queue_entry(entry.id),
            Err(StoreError::NotFound)
        ));
    }
}
