use chrono::Utc;
use rusqlite::params;
use tracing::info;

use aparte_shared::types::{RoomId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::BlockSets;

impl Database {
    /// Record that `user_id` blocked `blocked_user_id`. Idempotent.
    pub fn mark_blocked(&self, user_id: &UserId, blocked_user_id: &UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blocked_users (user_id, blocked_user_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                user_id.to_hex(),
                blocked_user_id.to_hex(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Both directions of a user's block relationships.
    pub fn block_sets(&self, user_id: &UserId) -> Result<BlockSets> {
        let conn = self.conn();
        let mut sets = BlockSets::default();

        let mut stmt =
            conn.prepare("SELECT blocked_user_id FROM blocked_users WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id.to_hex()], |row| row.get::<_, String>(0))?;
        for row in rows {
            if let Ok(id) = UserId::from_hex(&row?) {
                sets.blocked.insert(id);
            }
        }

        let mut stmt =
            conn.prepare("SELECT user_id FROM blocked_users WHERE blocked_user_id = ?1")?;
        let rows = stmt.query_map(params![user_id.to_hex()], |row| row.get::<_, String>(0))?;
        for row in rows {
            if let Ok(id) = UserId::from_hex(&row?) {
                sets.blocked_by.insert(id);
            }
        }

        Ok(sets)
    }

    /// Apply the store-side effects of a moderation report filed against
    /// the reporter's current peer: block the peer and delete the match
    /// row. Returns the blocked peer, or `None` if the match row was
    /// already gone. Report body storage and admin review live outside
    /// this workspace.
    pub fn file_report(&self, reporter: &UserId, room_id: &RoomId) -> Result<Option<UserId>> {
        let Some(record) = self.get_match(room_id)? else {
            return Ok(None);
        };
        let Some(peer) = record.other_peer(reporter) else {
            return Ok(None);
        };

        self.mark_blocked(reporter, &peer)?;
        self.delete_match(room_id)?;

        info!(
            reporter = %reporter.short(),
            reported = %peer.short(),
            room = %room_id,
            "report filed: peer blocked, match row removed"
        );
        Ok(Some(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchRecord;
    use aparte_shared::types::ChatMode;

    #[test]
    fn block_sets_cover_both_directions() {
        let db = Database::in_memory().unwrap();
        let u = UserId([1u8; 32]);
        let v = UserId([2u8; 32]);
        let w = UserId([3u8; 32]);

        db.mark_blocked(&u, &v).unwrap();
        db.mark_blocked(&w, &u).unwrap();
        // Duplicate block is a no-op.
        db.mark_blocked(&u, &v).unwrap();

        let sets = db.block_sets(&u).unwrap();
        assert!(sets.blocked.contains(&v));
        assert!(sets.blocked_by.contains(&w));

        let combined = sets.combined();
        assert!(combined.contains(&v));
        assert!(combined.contains(&w));
        assert_eq!(combined.len(), 2);
    }

    #[test]
    fn report_blocks_peer_and_deletes_match() {
        let db = Database::in_memory().unwrap();
        let reporter = UserId([1u8; 32]);
        let peer = UserId([2u8; 32]);

        let record = MatchRecord {
            room_id: RoomId::mint(&reporter, &peer, ChatMode::Chat),
            peer_a: reporter,
            peer_b: peer,
            topic: "anything".to_string(),
            mode: ChatMode::Chat,
            created_at: Utc::now(),
        };
        db.insert_match(&record).unwrap();

        let blocked = db.file_report(&reporter, &record.room_id).unwrap();
        assert_eq!(blocked, Some(peer));
        assert!(db.get_match(&record.room_id).unwrap().is_none());
        assert!(db.block_sets(&reporter).unwrap().blocked.contains(&peer));

        // Report on an already-removed match is a quiet no-op.
        assert_eq!(db.file_report(&reporter, &record.room_id).unwrap(), None);
    }
}
