//! The match resolver: atomic pairing reservation and suggestion scoring.
//!
//! All similarity math runs here over the decoded embedding blobs — the
//! candidate set is small (waiting rows of one mode) and SQLite has no
//! vector operations. Every mutation path runs inside one transaction
//! under the store lock, which is what guarantees at most one successful
//! pairing per queue entry: a second poller finds the row already
//! `matched` and gets nothing.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use tracing::{debug, info};

use aparte_shared::embedding::Embedding;
use aparte_shared::types::{ChatMode, QueueId, QueueStatus, RoomId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{MatchOutcome, MatchRecord, PairOutcome, QueueEntry, Suggestion};
use crate::notify::QueueChange;
use crate::queue::row_to_queue_entry;

const QUEUE_COLUMNS: &str =
    "id, user_id, topic, embedding, mode, status, consented_queue_id, room_id, updated_at";

impl Database {
    /// Find and reserve the best `waiting` candidate with cosine similarity
    /// at or above `threshold`, excluding `excluded` users (the combined
    /// block list, both directions).
    ///
    /// On success both queue rows transition to `matched` with a shared
    /// room id and a match row is inserted; the passive side learns about
    /// the pairing through its row-update notification.
    pub fn find_match(
        &self,
        user_id: &UserId,
        embedding: &Embedding,
        mode: ChatMode,
        excluded: &HashSet<UserId>,
        threshold: f32,
    ) -> Result<Option<MatchOutcome>> {
        let (record, own, candidate) = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;

            let Some(own) = entry_for_user(&tx, user_id)? else {
                return Ok(None);
            };
            if own.status != QueueStatus::Waiting {
                return Ok(None);
            }

            let Some(candidate) =
                best_candidate(&tx, user_id, embedding, mode, excluded, threshold)?
            else {
                return Ok(None);
            };

            let record = reserve_pair(&tx, &own, &candidate)?;
            tx.commit()?;
            (record, own, candidate)
        };

        info!(
            user = %user_id.short(),
            peer = %candidate.user_id.short(),
            room = %record.room_id,
            "firm match reserved"
        );

        self.notify_paired(&own, &candidate, &record.room_id);
        Ok(Some(MatchOutcome {
            room_id: record.room_id,
            peer_user_id: candidate.user_id,
        }))
    }

    /// Best-effort candidate list regardless of the acceptance threshold,
    /// sorted descending by similarity. `peer_consented_to_me` reports
    /// whether each candidate has already consented toward `own_queue_id`.
    pub fn suggest_matches(
        &self,
        user_id: &UserId,
        embedding: &Embedding,
        mode: ChatMode,
        own_queue_id: QueueId,
        excluded: &HashSet<UserId>,
    ) -> Result<Vec<Suggestion>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_entries
             WHERE status = 'waiting' AND mode = ?1 AND user_id != ?2"
        ))?;
        let rows = stmt.query_map(
            params![mode.as_str(), user_id.to_hex()],
            row_to_queue_entry,
        )?;

        let mut suggestions = Vec::new();
        for row in rows {
            let entry = row?;
            if excluded.contains(&entry.user_id) {
                continue;
            }
            if is_blocked_pair(&conn, user_id, &entry.user_id)? {
                continue;
            }
            let similarity = embedding.cosine_similarity(&entry.embedding);
            suggestions.push(Suggestion {
                queue_id: entry.id,
                topic: entry.topic,
                similarity,
                peer_consented_to_me: entry.consented_queue_id == Some(own_queue_id),
            });
        }

        suggestions.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(
            user = %user_id.short(),
            count = suggestions.len(),
            "scored suggestion candidates"
        );
        Ok(suggestions)
    }

    /// Pair two mutually-consenting entries.
    ///
    /// Safe under the accept/accept race: if the other side already paired
    /// us, the existing room is returned and the caller takes the passive
    /// role. If the target vanished or is no longer waiting, the consent
    /// is void and `CandidateGone` is returned.
    pub fn pair_consenting(
        &self,
        own_queue_id: QueueId,
        target_queue_id: QueueId,
    ) -> Result<PairOutcome> {
        let (outcome, own, candidate, room_id) = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;

            let Some(own) = entry_by_id(&tx, own_queue_id)? else {
                return Err(StoreError::NotFound);
            };

            if own.status == QueueStatus::Matched {
                let Some(room_id) = own.room_id.clone() else {
                    return Err(StoreError::NotFound);
                };
                let peer = match_peer(&tx, &room_id, &own.user_id)?;
                return Ok(PairOutcome::Existing(MatchOutcome {
                    room_id,
                    peer_user_id: peer,
                }));
            }

            let Some(candidate) = entry_by_id(&tx, target_queue_id)? else {
                return Err(StoreError::CandidateGone);
            };
            if candidate.status != QueueStatus::Waiting {
                return Err(StoreError::CandidateGone);
            }
            // A report filed mid-handshake voids the consent.
            if is_blocked_pair(&tx, &own.user_id, &candidate.user_id)? {
                return Err(StoreError::CandidateGone);
            }

            let record = reserve_pair(&tx, &own, &candidate)?;
            tx.commit()?;

            let room_id = record.room_id.clone();
            (
                PairOutcome::Created(MatchOutcome {
                    room_id: record.room_id,
                    peer_user_id: candidate.user_id,
                }),
                own,
                candidate,
                room_id,
            )
        };

        info!(
            user = %own.user_id.short(),
            peer = %candidate.user_id.short(),
            room = %room_id,
            "consent pairing created"
        );

        self.notify_paired(&own, &candidate, &room_id);
        Ok(outcome)
    }

    fn notify_paired(&self, own: &QueueEntry, candidate: &QueueEntry, room_id: &RoomId) {
        for entry in [own, candidate] {
            let mut updated = entry.clone();
            updated.status = QueueStatus::Matched;
            updated.room_id = Some(room_id.clone());
            updated.updated_at = Utc::now();
            self.hub().notify(QueueChange::Updated(updated));
        }
    }
}

fn entry_for_user(tx: &Transaction<'_>, user_id: &UserId) -> Result<Option<QueueEntry>> {
    use rusqlite::OptionalExtension;
    tx.query_row(
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

fn entry_by_id(tx: &Transaction<'_>, id: QueueId) -> Result<Option<QueueEntry>> {
    use rusqlite::OptionalExtension;
    tx.query_row(
        &format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE id = ?1"),
        params![id.to_string()],
        row_to_queue_entry,
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

fn best_candidate(
    tx: &Transaction<'_>,
    user_id: &UserId,
    embedding: &Embedding,
    mode: ChatMode,
    excluded: &HashSet<UserId>,
    threshold: f32,
) -> Result<Option<QueueEntry>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {QUEUE_COLUMNS} FROM queue_entries
         WHERE status = 'waiting' AND mode = ?1 AND user_id != ?2"
    ))?;
    let rows = stmt.query_map(
        params![mode.as_str(), user_id.to_hex()],
        row_to_queue_entry,
    )?;

    let mut best: Option<(f32, QueueEntry)> = None;
    for row in rows {
        let entry = row?;
        if excluded.contains(&entry.user_id) {
            continue;
        }
        if is_blocked_pair(tx, user_id, &entry.user_id)? {
            continue;
        }
        let similarity = embedding.cosine_similarity(&entry.embedding);
        if similarity < threshold {
            continue;
        }
        match &best {
            Some((top, _)) if *top >= similarity => {}
            _ => best = Some((similarity, entry)),
        }
    }

    Ok(best.map(|(_, entry)| entry))
}

/// Mark both entries matched with a freshly minted room id and record the
/// match row. Runs inside the caller's transaction.
fn reserve_pair(
    tx: &Transaction<'_>,
    own: &QueueEntry,
    candidate: &QueueEntry,
) -> Result<MatchRecord> {
    let room_id = RoomId::mint(&own.user_id, &candidate.user_id, own.mode);
    let now = Utc::now();

    for entry in [own, candidate] {
        tx.execute(
            "UPDATE queue_entries SET status = 'matched', room_id = ?1, updated_at = ?2
             WHERE id = ?3",
            params![room_id.0, now.to_rfc3339(), entry.id.to_string()],
        )?;
    }

    let (peer_a, peer_b) = if own.user_id <= candidate.user_id {
        (own.user_id, candidate.user_id)
    } else {
        (candidate.user_id, own.user_id)
    };

    let record = MatchRecord {
        room_id,
        peer_a,
        peer_b,
        topic: own.topic.clone(),
        mode: own.mode,
        created_at: now,
    };

    tx.execute(
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

    Ok(record)
}

/// Whether either user has blocked the other. Enforced store-side on every
/// resolver path, independent of the caller-supplied exclusion set: a user
/// must never be paired with someone they blocked or who blocked them.
fn is_blocked_pair(conn: &Connection, a: &UserId, b: &UserId) -> Result<bool> {
    let blocked: bool = conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM blocked_users
             WHERE (user_id = ?1 AND blocked_user_id = ?2)
                OR (user_id = ?2 AND blocked_user_id = ?1)
         )",
        params![a.to_hex(), b.to_hex()],
        |row| row.get(0),
    )?;
    Ok(blocked)
}

fn match_peer(tx: &Transaction<'_>, room_id: &RoomId, me: &UserId) -> Result<UserId> {
    let (a_hex, b_hex): (String, String) = tx
        .query_row(
            "SELECT peer_a, peer_b FROM matches WHERE room_id = ?1",
            params![room_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })?;

    let a = UserId::from_hex(&a_hex)?;
    let b = UserId::from_hex(&b_hex)?;
    if &a == me {
        Ok(b)
    } else {
        Ok(a)
    }
}
