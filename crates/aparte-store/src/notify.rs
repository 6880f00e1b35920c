//! Row-level change notifications for queue entries.
//!
//! Every committed mutation of `queue_entries` is announced on a broadcast
//! channel. Consumers filter by the ids they care about: the engine watches
//! its own row (to discover a pairing made by the other side) and the row
//! of its current suggested candidate (liveness).

use tokio::sync::broadcast;

use aparte_shared::types::QueueId;

use crate::models::QueueEntry;

/// Hub capacity. Lagged receivers drop the oldest notifications; watchers
/// re-read the row on the next poll tick anyway.
const HUB_CAPACITY: usize = 128;

/// A row-level change on the `queue_entries` table.
#[derive(Debug, Clone)]
pub enum QueueChange {
    /// The row was inserted or updated; carries the new row state.
    Updated(QueueEntry),
    /// The row was deleted.
    Deleted(QueueId),
}

pub(crate) struct ChangeHub {
    tx: broadcast::Sender<QueueChange>,
}

impl ChangeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.tx.subscribe()
    }

    /// Send a change; no subscribers is not an error.
    pub fn notify(&self, change: QueueChange) {
        let _ = self.tx.send(change);
    }
}
