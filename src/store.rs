//! Notification store
//!
//! In-memory authoritative state for the current tenant/user session:
//! the ordered notification list, the derived unread counter, and the
//! load lifecycle. State lives inside a `watch` channel; every mutation
//! runs under `send_modify`, so the list edit, the unread recount, and
//! the snapshot publication are one atomic step. Consumers hold
//! `watch::Receiver`s and re-render on change instead of polling.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::record::{NotificationId, NotificationRecord};

/// Load lifecycle of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// No fetch has completed for the current session
    Loading,
    /// A bulk fetch landed; the list is live
    Ready,
    /// The last fetch failed; existing records are kept as-is
    Error,
}

/// Point-in-time view of the store. Cloning is an `Arc` bump.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Arc<Vec<NotificationRecord>>,
    pub unread_count: usize,
    pub status: StoreStatus,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            records: Arc::new(Vec::new()),
            unread_count: 0,
            status: StoreStatus::Loading,
        }
    }
}

/// Owns the list and counter for the lifetime of one tenant/user session
pub struct NotificationStore {
    state: watch::Sender<Snapshot>,
}

impl NotificationStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Snapshot::empty());
        Self { state }
    }

    /// Current snapshot. O(1), never touches I/O.
    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    /// Change notifications for UI consumers
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// Replace the list wholesale after a bulk fetch. De-duplicates by id
    /// (first occurrence wins), sorts, recounts, and flips status to Ready.
    pub fn replace_all(&self, mut records: Vec<NotificationRecord>) {
        records.sort_by(NotificationRecord::order);
        records.dedup_by(|a, b| a.id == b.id);
        debug!(count = records.len(), "store replaced");
        self.state.send_modify(|snap| {
            snap.unread_count = records.iter().filter(|r| !r.read).count();
            snap.records = Arc::new(records);
            snap.status = StoreStatus::Ready;
        });
    }

    /// Insert if the id is absent; duplicate delivery is a no-op
    pub fn apply_insert(&self, record: NotificationRecord) {
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return false;
            }
            let at = records
                .binary_search_by(|r| NotificationRecord::order(r, &record))
                .unwrap_or_else(|at| at);
            records.insert(at, record);
            true
        });
    }

    /// Replace the record with a matching id; an update for an unknown id
    /// is dropped, since the record will arrive via a later fetch or insert
    pub fn apply_update(&self, record: NotificationRecord) {
        self.mutate(|records| {
            let Some(slot) = records.iter_mut().find(|r| r.id == record.id) else {
                return false;
            };
            if *slot == record {
                // agreement with local state: a confirmation, not a change
                return false;
            }
            *slot = record;
            // the order key is immutable upstream; re-sorting keeps the
            // invariant unconditional anyway
            records.sort_by(NotificationRecord::order);
            true
        });
    }

    /// Remove the record if present
    pub fn apply_delete(&self, id: &NotificationId) {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| &r.id != id);
            records.len() != before
        });
    }

    /// Flip `read` on one record, returning its pre-mutation state for
    /// compensation. `None` when the record is absent or already read.
    pub fn mark_read(&self, id: &NotificationId) -> Option<NotificationRecord> {
        let mut previous = None;
        self.mutate(|records| {
            let Some(slot) = records.iter_mut().find(|r| &r.id == id && !r.read) else {
                return false;
            };
            previous = Some(slot.clone());
            slot.read = true;
            true
        });
        previous
    }

    /// Flip `read` on every unread record in one atomic pass, returning
    /// the ids that transitioned
    pub fn mark_all_read(&self) -> Vec<NotificationId> {
        let mut flipped = Vec::new();
        self.mutate(|records| {
            for record in records.iter_mut().filter(|r| !r.read) {
                flipped.push(record.id.clone());
                record.read = true;
            }
            !flipped.is_empty()
        });
        flipped
    }

    /// Lifecycle transition only; never touches the records
    pub fn set_status(&self, status: StoreStatus) {
        self.state.send_modify(|snap| snap.status = status);
    }

    /// Drop all state for the session (teardown / identity switch). The
    /// watch channel survives so consumers keep their subscriptions.
    pub fn clear(&self) {
        self.state.send_modify(|snap| {
            snap.records = Arc::new(Vec::new());
            snap.unread_count = 0;
            snap.status = StoreStatus::Loading;
        });
    }

    /// Run one list edit atomically with the unread recount. The edit
    /// reports whether it changed anything; untouched lists are not
    /// republished, so duplicate deliveries wake no consumers.
    fn mutate(&self, edit: impl FnOnce(&mut Vec<NotificationRecord>) -> bool) {
        self.state.send_if_modified(|snap| {
            let records = Arc::make_mut(&mut snap.records);
            if !edit(records) {
                return false;
            }
            snap.unread_count = records.iter().filter(|r| !r.read).count();
            true
        });
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}
