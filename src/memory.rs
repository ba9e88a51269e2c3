//! In-process backend
//!
//! Implements both collaborator contracts — the bulk fetch/mutation API
//! and the change feed — against process-local state. Serves the same
//! role the in-process worker pool serves next to NATS: single-process
//! deployments and tests run against this, hosted deployments swap in a
//! real backend behind the same traits.
//!
//! Server-side writes (`push`, `revise`, `remove`) broadcast feed events
//! to every live subscriber of the matching scope. The two mark-read
//! mutations broadcast the same update echoes a hosted change feed
//! produces, which is precisely the traffic the reconciliation policy
//! exists to absorb.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::NotificationApi;
use crate::feed::{ChangeFeed, FeedSubscription};
use crate::record::{FeedEvent, FeedOperation, NotificationId, NotificationRecord, Scope};
use crate::types::{HeraldError, Result};

/// Default per-subscriber event buffer
const DEFAULT_EVENT_BUFFER: usize = 64;

struct Subscriber {
    scope: Scope,
    sender: mpsc::Sender<FeedEvent>,
}

/// Process-local notification backend with a live change feed
pub struct MemoryBackend {
    rows: Mutex<Vec<NotificationRecord>>,
    subscribers: DashMap<Uuid, Subscriber>,
    event_buffer: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            subscribers: DashMap::new(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Insert a row and broadcast the insert to subscribers
    pub fn push(&self, record: NotificationRecord) {
        self.rows.lock().unwrap().push(record.clone());
        self.broadcast(FeedOperation::Insert, record);
    }

    /// Overwrite a row by id and broadcast the update. Unknown ids are
    /// ignored — the feed only ever carries rows the store owns.
    pub fn revise(&self, record: NotificationRecord) {
        {
            let mut rows = self.rows.lock().unwrap();
            let Some(slot) = rows.iter_mut().find(|r| r.id == record.id) else {
                return;
            };
            *slot = record.clone();
        }
        self.broadcast(FeedOperation::Update, record);
    }

    /// Delete a row by id and broadcast the removal
    pub fn remove(&self, id: &NotificationId) {
        let removed = {
            let mut rows = self.rows.lock().unwrap();
            let Some(at) = rows.iter().position(|r| &r.id == id) else {
                return;
            };
            rows.remove(at)
        };
        self.broadcast(FeedOperation::Delete, removed);
    }

    /// Sever every live subscription, as a transport outage would.
    /// Clients observe their event stream ending and resubscribe.
    pub fn disconnect_all(&self) {
        let count = self.subscribers.len();
        self.subscribers.clear();
        debug!(count, "dropped all feed subscribers");
    }

    /// Number of live feed subscriptions. Entries whose consumer is
    /// gone are pruned here as well as at broadcast time.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.retain(|_, s| !s.sender.is_closed());
        self.subscribers.len()
    }

    fn broadcast(&self, operation: FeedOperation, record: NotificationRecord) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.scope.tenant_id != record.tenant_id || entry.scope.user_id != record.user_id {
                continue;
            }
            let event = FeedEvent {
                operation,
                record: record.clone(),
            };
            match entry.sender.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // best-effort delivery; the consumer re-fetches on
                    // reconnect anyway
                    warn!(subscription = %entry.key(), "feed buffer full, dropping event");
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
            debug!(subscription = %id, "pruned closed feed subscriber");
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationApi for MemoryBackend {
    async fn fetch_notifications(&self, scope: &Scope) -> Result<Vec<NotificationRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| r.tenant_id == scope.tenant_id && r.user_id == scope.user_id)
            .cloned()
            .collect())
    }

    async fn mark_one_read(&self, id: &NotificationId) -> Result<()> {
        let echo = {
            let mut rows = self.rows.lock().unwrap();
            let Some(slot) = rows.iter_mut().find(|r| &r.id == id) else {
                return Err(HeraldError::Mutation(format!("no such notification {id}")));
            };
            if slot.read {
                return Ok(());
            }
            slot.read = true;
            slot.clone()
        };
        self.broadcast(FeedOperation::Update, echo);
        Ok(())
    }

    async fn mark_all_read(&self, scope: &Scope) -> Result<()> {
        let echoes: Vec<_> = {
            let mut rows = self.rows.lock().unwrap();
            rows.iter_mut()
                .filter(|r| {
                    r.tenant_id == scope.tenant_id && r.user_id == scope.user_id && !r.read
                })
                .map(|r| {
                    r.read = true;
                    r.clone()
                })
                .collect()
        };
        for echo in echoes {
            self.broadcast(FeedOperation::Update, echo);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, scope: &Scope) -> Result<FeedSubscription> {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.event_buffer);
        self.subscribers.insert(
            id,
            Subscriber {
                scope: scope.clone(),
                sender,
            },
        );
        debug!(subscription = %id, scope = %scope, "feed subscriber registered");
        Ok(FeedSubscription::new(id, receiver))
    }
}
