//! Change feed client
//!
//! Maintains a live subscription to row-level events for the current
//! scope and forwards them to the reconciliation pump. Transport loss is
//! handled internally: the client re-subscribes with exponential backoff
//! and jitter, and flags the resumed session with a `Resubscribed`
//! notice — events missed while disconnected are not replayed, so the
//! consumer re-fetches a fresh snapshot to close the gap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::record::{FeedEvent, Scope};
use crate::types::Result;

/// Change feed subscription transport
///
/// Implementations deliver row-level events filtered server-side to the
/// given scope. Delivery is best-effort: events may arrive out of order
/// or more than once, and the consumer must never assume exactly-once.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: &Scope) -> Result<FeedSubscription>;
}

/// One live subscription. The stream ending (`None`) means the
/// connection was lost; dropping the subscription unsubscribes.
pub struct FeedSubscription {
    id: Uuid,
    events: mpsc::Receiver<FeedEvent>,
}

impl FeedSubscription {
    pub fn new(id: Uuid, events: mpsc::Receiver<FeedEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the transport side is gone
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }
}

/// What the feed client hands to the reconciliation pump
#[derive(Debug, Clone, PartialEq)]
pub enum FeedNotice {
    Event(FeedEvent),
    /// The feed dropped and came back; missed events are unrecoverable,
    /// re-fetch to converge
    Resubscribed,
}

/// Opaque handle for an open() call, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedHandle(Uuid);

impl FeedHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

struct ActiveFeed {
    id: Uuid,
    task: JoinHandle<()>,
}

/// Owns at most one live subscription task at a time
pub struct FeedClient {
    transport: Arc<dyn ChangeFeed>,
    config: SyncConfig,
    active: Mutex<Option<ActiveFeed>>,
}

impl FeedClient {
    pub fn new(transport: Arc<dyn ChangeFeed>, config: SyncConfig) -> Self {
        Self {
            transport,
            config,
            active: Mutex::new(None),
        }
    }

    /// Establish the feed for a scope. Idempotent: any prior subscription
    /// is closed first, so at most one is ever active per client.
    /// Transport errors never surface here — the spawned task retries
    /// until closed.
    pub fn open(&self, scope: Scope, notices: mpsc::Sender<FeedNotice>) -> FeedHandle {
        let id = Uuid::new_v4();
        let mut active = self.active.lock().unwrap();
        if let Some(prev) = active.take() {
            debug!(subscription = %prev.id, "closing superseded feed subscription");
            prev.task.abort();
        }
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.transport),
            scope,
            notices,
            self.config.clone(),
            id,
        ));
        *active = Some(ActiveFeed { id, task });
        FeedHandle(id)
    }

    /// Release the active subscription; safe to call multiple times
    pub fn close(&self) {
        if let Some(prev) = self.active.lock().unwrap().take() {
            debug!(subscription = %prev.id, "feed subscription closed");
            prev.task.abort();
        }
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_subscription(
    transport: Arc<dyn ChangeFeed>,
    scope: Scope,
    notices: mpsc::Sender<FeedNotice>,
    config: SyncConfig,
    id: Uuid,
) {
    let mut attempt: u32 = 0;
    let mut had_session = false;

    loop {
        match transport.subscribe(&scope).await {
            Ok(mut sub) => {
                attempt = 0;
                if had_session {
                    info!(scope = %scope, subscription = %id, "feed re-established");
                    if notices.send(FeedNotice::Resubscribed).await.is_err() {
                        return;
                    }
                } else {
                    debug!(scope = %scope, subscription = %id, "feed established");
                }
                had_session = true;

                while let Some(event) = sub.next().await {
                    if notices.send(FeedNotice::Event(event)).await.is_err() {
                        // pump is gone; this session is over
                        return;
                    }
                }
                warn!(scope = %scope, subscription = %id, "feed connection lost");
            }
            Err(e) => {
                warn!(scope = %scope, attempt, error = %e, "feed subscribe failed");
            }
        }

        let delay = backoff_delay(&config, attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

/// Exponential backoff from the configured floor to the cap, plus up to
/// 50% uniform jitter so a fleet of clients doesn't reconnect in step
fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let exp = config
        .reconnect_initial_ms
        .saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(config.reconnect_max_ms).max(1);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped + jitter)
}
