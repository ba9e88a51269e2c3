//! Sync facade
//!
//! The only surface UI code consumes: a snapshot getter, a change
//! subscription, the two mark-read entry points, and the identity
//! lifecycle. The facade owns the binding of tenant/user identity to the
//! feed subscription, tagging every session with a generation so that a
//! fetch or feed event that resolves after its identity was superseded
//! is discarded instead of landing in the wrong store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::NotificationApi;
use crate::config::SyncConfig;
use crate::engine::Reconciler;
use crate::feed::{ChangeFeed, FeedClient, FeedNotice};
use crate::record::{NotificationId, Scope};
use crate::store::{NotificationStore, Snapshot, StoreStatus};
use crate::types::{HeraldError, Result};

struct Session {
    generation: u64,
    engine: Arc<Reconciler>,
}

/// Entry point for UI surfaces (bell icon, dropdown panel)
///
/// One instance serves one signed-in identity at a time; call
/// [`initialize`](Self::initialize) again on tenant or user switch. The
/// store's watch channel outlives sessions, so consumers subscribe once
/// and keep receiving snapshots across identity changes.
pub struct NotificationSync {
    api: Arc<dyn NotificationApi>,
    feed: FeedClient,
    store: Arc<NotificationStore>,
    config: SyncConfig,
    generation: Arc<AtomicU64>,
    session: Mutex<Option<Session>>,
}

impl NotificationSync {
    pub fn new(
        api: Arc<dyn NotificationApi>,
        transport: Arc<dyn ChangeFeed>,
        config: SyncConfig,
    ) -> Self {
        Self {
            api,
            feed: FeedClient::new(transport, config.clone()),
            store: Arc::new(NotificationStore::new()),
            config,
            generation: Arc::new(AtomicU64::new(0)),
            session: Mutex::new(None),
        }
    }

    /// Bind the engine to an identity: bulk-fetch its notifications,
    /// then open the change feed for it. Calling this again (or with a
    /// different scope) supersedes the previous session wholesale —
    /// last-initialize-wins, and in-flight results for the old identity
    /// are discarded when they land.
    ///
    /// A failed initial fetch is returned as an error after the store
    /// surfaces [`StoreStatus::Error`]; the feed still opens so a later
    /// reconnect can converge the store without another `initialize`.
    pub async fn initialize(&self, scope: Scope) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(scope = %scope, generation, "initializing notification sync");

        let engine = {
            let check = Arc::clone(&self.generation);
            Arc::new(Reconciler::with_guard(
                Arc::clone(&self.store),
                Arc::clone(&self.api),
                scope.clone(),
                move || check.load(Ordering::SeqCst) == generation,
            ))
        };

        // supersede the previous session before the first suspension
        {
            let mut session = self.session.lock().unwrap();
            // a racing initialize/teardown may already have moved past us
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(scope = %scope, generation, "initialize superseded before binding");
                return Ok(());
            }
            if session.take().is_some() {
                self.feed.close();
            }
            self.store.clear();
            *session = Some(Session {
                generation,
                engine: Arc::clone(&engine),
            });
        }

        // bulk fetch first, then the feed; a reconnect-triggered refetch
        // covers anything pushed in between
        let fetched = self.api.fetch_notifications(&scope).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(scope = %scope, generation, "discarding superseded initialize");
            return Ok(());
        }

        let fetch_result = match fetched {
            Ok(records) => {
                engine.on_fetch_complete(records);
                Ok(())
            }
            Err(e) => {
                warn!(scope = %scope, error = %e, "initial fetch failed");
                self.store.set_status(StoreStatus::Error);
                Err(e)
            }
        };

        {
            let session = self.session.lock().unwrap();
            match session.as_ref() {
                Some(current) if current.generation == generation => {
                    let (notice_tx, notice_rx) = mpsc::channel(self.config.notice_buffer);
                    let handle = self.feed.open(scope.clone(), notice_tx);
                    debug!(scope = %scope, subscription = %handle.id(), "feed opened");
                    tokio::spawn(run_pump(
                        notice_rx,
                        engine,
                        generation,
                        Arc::clone(&self.generation),
                    ));
                }
                _ => {
                    debug!(scope = %scope, generation, "superseded before feed open");
                }
            }
        }

        fetch_result
    }

    /// Current snapshot; O(1), never triggers I/O
    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Change notifications for consumers that re-render on store changes
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.store.subscribe()
    }

    /// Mark one notification read (optimistic, compensated on rejection)
    pub async fn mark_read(&self, id: &NotificationId) -> Result<()> {
        self.current_engine()?.on_mark_read(id).await
    }

    /// Mark every notification read (optimistic, re-fetch on rejection)
    pub async fn mark_all_read(&self) -> Result<()> {
        self.current_engine()?.on_mark_all_read().await
    }

    /// Drop the current identity: close the feed, clear the store, and
    /// invalidate everything still in flight. Call on sign-out or before
    /// `initialize` for a new identity.
    pub fn teardown(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let had_session = {
            let mut session = self.session.lock().unwrap();
            let had_session = session.take().is_some();
            // closed under the session lock so a racing initialize
            // cannot slip a new subscription in between
            self.feed.close();
            self.store.clear();
            had_session
        };
        if had_session {
            info!(generation, "notification sync torn down");
        }
    }

    fn current_engine(&self) -> Result<Arc<Reconciler>> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| Arc::clone(&s.engine))
            .ok_or(HeraldError::NotInitialized)
    }
}

/// Per-session pump: moves feed notices into the engine until the
/// session is superseded or the feed closes
async fn run_pump(
    mut notices: mpsc::Receiver<FeedNotice>,
    engine: Arc<Reconciler>,
    generation: u64,
    current: Arc<AtomicU64>,
) {
    while let Some(notice) = notices.recv().await {
        if current.load(Ordering::SeqCst) != generation {
            debug!(generation, "pump superseded, dropping notices");
            return;
        }
        match notice {
            FeedNotice::Event(event) => engine.on_feed_event(event),
            FeedNotice::Resubscribed => {
                info!(scope = %engine.scope(), "feed reconnected, refetching");
                if let Err(e) = engine.refetch().await {
                    warn!(scope = %engine.scope(), error = %e, "refetch after reconnect failed");
                }
            }
        }
    }
}
