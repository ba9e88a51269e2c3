//! Reconciliation engine
//!
//! The single choke point through which feed events and user actions
//! reach the store. Defines the conflict policy between the two paths:
//! last-writer-wins by arrival at the engine, with one carve-out — a
//! local mark-read is never reverted by the stale echo of the mutation
//! it issued itself.
//!
//! The carve-out is implemented with a pending-read ledger: ids flipped
//! optimistically whose server echo has not been observed yet. While an
//! id is in the ledger, an incoming update carrying `read=false` is
//! treated as the echo of the pre-mutation row, not a fresh mutation:
//! its display fields are applied but `read` stays true. A `read=true`
//! update confirms the mutation and clears the ledger entry. A re-open
//! (`read=false`) for an id outside the ledger is applied as-is.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::api::NotificationApi;
use crate::record::{FeedEvent, FeedOperation, NotificationId, NotificationRecord, Scope};
use crate::store::{NotificationStore, StoreStatus};
use crate::types::Result;

/// Merges feed events and user actions into the store for one scope
pub struct Reconciler {
    store: Arc<NotificationStore>,
    api: Arc<dyn NotificationApi>,
    scope: Scope,
    /// Ids marked read locally, awaiting their server echo
    pending_reads: Mutex<HashSet<NotificationId>>,
    /// Session currency check supplied by the facade; a refetch that
    /// resolves after its session was superseded must not land
    live: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Reconciler {
    pub fn new(store: Arc<NotificationStore>, api: Arc<dyn NotificationApi>, scope: Scope) -> Self {
        Self::with_guard(store, api, scope, || true)
    }

    pub fn with_guard(
        store: Arc<NotificationStore>,
        api: Arc<dyn NotificationApi>,
        scope: Scope,
        live: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            api,
            scope,
            pending_reads: Mutex::new(HashSet::new()),
            live: Box::new(live),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// A bulk fetch landed: the server list is authoritative
    pub fn on_fetch_complete(&self, records: Vec<NotificationRecord>) {
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| self.in_scope(r))
            .collect();
        self.pending_reads.lock().unwrap().clear();
        self.store.replace_all(records);
    }

    /// Dispatch one feed event. Synchronous — applies to completion with
    /// no suspension point, and never panics: a malformed event must not
    /// stop the flow of subsequent events.
    pub fn on_feed_event(&self, event: FeedEvent) {
        if event.record.id.is_empty() {
            warn!(operation = ?event.operation, "dropping feed event without id");
            return;
        }
        if !self.in_scope(&event.record) {
            debug!(
                id = %event.record.id,
                scope = %event.record.scope(),
                "dropping feed event for inactive scope"
            );
            return;
        }

        match event.operation {
            FeedOperation::Insert => self.store.apply_insert(event.record),
            FeedOperation::Update => self.apply_update(event.record),
            FeedOperation::Delete => {
                self.pending_reads.lock().unwrap().remove(&event.record.id);
                self.store.apply_delete(&event.record.id);
            }
        }
    }

    /// Optimistically mark one record read, then acknowledge it against
    /// the backing store. A rejected acknowledgement is compensated by
    /// restoring the pre-mutation record.
    pub async fn on_mark_read(&self, id: &NotificationId) -> Result<()> {
        let Some(previous) = self.store.mark_read(id) else {
            // absent or already read; nothing to acknowledge
            return Ok(());
        };
        self.pending_reads.lock().unwrap().insert(id.clone());

        match self.api.mark_one_read(id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(id = %id, error = %e, "mark-read rejected, reverting");
                self.pending_reads.lock().unwrap().remove(id);
                self.store.apply_update(previous);
                Err(e)
            }
        }
    }

    /// Optimistically mark everything read, then acknowledge in bulk. A
    /// rejected bulk acknowledgement recovers via a full re-fetch rather
    /// than per-record compensation.
    pub async fn on_mark_all_read(&self) -> Result<()> {
        let flipped = self.store.mark_all_read();
        if flipped.is_empty() {
            return Ok(());
        }
        self.pending_reads.lock().unwrap().extend(flipped);

        match self.api.mark_all_read(&self.scope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "mark-all-read rejected, refetching");
                self.refetch().await?;
                Err(e)
            }
        }
    }

    /// Re-run the bulk fetch and replace the store with the server's
    /// truth. On failure the existing records are kept and the store
    /// surfaces an error status.
    pub async fn refetch(&self) -> Result<()> {
        match self.api.fetch_notifications(&self.scope).await {
            Ok(records) => {
                if (self.live)() {
                    self.on_fetch_complete(records);
                } else {
                    debug!(scope = %self.scope, "discarding refetch for superseded session");
                }
                Ok(())
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "refetch failed");
                if (self.live)() {
                    self.store.set_status(StoreStatus::Error);
                }
                Err(e)
            }
        }
    }

    fn in_scope(&self, record: &NotificationRecord) -> bool {
        record.tenant_id == self.scope.tenant_id && record.user_id == self.scope.user_id
    }

    /// Update-path conflict policy (see module docs)
    fn apply_update(&self, mut record: NotificationRecord) {
        let mut pending = self.pending_reads.lock().unwrap();
        if pending.contains(&record.id) {
            if record.read {
                // the echo of our own mutation; the ledger entry is done
                pending.remove(&record.id);
            } else {
                // stale pre-mutation echo: keep the local decision, take
                // the rest of the row
                debug!(id = %record.id, "suppressing stale unread echo");
                record.read = true;
            }
        }
        drop(pending);
        self.store.apply_update(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NotificationKind;
    use crate::types::HeraldError;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted backing store: records calls, optionally rejects
    /// mutations, serves a fixed fetch result.
    #[derive(Default)]
    struct ScriptedApi {
        fetch_result: Mutex<Vec<NotificationRecord>>,
        reject_mutations: AtomicBool,
        mark_one_calls: AtomicUsize,
        mark_all_calls: AtomicUsize,
    }

    #[async_trait]
    impl NotificationApi for ScriptedApi {
        async fn fetch_notifications(&self, _scope: &Scope) -> Result<Vec<NotificationRecord>> {
            Ok(self.fetch_result.lock().unwrap().clone())
        }

        async fn mark_one_read(&self, _id: &NotificationId) -> Result<()> {
            self.mark_one_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_mutations.load(Ordering::SeqCst) {
                return Err(HeraldError::Mutation("row gone".into()));
            }
            Ok(())
        }

        async fn mark_all_read(&self, _scope: &Scope) -> Result<()> {
            self.mark_all_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_mutations.load(Ordering::SeqCst) {
                return Err(HeraldError::Mutation("bulk update failed".into()));
            }
            Ok(())
        }
    }

    fn record(id: &str, ts: i64, read: bool) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            kind: NotificationKind::Info,
            category: "system".into(),
            title: format!("title {id}"),
            message: "message".into(),
            read,
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
            action_url: None,
            action_text: None,
        }
    }

    fn setup() -> (Arc<NotificationStore>, Arc<ScriptedApi>, Reconciler) {
        let store = Arc::new(NotificationStore::new());
        let api = Arc::new(ScriptedApi::default());
        let engine = Reconciler::new(store.clone(), api.clone(), Scope::new("t1", "u1"));
        (store, api, engine)
    }

    fn event(operation: FeedOperation, record: NotificationRecord) -> FeedEvent {
        FeedEvent { operation, record }
    }

    #[tokio::test]
    async fn test_mark_read_wins_over_stale_echo() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);

        engine.on_mark_read(&"a".to_string()).await.unwrap();
        assert_eq!(store.snapshot().unread_count, 0);

        // the feed echoes the pre-mutation row
        engine.on_feed_event(event(FeedOperation::Update, record("a", 100, false)));

        let snap = store.snapshot();
        assert!(snap.records[0].read);
        assert_eq!(snap.unread_count, 0);
    }

    #[tokio::test]
    async fn test_confirming_echo_clears_ledger_then_reopen_applies() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);
        engine.on_mark_read(&"a".to_string()).await.unwrap();

        // server echo confirms the mutation
        engine.on_feed_event(event(FeedOperation::Update, record("a", 100, true)));
        // an external system re-opens the notification afterwards
        engine.on_feed_event(event(FeedOperation::Update, record("a", 100, false)));

        let snap = store.snapshot();
        assert!(!snap.records[0].read);
        assert_eq!(snap.unread_count, 1);
    }

    #[tokio::test]
    async fn test_external_reopen_without_local_action_applies() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, true)]);

        engine.on_feed_event(event(FeedOperation::Update, record("a", 100, false)));

        assert_eq!(store.snapshot().unread_count, 1);
    }

    #[tokio::test]
    async fn test_stale_echo_still_carries_fresh_display_fields() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);
        engine.on_mark_read(&"a".to_string()).await.unwrap();

        let mut echo = record("a", 100, false);
        echo.title = "amended title".into();
        engine.on_feed_event(event(FeedOperation::Update, echo));

        let snap = store.snapshot();
        assert_eq!(snap.records[0].title, "amended title");
        assert!(snap.records[0].read);
    }

    #[tokio::test]
    async fn test_mark_read_rejection_compensates() {
        let (store, api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);
        api.reject_mutations.store(true, Ordering::SeqCst);

        let err = engine.on_mark_read(&"a".to_string()).await.unwrap_err();
        assert!(matches!(err, HeraldError::Mutation(_)));

        // pre-mutation record restored, ledger entry gone: a later
        // unread echo is no longer suppressed
        let snap = store.snapshot();
        assert!(!snap.records[0].read);
        assert_eq!(snap.unread_count, 1);
    }

    #[tokio::test]
    async fn test_mark_read_skips_api_when_nothing_transitions() {
        let (_store, api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, true)]);

        engine.on_mark_read(&"a".to_string()).await.unwrap();
        engine.on_mark_read(&"ghost".to_string()).await.unwrap();

        assert_eq!(api.mark_one_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mark_all_read_rejection_refetches_server_truth() {
        let (store, api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false), record("b", 200, false)]);

        // server truth: "b" stays unread
        *api.fetch_result.lock().unwrap() = vec![record("a", 100, true), record("b", 200, false)];
        api.reject_mutations.store(true, Ordering::SeqCst);

        let err = engine.on_mark_all_read().await.unwrap_err();
        assert!(matches!(err, HeraldError::Mutation(_)));

        let snap = store.snapshot();
        assert_eq!(snap.unread_count, 1);
        assert!(!snap.records.iter().find(|r| r.id == "b").unwrap().read);
    }

    #[tokio::test]
    async fn test_feed_event_for_other_scope_is_dropped() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);

        let mut foreign = record("x", 200, false);
        foreign.tenant_id = "t2".into();
        engine.on_feed_event(event(FeedOperation::Insert, foreign));

        assert_eq!(store.snapshot().records.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped_and_flow_continues() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![]);

        engine.on_feed_event(event(FeedOperation::Insert, record("", 100, false)));
        engine.on_feed_event(event(FeedOperation::Insert, record("a", 100, false)));

        let snap = store.snapshot();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.records[0].id, "a");
    }

    #[tokio::test]
    async fn test_duplicate_insert_delivery_is_idempotent() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![]);

        let e = event(FeedOperation::Insert, record("a", 100, false));
        engine.on_feed_event(e.clone());
        engine.on_feed_event(e);

        let snap = store.snapshot();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.unread_count, 1);
    }

    #[tokio::test]
    async fn test_delete_clears_ledger_entry() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);
        engine.on_mark_read(&"a".to_string()).await.unwrap();

        engine.on_feed_event(event(FeedOperation::Delete, record("a", 100, true)));
        assert!(store.snapshot().records.is_empty());

        // the id comes back later as a fresh unread row; no suppression
        engine.on_feed_event(event(FeedOperation::Insert, record("a", 300, false)));
        engine.on_feed_event(event(FeedOperation::Update, record("a", 300, false)));
        assert_eq!(store.snapshot().unread_count, 1);
    }

    #[tokio::test]
    async fn test_fetch_complete_clears_ledger() {
        let (store, _api, engine) = setup();
        engine.on_fetch_complete(vec![record("a", 100, false)]);
        engine.on_mark_read(&"a".to_string()).await.unwrap();

        // authoritative fetch says unread; ledger must not override it
        engine.on_fetch_complete(vec![record("a", 100, false)]);
        engine.on_feed_event(event(FeedOperation::Update, record("a", 100, false)));

        assert_eq!(store.snapshot().unread_count, 1);
    }
}
