//! Backing store capability contract
//!
//! The relational backend is an external collaborator; the engine only
//! sees this trait. Both mutations are idempotent from the caller's
//! perspective, so retrying a rejected call is always safe.

use async_trait::async_trait;

use crate::record::{NotificationId, NotificationRecord, Scope};
use crate::types::Result;

/// Bulk fetch and acknowledgement API over the notification resource
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// Fetch every notification for the scope, unordered
    async fn fetch_notifications(&self, scope: &Scope) -> Result<Vec<NotificationRecord>>;

    /// Unread count for the scope. Derivable from the fetched list, so
    /// backends that expose one logical call can rely on this default.
    async fn fetch_unread_count(&self, scope: &Scope) -> Result<usize> {
        let records = self.fetch_notifications(scope).await?;
        Ok(records.iter().filter(|r| !r.read).count())
    }

    /// Mark a single notification read. Idempotent.
    async fn mark_one_read(&self, id: &NotificationId) -> Result<()>;

    /// Mark every notification in the scope read. Idempotent.
    async fn mark_all_read(&self, scope: &Scope) -> Result<()>;
}
