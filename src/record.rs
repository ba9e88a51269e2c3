//! Notification data model
//!
//! Wire-visible types shared between the store, the engine, and the
//! collaborator traits. Records are owned by the backing store; the only
//! field this subsystem ever mutates is `read`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Opaque record identifier, assigned by the backing store
pub type NotificationId = String;

/// Tenant/user pair a subscription and its records are scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub user_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.user_id)
    }
}

/// Presentation hint; no effect on sync behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Warning,
    Error,
    Info,
}

/// A single notification as held in the store and carried on the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Opaque unique identifier, immutable
    pub id: NotificationId,
    pub tenant_id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    /// Free-form display grouping (sales, hr, finance, marketing, system)
    pub category: String,
    pub title: String,
    pub message: String,
    /// The only mutable field
    pub read: bool,
    /// Creation timestamp, immutable, orders the list newest-first
    pub created_at: DateTime<Utc>,
    /// Optional navigation hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_text: Option<String>,
}

impl NotificationRecord {
    /// Scope this record belongs to
    pub fn scope(&self) -> Scope {
        Scope::new(self.tenant_id.clone(), self.user_id.clone())
    }

    /// Total order for the notification list: `created_at` descending,
    /// ties broken by `id` ascending for determinism.
    pub fn order(a: &NotificationRecord, b: &NotificationRecord) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Row-level operation carried by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedOperation {
    Insert,
    Update,
    Delete,
}

/// A change-feed event: one row-level operation and its record payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub operation: FeedOperation,
    pub record: NotificationRecord,
}
