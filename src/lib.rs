//! Herald - notification synchronization engine
//!
//! Keeps a local notification list and unread counter consistent with a
//! hosted backend that pushes row-level change events, while the user
//! mutates the same state optimistically. Tolerates out-of-order and
//! duplicate delivery, local/remote write races, and connection loss.
//!
//! ## Components
//!
//! - **Store**: in-memory authoritative list + derived unread count,
//!   published to consumers through a watch channel
//! - **Engine**: single choke point reconciling feed events and user
//!   actions under a deterministic conflict policy
//! - **Feed**: change feed client with automatic resubscription
//! - **Sync**: the facade UI surfaces consume, owning the identity
//!   lifecycle and generation-tagged cancellation
//! - **Memory**: in-process backend implementing both collaborator
//!   traits, for single-process deployments and tests

pub mod api;
pub mod config;
pub mod engine;
pub mod feed;
pub mod memory;
pub mod record;
pub mod store;
pub mod sync;
pub mod types;

pub use api::NotificationApi;
pub use config::SyncConfig;
pub use feed::{ChangeFeed, FeedClient, FeedNotice, FeedSubscription};
pub use record::{FeedEvent, FeedOperation, NotificationId, NotificationKind, NotificationRecord, Scope};
pub use store::{NotificationStore, Snapshot, StoreStatus};
pub use sync::NotificationSync;
pub use types::{HeraldError, Result};
