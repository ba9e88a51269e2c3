//! Error types for herald
//!
//! One error enum for the whole crate plus a `Result` alias, re-exported
//! from the crate root.

use thiserror::Error;

/// Errors surfaced by the sync engine
#[derive(Error, Debug)]
pub enum HeraldError {
    /// Bulk fetch against the backing store failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A mark-read mutation was rejected by the backing store
    #[error("mutation rejected: {0}")]
    Mutation(String),

    /// Change feed transport failure
    #[error("feed error: {0}")]
    Feed(String),

    /// A mutation entry point was called with no active session
    #[error("notification sync not initialized")]
    NotInitialized,
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, HeraldError>;
