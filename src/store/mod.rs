//! Session Persistence
//!
//! The core requires one thing from storage: read-modify-write atomicity per
//! session. It is expressed as an optimistic version check; a write only lands
//! if the stored version still equals the version the writer read.
//!
//! Implementations: [`MemorySessionStore`] and, with the `database` feature,
//! [`PgSessionStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::VerificationSession;

mod memory;
#[cfg(feature = "database")]
mod postgres;

pub use memory::MemorySessionStore;
#[cfg(feature = "database")]
pub use postgres::PgSessionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Schema missing: {0}")]
    SchemaMissing(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert if no session with this id exists. Returns false when one does.
    async fn insert(&self, session: &VerificationSession) -> Result<bool, StoreError>;

    async fn load(&self, id: Uuid) -> Result<Option<VerificationSession>, StoreError>;

    /// Replace the stored session iff its version equals `expected_version`.
    ///
    /// `session.version` must already be the new version. Returns false on a
    /// version conflict.
    async fn compare_and_swap(
        &self,
        session: &VerificationSession,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// Terminal sessions updated at or after `since`, most recent first
    async fn list_terminal_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerificationSession>, StoreError>;
}
