use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::types::VerificationSession;

/// In-memory session store. The write lock makes each CAS atomic.
#[derive(Default, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, VerificationSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Overwrite without a version check. Used to simulate partial writes.
    pub async fn force_put(&self, session: VerificationSession) {
        self.sessions.write().await.insert(session.id, session);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &VerificationSession) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Ok(false);
        }
        sessions.insert(session.id, session.clone());
        Ok(true)
    }

    async fn load(&self, id: Uuid) -> Result<Option<VerificationSession>, StoreError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        session: &VerificationSession,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if current.version == expected_version => {
                sessions.insert(session.id, session.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::Backend(format!(
                "session {} does not exist",
                session.id
            ))),
        }
    }

    async fn list_terminal_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<VerificationSession>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut found: Vec<VerificationSession> = sessions
            .values()
            .filter(|s| s.is_terminal() && s.updated_at >= since)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        found.truncate(limit);
        Ok(found)
    }
}
