//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use support_tunnel_core::{
    session::{DeviceHint, Session, SessionId, SessionStatus, SessionUpdate, now_millis},
    traits::{SessionFilter, SessionStore, StoreError},
};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn create(&self, requester_id: &str, device: DeviceHint) -> Result<Session, StoreError> {
        let session = Session::new(requester_id, device, now_millis());

        self.sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(session.id, session.clone());

        Ok(session)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn update(&self, id: SessionId, update: SessionUpdate) -> Result<Session, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.apply(update)?;

        Ok(session.clone())
    }

    async fn list_active(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| {
                if s.status == SessionStatus::Closed {
                    return false;
                }
                if let Some(ref requester_id) = filter.requester_id {
                    if s.requester_id != *requester_id {
                        return false;
                    }
                }
                if let Some(ref operator_id) = filter.operator_id {
                    if s.operator_id.as_ref() != Some(operator_id) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        // Sort by created_at descending
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}
