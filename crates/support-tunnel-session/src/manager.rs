//! Session manager for the support session lifecycle.

use std::{sync::Arc, time::Duration};

use support_tunnel_core::{
    error::TunnelError,
    session::{
        CloseReason, DeviceHint, Session, SessionId, SessionStatus, SessionUpdate, TransitionError,
        now_millis,
    },
    traits::{SessionFilter, SessionStore, StoreError},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session unavailable: {0}")]
    Unavailable(SessionId),
    #[error("Session already closed: {0}")]
    AlreadyClosed(SessionId),
}

impl From<ManagerError> for TunnelError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Unavailable(id) | ManagerError::AlreadyClosed(id) => {
                Self::Authorization(id)
            }
            other => Self::Session(other.to_string()),
        }
    }
}

/// Drives session records through waiting → active → closed.
#[derive(Clone)]
pub struct SessionManager {
    storage: Arc<dyn SessionStore>,
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(storage: Arc<dyn SessionStore>) -> Self {
        Self { storage }
    }

    /// Underlying store.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn SessionStore> {
        &self.storage
    }

    /// Open a waiting session for a requester.
    ///
    /// # Errors
    /// Returns error if the store rejects the record.
    pub async fn open(&self, requester_id: &str, device: DeviceHint) -> Result<Session, ManagerError> {
        let session = self.storage.create(requester_id, device).await?;
        tracing::info!(session = %session.id, requester = requester_id, "Session opened");
        Ok(session)
    }

    /// Fetch a session.
    ///
    /// # Errors
    /// Returns error if the session does not exist.
    pub async fn get(&self, id: SessionId) -> Result<Session, ManagerError> {
        self.storage.get(id).await?.ok_or(ManagerError::NotFound(id))
    }

    /// Join a session as its operator.
    ///
    /// Only the first join of a waiting session succeeds. The operator that
    /// holds an active session may join again without mutating it; everyone
    /// else gets [`ManagerError::Unavailable`].
    ///
    /// # Errors
    /// Returns error if the session is missing, closed, or held by another operator.
    pub async fn join(&self, id: SessionId, operator_id: &str) -> Result<Session, ManagerError> {
        let session = self.get(id).await?;

        match session.status {
            SessionStatus::Closed => Err(ManagerError::Unavailable(id)),
            SessionStatus::Active if session.operator_id.as_deref() == Some(operator_id) => {
                tracing::info!(session = %id, operator = operator_id, "Operator rejoined");
                Ok(session)
            }
            SessionStatus::Active => Err(ManagerError::Unavailable(id)),
            SessionStatus::Waiting => {
                match self
                    .storage
                    .update(id, SessionUpdate::join(operator_id, now_millis()))
                    .await
                {
                    Ok(session) => {
                        tracing::info!(session = %id, operator = operator_id, "Operator joined");
                        Ok(session)
                    }
                    Err(StoreError::Transition(e)) => {
                        tracing::info!(session = %id, operator = operator_id, "Join lost: {e}");
                        Err(ManagerError::Unavailable(id))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Close a session.
    ///
    /// # Errors
    /// Returns error if the session is missing or already closed.
    pub async fn close(&self, id: SessionId, reason: CloseReason) -> Result<Session, ManagerError> {
        match self
            .storage
            .update(id, SessionUpdate::close(reason, now_millis()))
            .await
        {
            Ok(session) => {
                tracing::info!(session = %id, %reason, "Session closed");
                Ok(session)
            }
            Err(StoreError::Transition(TransitionError::Closed(_))) => {
                Err(ManagerError::AlreadyClosed(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sessions that are not closed.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn list_active(&self, filter: SessionFilter) -> Result<Vec<Session>, ManagerError> {
        Ok(self.storage.list_active(filter).await?)
    }

    /// Close waiting sessions nobody joined within `max_waiting_age`.
    ///
    /// Returns the ids that were closed with reason `timeout`.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn reap_stale(
        &self,
        max_waiting_age: Duration,
        now: i64,
    ) -> Result<Vec<SessionId>, ManagerError> {
        let max_age = i64::try_from(max_waiting_age.as_millis()).unwrap_or(i64::MAX);
        let mut reaped = Vec::new();

        for session in self.storage.list_active(SessionFilter::default()).await? {
            if session.status != SessionStatus::Waiting
                || now.saturating_sub(session.created_at) < max_age
            {
                continue;
            }
            match self
                .storage
                .update(session.id, SessionUpdate::close(CloseReason::Timeout, now))
                .await
            {
                Ok(_) => {
                    tracing::info!(session = %session.id, "Waiting session timed out");
                    reaped.push(session.id);
                }
                // joined or closed concurrently
                Err(StoreError::Transition(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::storage::MemoryStorage;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_join_then_close() {
        let manager = manager();
        let session = manager.open("requester-1", DeviceHint::default()).await.unwrap();

        let joined = manager.join(session.id, "operator-1").await.unwrap();
        assert_eq!(joined.status, SessionStatus::Active);
        assert_eq!(joined.operator_id.as_deref(), Some("operator-1"));

        let closed = manager.close(session.id, CloseReason::AdminEnded).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::AdminEnded));

        let err = manager.close(session.id, CloseReason::UserEnded).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyClosed(_)));
        assert_eq!(
            manager.get(session.id).await.unwrap().close_reason,
            Some(CloseReason::AdminEnded)
        );
    }

    #[tokio::test]
    async fn test_second_operator_is_rejected() {
        let manager = manager();
        let session = manager.open("requester-1", DeviceHint::default()).await.unwrap();
        manager.join(session.id, "operator-1").await.unwrap();

        let err = manager.join(session.id, "operator-2").await.unwrap_err();
        assert!(matches!(err, ManagerError::Unavailable(_)));
        assert_eq!(err.to_string(), format!("Session unavailable: {}", session.id));

        // same operator may come back
        let again = manager.join(session.id, "operator-1").await.unwrap();
        assert_eq!(again.operator_id.as_deref(), Some("operator-1"));
    }

    #[tokio::test]
    async fn test_join_closed_session() {
        let manager = manager();
        let session = manager.open("requester-1", DeviceHint::default()).await.unwrap();
        manager.close(session.id, CloseReason::UserEnded).await.unwrap();

        let err = manager.join(session.id, "operator-1").await.unwrap_err();
        assert!(matches!(err, ManagerError::Unavailable(_)));
        assert!(matches!(
            TunnelError::from(err),
            TunnelError::Authorization(id) if id == session.id
        ));
    }

    #[tokio::test]
    async fn test_join_missing_session() {
        let err = manager().join(Uuid::new_v4(), "operator-1").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_have_one_winner() {
        let manager = manager();
        let session = manager.open("requester-1", DeviceHint::default()).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.join(session.id, &format!("operator-{i}")).await })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(s) => winners.push(s.operator_id.unwrap()),
                Err(ManagerError::Unavailable(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = manager.get(session.id).await.unwrap();
        assert_eq!(stored.operator_id.as_ref(), Some(&winners[0]));
    }

    #[tokio::test]
    async fn test_reap_stale_waiting_sessions() {
        let manager = manager();
        let stale = manager.open("requester-1", DeviceHint::default()).await.unwrap();
        let joined = manager.open("requester-2", DeviceHint::default()).await.unwrap();
        manager.join(joined.id, "operator-1").await.unwrap();

        let later = stale.created_at + 600_000;
        let reaped = manager
            .reap_stale(Duration::from_secs(300), later)
            .await
            .unwrap();
        assert_eq!(reaped, vec![stale.id]);

        let stale = manager.get(stale.id).await.unwrap();
        assert_eq!(stale.close_reason, Some(CloseReason::Timeout));
        assert_eq!(
            manager.get(joined.id).await.unwrap().status,
            SessionStatus::Active
        );

        let none = manager
            .reap_stale(Duration::from_secs(300), stale.created_at + 1)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
