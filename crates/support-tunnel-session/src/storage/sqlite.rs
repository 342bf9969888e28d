//! SQLite session storage (feature-gated).
//!
//! Several processes may share one database file: the requester and the
//! operator can run apart and still see the same session records.

use std::{fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use support_tunnel_core::{
    session::{DeviceHint, Session, SessionId, SessionUpdate, now_millis},
    traits::{SessionFilter, SessionStore, StoreError},
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    requester_id TEXT NOT NULL,
    operator_id TEXT,
    status TEXT NOT NULL,
    device_serial TEXT,
    device_chip TEXT,
    device_firmware TEXT,
    created_at INTEGER NOT NULL,
    joined_at INTEGER,
    closed_at INTEGER,
    close_reason TEXT
)";

const SELECT: &str = "SELECT id, requester_id, operator_id, status, device_serial, device_chip, \
     device_firmware, created_at, joined_at, closed_at, close_reason FROM sessions";

/// Compare-and-set attempts before an update is reported as contended.
const UPDATE_ATTEMPTS: usize = 8;

fn internal(err: impl Display) -> StoreError {
    StoreError::Internal(err.to_string())
}

/// SQLite storage implementation.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `database_url`, e.g.
    /// `sqlite:///var/lib/support-tunnel/sessions.db`.
    ///
    /// # Errors
    /// Returns error if database connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(internal)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(internal)?;
        sqlx::query(SCHEMA).execute(&pool).await.map_err(internal)?;
        tracing::info!(database_url, "SQLite session store ready");
        Ok(Self { pool })
    }
}

fn decode(row: &SqliteRow) -> Result<Session, StoreError> {
    let id: String = row.try_get("id").map_err(internal)?;
    let status: String = row.try_get("status").map_err(internal)?;
    let close_reason: Option<String> = row.try_get("close_reason").map_err(internal)?;
    Ok(Session {
        id: SessionId::parse_str(&id).map_err(internal)?,
        requester_id: row.try_get("requester_id").map_err(internal)?,
        operator_id: row.try_get("operator_id").map_err(internal)?,
        status: status.parse().map_err(internal)?,
        device_serial: row.try_get("device_serial").map_err(internal)?,
        device_chip: row.try_get("device_chip").map_err(internal)?,
        device_firmware: row.try_get("device_firmware").map_err(internal)?,
        created_at: row.try_get("created_at").map_err(internal)?,
        joined_at: row.try_get("joined_at").map_err(internal)?,
        closed_at: row.try_get("closed_at").map_err(internal)?,
        close_reason: close_reason
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(internal)?,
    })
}

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn create(&self, requester_id: &str, device: DeviceHint) -> Result<Session, StoreError> {
        let session = Session::new(requester_id, device, now_millis());
        sqlx::query(
            "INSERT INTO sessions (id, requester_id, status, device_serial, device_chip, \
             device_firmware, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.requester_id.clone())
        .bind(session.status.to_string())
        .bind(session.device_serial.clone())
        .bind(session.device_chip.clone())
        .bind(session.device_firmware.clone())
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(session)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!("{SELECT} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(decode).transpose()
    }

    async fn update(&self, id: SessionId, update: SessionUpdate) -> Result<Session, StoreError> {
        // Status and operator identify every lifecycle state, so the guarded
        // UPDATE only lands if no other writer moved the row in between.
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
            let mut next = current.clone();
            next.apply(update.clone())?;

            let result = sqlx::query(
                "UPDATE sessions SET operator_id = ?, status = ?, joined_at = ?, closed_at = ?, \
                 close_reason = ? WHERE id = ? AND status = ? AND operator_id IS ?",
            )
            .bind(next.operator_id.clone())
            .bind(next.status.to_string())
            .bind(next.joined_at)
            .bind(next.closed_at)
            .bind(next.close_reason.map(|r| r.to_string()))
            .bind(id.to_string())
            .bind(current.status.to_string())
            .bind(current.operator_id.clone())
            .execute(&self.pool)
            .await
            .map_err(internal)?;

            if result.rows_affected() == 1 {
                return Ok(next);
            }
            tracing::debug!(session = %id, "Session changed underneath update, retrying");
        }
        Err(StoreError::Internal(format!(
            "update of session {id} kept conflicting"
        )))
    }

    async fn list_active(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let limit = filter
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(&format!(
            "{SELECT} WHERE status != 'closed' \
             AND (?1 IS NULL OR requester_id = ?1) \
             AND (?2 IS NULL OR operator_id = ?2) \
             ORDER BY created_at DESC LIMIT ?3"
        ))
        .bind(filter.requester_id)
        .bind(filter.operator_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use support_tunnel_core::session::{CloseReason, SessionStatus, TransitionError};
    use uuid::Uuid;

    use super::*;

    struct TempDb(PathBuf);

    impl TempDb {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("support-tunnel-{}.db", Uuid::new_v4())))
        }

        fn url(&self) -> String {
            format!("sqlite://{}", self.0.display())
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[tokio::test]
    async fn test_lifecycle_round_trips_through_the_file() {
        let db = TempDb::new();
        let store = SqliteStorage::new(&db.url()).await.unwrap();
        let session = store
            .create(
                "requester-1",
                DeviceHint {
                    chip: Some("ESP32-C3".into()),
                    serial: Some("24:0A:C4".into()),
                    firmware: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(store.get(session.id).await.unwrap(), Some(session.clone()));

        let joined = store
            .update(session.id, SessionUpdate::join("operator-1", 10))
            .await
            .unwrap();
        assert_eq!(joined.status, SessionStatus::Active);

        let err = store
            .update(session.id, SessionUpdate::join("operator-2", 20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError::OperatorAlreadySet(_))
        ));

        let closed = store
            .update(session.id, SessionUpdate::close(CloseReason::AdminEnded, 30))
            .await
            .unwrap();
        let fetched = store.get(session.id).await.unwrap().unwrap();
        assert_eq!(fetched, closed);
        assert_eq!(fetched.close_reason, Some(CloseReason::AdminEnded));
        assert_eq!(fetched.operator_id.as_deref(), Some("operator-1"));
    }

    #[tokio::test]
    async fn test_two_handles_share_sessions() {
        let db = TempDb::new();
        let requester = SqliteStorage::new(&db.url()).await.unwrap();
        let operator = SqliteStorage::new(&db.url()).await.unwrap();

        let session = requester.create("alice", DeviceHint::default()).await.unwrap();
        let listed = operator.list_active(SessionFilter::default()).await.unwrap();
        assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![session.id]);

        operator
            .update(session.id, SessionUpdate::join("operator-1", 5))
            .await
            .unwrap();
        let seen = requester.get(session.id).await.unwrap().unwrap();
        assert_eq!(seen.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_list_active_filters() {
        let db = TempDb::new();
        let store = SqliteStorage::new(&db.url()).await.unwrap();
        let a = store.create("alice", DeviceHint::default()).await.unwrap();
        store.create("bob", DeviceHint::default()).await.unwrap();
        let c = store.create("alice", DeviceHint::default()).await.unwrap();
        store
            .update(a.id, SessionUpdate::join("operator-1", 1))
            .await
            .unwrap();
        store
            .update(c.id, SessionUpdate::close(CloseReason::UserEnded, 2))
            .await
            .unwrap();

        assert_eq!(store.list_active(SessionFilter::default()).await.unwrap().len(), 2);
        let alice = store
            .list_active(SessionFilter {
                requester_id: Some("alice".into()),
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a.id]);

        let limited = store
            .list_active(SessionFilter {
                limit: Some(1),
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
