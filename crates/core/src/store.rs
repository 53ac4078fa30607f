//! Persistent session store
//!
//! Per-user key-value records in SQLite: `user_{id}_sessions` holds the
//! working set of in-progress sessions and `user_{id}_history` the completed
//! ones. Values are JSON arrays of [`Session`]. A session identifier lives in
//! at most one of the two lists.
//!
//! Uses `spawn_blocking` for async-safe SQLite access.

use std::path::Path;
use std::sync::{Arc, Mutex};

use dispatchsim_protocol::Session;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::migration_runner::run_migrations;

fn active_key(user_id: &str) -> String {
    format!("user_{user_id}_sessions")
}

fn history_key(user_id: &str) -> String {
    format!("user_{user_id}_history")
}

/// Handle to the local session database (cheap to Clone).
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        run_migrations(&mut conn)?;
        info!(
            component = "store",
            event = "store.opened",
            path = %path.display(),
            "Session store opened"
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Insert or replace an active session.
    ///
    /// Returns `false` without writing when the session is already in history,
    /// so a late write cannot resurrect a finalized call.
    pub async fn upsert_active(&self, session: &Session) -> Result<bool, StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let user = session.trainee_id.clone();
            let history = read_list(&tx, &history_key(&user))?;
            if history.iter().any(|s| s.session_id == session.session_id) {
                debug!(
                    component = "store",
                    event = "store.active.skip_finalized",
                    session_id = %session.session_id,
                    "Ignoring write for finalized session"
                );
                return Ok(false);
            }

            let key = active_key(&user);
            let mut active = read_list(&tx, &key)?;
            match active
                .iter_mut()
                .find(|s| s.session_id == session.session_id)
            {
                Some(existing) => *existing = session,
                None => active.push(session),
            }
            write_list(&tx, &key, &active)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    pub async fn list_active(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let key = active_key(user_id);
        self.with_conn(move |conn| read_list(conn, &key)).await
    }

    pub async fn get_active(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let session_id = session_id.to_string();
        Ok(self
            .list_active(user_id)
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id))
    }

    /// Drop an active session without recording it. Returns whether it existed.
    pub async fn remove_active(&self, user_id: &str, session_id: &str) -> Result<bool, StoreError> {
        let key = active_key(user_id);
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = remove_from(&tx, &key, &session_id)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Record a completed session. First write wins: returns `false` if a
    /// record with the same identifier already exists.
    ///
    /// Any active record with the same identifier is removed in the same
    /// transaction.
    pub async fn append_history(&self, user_id: &str, session: &Session) -> Result<bool, StoreError> {
        let key = history_key(user_id);
        let active = active_key(user_id);
        let session = session.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            remove_from(&tx, &active, &session.session_id)?;
            let inserted = append_unique(&tx, &key, session)?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    pub async fn list_history(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let key = history_key(user_id);
        self.with_conn(move |conn| read_list(conn, &key)).await
    }

    pub async fn get_history(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let session_id = session_id.to_string();
        Ok(self
            .list_history(user_id)
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id))
    }

    pub async fn delete_history(&self, user_id: &str, session_id: &str) -> Result<bool, StoreError> {
        let key = history_key(user_id);
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = remove_from(&tx, &key, &session_id)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Remove every historical record for the user. Active sessions are kept.
    pub async fn clear_history(&self, user_id: &str) -> Result<(), StoreError> {
        let key = history_key(user_id);
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    /// Move a session from the active set to history in one transaction.
    ///
    /// Returns whether a new history record was written.
    pub async fn finalize(&self, session: &Session) -> Result<bool, StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let user = session.trainee_id.clone();
            let session_id = session.session_id.clone();
            let tx = conn.transaction()?;
            let removed = remove_from(&tx, &active_key(&user), &session_id)?;
            let inserted = append_unique(&tx, &history_key(&user), session)?;
            tx.commit()?;
            info!(
                component = "store",
                event = "store.session.finalized",
                session_id = %session_id,
                removed_active = removed,
                inserted_history = inserted,
                "Session moved to history"
            );
            Ok(inserted)
        })
        .await
    }

    /// Approximate on-disk size in bytes.
    pub async fn size_bytes(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
        })
        .await
    }
}

/// Unparseable values read as an empty list.
fn read_list(conn: &Connection, key: &str) -> Result<Vec<Session>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    match serde_json::from_str::<Vec<Session>>(&raw) {
        Ok(list) => Ok(list),
        Err(e) => {
            warn!(
                component = "store",
                event = "store.corrupt_value",
                key = %key,
                error = %e,
                "Stored value is unreadable, treating as empty"
            );
            Ok(Vec::new())
        }
    }
}

fn write_list(conn: &Connection, key: &str, list: &[Session]) -> Result<(), StoreError> {
    let value = serde_json::to_string(list)?;
    conn.execute(
        "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![key, value],
    )?;
    Ok(())
}

fn remove_from(conn: &Connection, key: &str, session_id: &str) -> Result<bool, StoreError> {
    let mut list = read_list(conn, key)?;
    let before = list.len();
    list.retain(|s| s.session_id != session_id);
    if list.len() == before {
        return Ok(false);
    }
    write_list(conn, key, &list)?;
    Ok(true)
}

fn append_unique(conn: &Connection, key: &str, session: Session) -> Result<bool, StoreError> {
    let mut list = read_list(conn, key)?;
    if list.iter().any(|s| s.session_id == session.session_id) {
        return Ok(false);
    }
    list.push(session);
    write_list(conn, key, &list)?;
    Ok(true)
}
