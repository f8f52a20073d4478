//! SQLite-backed [`Store`] implementation.
//!
//! A single shared connection behind a mutex; every trait method hops to
//! the blocking thread pool via `spawn_blocking` so async callers never
//! stall a runtime worker on SQLite I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::models::{FriendEdge, NewMessage, StoredMessage, UserProfile};
use crate::store::Store;

/// SQLite store handle. Cheap to clone via `Arc<dyn Store>`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, running migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening relay database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// An isolated in-memory database. Used by tests and tooling.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get::<_, i64>(0)? as u64,
        kind: row.get(1)?,
        sender: row.get(2)?,
        receiver: row.get(3)?,
        data: row.get(4)?,
        delivered: row.get::<_, i64>(5)? != 0,
        timestamp: row.get(6)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        identity: row.get(0)?,
        display_name: row.get(1)?,
        avatar_url: row.get(2)?,
        public_key: row.get(3)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, kind, sender, receiver, data, delivered, timestamp";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_message(&self, message: NewMessage) -> Result<u64> {
        self.call(move |conn| {
            let timestamp = message.timestamp.unwrap_or_else(unix_millis);
            conn.execute(
                "INSERT INTO messages (kind, sender, receiver, data, delivered, timestamp)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    message.kind,
                    message.sender,
                    message.receiver,
                    message.data,
                    timestamp,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn mark_delivered(&self, id: u64) -> Result<bool> {
        self.call(move |conn| {
            let affected = conn.execute(
                "UPDATE messages SET delivered = 1 WHERE id = ?1",
                params![id as i64],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn find_pending_friend_request(
        &self,
        requester: &str,
        target: &str,
    ) -> Result<Option<StoredMessage>> {
        let requester = requester.to_string();
        let target = target.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE sender = ?1 AND receiver = ?2
                           AND kind = 'event_addfriend' AND delivered = 0
                         ORDER BY id LIMIT 1"
                    ),
                    params![requester, target],
                    row_to_message,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn create_friend_edge_pair(&self, a: &str, b: &str) -> Result<()> {
        let a = a.to_string();
        let b = b.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;

            let existing: u32 = tx.query_row(
                "SELECT COUNT(*) FROM friends
                 WHERE (owner = ?1 AND friend = ?2) OR (owner = ?2 AND friend = ?1)",
                params![a, b],
                |row| row.get(0),
            )?;

            match existing {
                2 => {
                    // Already friends; idempotent.
                    tx.commit()?;
                    Ok(())
                }
                1 => Err(StoreError::CorruptEdgePair(a, b)),
                _ => {
                    tx.execute(
                        "INSERT INTO friends (owner, friend) VALUES (?1, ?2)",
                        params![a, b],
                    )?;
                    tx.execute(
                        "INSERT INTO friends (owner, friend) VALUES (?1, ?2)",
                        params![b, a],
                    )?;
                    tx.commit()?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn update_rotation_state(
        &self,
        owner: &str,
        friend: &str,
        chain_iv: &str,
        chain_key: &str,
    ) -> Result<bool> {
        let owner = owner.to_string();
        let friend = friend.to_string();
        let chain_iv = chain_iv.to_string();
        let chain_key = chain_key.to_string();
        self.call(move |conn| {
            let affected = conn.execute(
                "UPDATE friends SET chain_iv = ?3, chain_key = ?4
                 WHERE owner = ?1 AND friend = ?2",
                params![owner, friend, chain_iv, chain_key],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn list_friends(&self, identity: &str) -> Result<Vec<FriendEdge>> {
        let identity = identity.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT owner, friend, chain_iv, chain_key FROM friends
                 WHERE owner = ?1 ORDER BY friend",
            )?;
            let rows = stmt.query_map(params![identity], |row| {
                Ok(FriendEdge {
                    owner: row.get(0)?,
                    friend: row.get(1)?,
                    chain_iv: row.get(2)?,
                    chain_key: row.get(3)?,
                })
            })?;
            let mut edges = Vec::new();
            for row in rows {
                edges.push(row?);
            }
            Ok(edges)
        })
        .await
    }

    async fn list_undelivered(&self, identity: &str) -> Result<Vec<StoredMessage>> {
        let identity = identity.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE receiver = ?1 AND delivered = 0
                 ORDER BY timestamp ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![identity], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }

    async fn list_recent_messages(
        &self,
        a: &str,
        b: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let a = a.to_string();
        let b = b.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE delivered = 1 AND kind = 'text'
                   AND ((sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1))
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![a, b, limit], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }

    async fn list_all_users(&self) -> Result<Vec<UserProfile>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT identity, display_name, avatar_url, public_key FROM users
                 ORDER BY identity",
            )?;
            let rows = stmt.query_map([], row_to_user)?;
            let mut users = Vec::new();
            for row in rows {
                users.push(row?);
            }
            Ok(users)
        })
        .await
    }

    async fn get_user(&self, identity: &str) -> Result<Option<UserProfile>> {
        let identity = identity.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT identity, display_name, avatar_url, public_key FROM users
                     WHERE identity = ?1",
                    params![identity],
                    row_to_user,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn upsert_user(&self, user: UserProfile) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (identity, display_name, avatar_url, public_key)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(identity) DO UPDATE SET
                     display_name = excluded.display_name,
                     avatar_url = excluded.avatar_url,
                     public_key = excluded.public_key",
                params![
                    user.identity,
                    user.display_name,
                    user.avatar_url,
                    user.public_key,
                ],
            )?;
            Ok(())
        })
        .await
    }
}
