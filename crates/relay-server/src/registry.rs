//! Connection registry and outbound writer guard.
//!
//! The registry is the only shared mutable in-memory structure in the
//! hub: a map from user identity to the live connection handle. At most
//! one entry exists per identity; a new registration evicts and closes
//! the previous connection. All outbound writes go through the
//! per-connection writer lock so concurrent handlers cannot interleave
//! bytes on a shared stream.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use relay_core::{encode_frame, Frame, RelayError, RelayResult};

/// The write half of an accepted websocket stream.
pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One live client connection: the authenticated identity plus the
/// serialized write half. The read half stays with the owning session
/// loop; stream-level failure is only ever observed there.
pub struct Connection {
    identity: String,
    writer: Mutex<WsSink>,
}

impl Connection {
    pub fn new(identity: String, sink: WsSink) -> Self {
        Self {
            identity,
            writer: Mutex::new(sink),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Encode and push one frame. The writer lock serializes concurrent
    /// pushes; each frame reaches the wire complete or not at all.
    pub async fn send_frame(&self, frame: &Frame) -> RelayResult<()> {
        let encoded = encode_frame(frame)?;
        self.send_message(Message::Text(encoded)).await
    }

    /// Push a raw websocket message through the writer guard.
    pub async fn send_message(&self, message: Message) -> RelayResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    /// Best-effort close of the underlying stream. Errors are ignored;
    /// the owning session loop notices the closure on its read path.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.flush().await;
    }
}

/// Thread-safe identity → connection map. One process-wide instance is
/// created by the server and injected into every component.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the connection, returning a previously registered
    /// connection for the same identity. The caller closes the evicted
    /// handle; its session loop then observes the closure and exits.
    pub async fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let evicted = {
            let mut entries = self.entries.write().await;
            entries.insert(conn.identity().to_string(), conn.clone())
        };

        info!(identity = %conn.identity(), "client connected");
        evicted
    }

    /// Remove and close the entry for this connection. A no-op when the
    /// identity has already been re-registered by a newer connection, so
    /// an evicted session's cleanup can never tear down its replacement.
    pub async fn deregister(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(conn.identity()) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    entries.remove(conn.identity())
                }
                _ => None,
            }
        };

        if let Some(removed) = removed {
            removed.close().await;
            info!(identity = %conn.identity(), "client disconnected");
        } else {
            debug!(identity = %conn.identity(), "connection already replaced, skipping deregister");
        }
    }

    /// Current connection handle for `identity`, if online. Never blocks
    /// on I/O; the caller performs the actual write.
    pub async fn lookup(&self, identity: &str) -> Option<Arc<Connection>> {
        self.entries.read().await.get(identity).cloned()
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::connection_for;
    use futures_util::StreamExt;
    use relay_core::decode_frame;

    #[tokio::test]
    async fn register_lookup_deregister() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = connection_for("alice").await;

        assert!(registry.register(conn.clone()).await.is_none());
        assert!(registry.lookup("alice").await.is_some());
        assert!(registry.lookup("bob").await.is_none());
        assert_eq!(registry.count().await, 1);

        registry.deregister(&conn).await;
        assert!(registry.lookup("alice").await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn second_registration_evicts_the_first() {
        let registry = ConnectionRegistry::new();
        let (first, _c1) = connection_for("alice").await;
        let (second, _c2) = connection_for("alice").await;

        assert!(registry.register(first.clone()).await.is_none());
        let evicted = registry.register(second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&evicted, &first));

        // Single-entry invariant: the replacement is the live handle.
        assert_eq!(registry.count().await, 1);
        let current = registry.lookup("alice").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn evicted_session_cleanup_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (first, _c1) = connection_for("alice").await;
        let (second, _c2) = connection_for("alice").await;

        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        // The evicted session's guaranteed-cleanup path runs late; it
        // must not remove the newer connection.
        registry.deregister(&first).await;
        let current = registry.lookup("alice").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        registry.deregister(&second).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_writes_do_not_interleave() {
        let (conn, mut client) = connection_for("alice").await;

        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let frame = Frame {
                    id: i,
                    kind: "text".into(),
                    sender: "alice".into(),
                    receiver: "bob".into(),
                    data: "x".repeat(2048),
                };
                conn.send_frame(&frame).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every push arrives as one complete, independently parseable
        // frame; ids cover the full set exactly once.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let msg = client.next().await.unwrap().unwrap();
            let frame = decode_frame(msg.to_text().unwrap()).unwrap();
            assert!(seen.insert(frame.id));
            assert_eq!(frame.data.len(), 2048);
        }
        assert_eq!(seen.len(), 16);
    }
}
