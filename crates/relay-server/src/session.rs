//! Per-connection session loop.
//!
//! Owns one authenticated connection from registration to guaranteed
//! deregistration: register (evicting any prior connection for the same
//! identity), fire the connect-time sync tasks, then read frames until
//! the stream closes or fails. Protocol and authorization failures drop
//! the frame and keep reading; only transport failure ends the loop.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use relay_core::{decode_frame, Claims};

use crate::handlers::FrameRouter;
use crate::registry::Connection;
use crate::sync;

/// Drive one accepted, token-authorized websocket until disconnect.
pub async fn run_session(router: Arc<FrameRouter>, ws: WebSocketStream<TcpStream>, claims: Claims) {
    let identity = claims.identity;
    let (sink, mut reader) = ws.split();
    let conn = Arc::new(Connection::new(identity.clone(), sink));

    let registry = router.registry().clone();
    if let Some(evicted) = registry.register(conn.clone()).await {
        info!(identity = %identity, "replacing existing connection");
        evicted.close().await;
    }

    // The three sync pushes run concurrently with each other and with
    // the read loop below.
    sync::spawn_connect_sync(registry.clone(), router.store().clone(), identity.clone());

    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(raw)) => {
                let frame = match decode_frame(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "dropping malformed frame");
                        continue;
                    }
                };

                // A frame that names neither the authenticated identity
                // as sender nor as receiver is spoofed.
                if frame.sender != identity && frame.receiver != identity {
                    warn!(
                        identity = %identity,
                        sender = %frame.sender,
                        receiver = %frame.receiver,
                        "dropping frame with mismatched identity"
                    );
                    continue;
                }

                router.dispatch(&identity, frame).await;
            }
            Ok(Message::Ping(payload)) => {
                let _ = conn.send_message(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary and stray pong frames carry nothing here.
            }
            Err(e) => {
                debug!(identity = %identity, error = %e, "socket read error");
                break;
            }
        }
    }

    // Every exit path funnels through here, including eviction.
    registry.deregister(&conn).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::test_util::ws_pair;
    use futures_util::SinkExt;
    use relay_core::Frame;
    use relay_store::{SqliteStore, Store};
    use std::time::Duration;

    fn test_router() -> Arc<FrameRouter> {
        Arc::new(FrameRouter::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        ))
    }

    fn claims_for(identity: &str) -> Claims {
        Claims {
            identity: identity.to_string(),
            expires_at: u64::MAX,
        }
    }

    fn text_frame(sender: &str, receiver: &str) -> String {
        serde_json::to_string(&Frame {
            id: 0,
            kind: "text".into(),
            sender: sender.into(),
            receiver: receiver.into(),
            data: r#"{"content":"c","content_iv":"iv","x_ratchet":0,"y_ratchet":0,"timestamp":1}"#
                .into(),
        })
        .unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn spoofed_frames_are_dropped_but_the_session_survives() {
        let router = test_router();
        let (server, mut client) = ws_pair().await;
        let session = tokio::spawn(run_session(router.clone(), server, claims_for("alice")));

        // Neither sender nor receiver is alice: dropped.
        client
            .send(Message::Text(text_frame("eve", "mallory")))
            .await
            .unwrap();
        // Valid frame from the same stream still goes through.
        client
            .send(Message::Text(text_frame("alice", "bob")))
            .await
            .unwrap();

        let store = router.store().clone();
        eventually(|| {
            let store = store.clone();
            async move { store.list_undelivered("bob").await.unwrap().len() == 1 }
        })
        .await;
        assert!(store.list_undelivered("mallory").await.unwrap().is_empty());

        client.close(None).await.unwrap();
        session.await.unwrap();
        assert_eq!(router.registry().count().await, 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_non_fatal() {
        let router = test_router();
        let (server, mut client) = ws_pair().await;
        let session = tokio::spawn(run_session(router.clone(), server, claims_for("alice")));

        client
            .send(Message::Text("{definitely not json".into()))
            .await
            .unwrap();
        client
            .send(Message::Text(text_frame("alice", "bob")))
            .await
            .unwrap();

        let store = router.store().clone();
        eventually(|| {
            let store = store.clone();
            async move { store.list_undelivered("bob").await.unwrap().len() == 1 }
        })
        .await;

        client.close(None).await.unwrap();
        session.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_always_deregisters() {
        let router = test_router();
        let (server, client) = ws_pair().await;
        let session = tokio::spawn(run_session(router.clone(), server, claims_for("alice")));

        eventually(|| {
            let registry = router.registry().clone();
            async move { registry.lookup("alice").await.is_some() }
        })
        .await;

        // Abrupt drop, no close frame.
        drop(client);
        session.await.unwrap();
        assert!(router.registry().lookup("alice").await.is_none());
    }
}
