//! Shared helpers for in-crate tests: loopback websocket pairs and
//! store seeding.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

use relay_store::{SqliteStore, Store, UserProfile};

use crate::registry::{Connection, ConnectionRegistry};

/// A connected (server-side, client-side) websocket pair over loopback
/// TCP.
pub(crate) async fn ws_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        tokio_tungstenite::client_async("ws://localhost/", stream)
            .await
            .unwrap()
            .0
    });

    let (stream, _) = listener.accept().await.unwrap();
    let server = tokio_tungstenite::accept_async(stream).await.unwrap();
    (server, client.await.unwrap())
}

/// A [`Connection`] wrapping the server side of a fresh loopback pair,
/// plus the client side for observing what the relay wrote.
pub(crate) async fn connection_for(
    identity: &str,
) -> (Arc<Connection>, WebSocketStream<TcpStream>) {
    let (server, client) = ws_pair().await;
    let (sink, _read) = server.split();
    (Arc::new(Connection::new(identity.to_string(), sink)), client)
}

/// Like [`connection_for`], but registered.
pub(crate) async fn registered_connection(
    registry: &ConnectionRegistry,
    identity: &str,
) -> (Arc<Connection>, WebSocketStream<TcpStream>) {
    let (conn, client) = connection_for(identity).await;
    registry.register(conn.clone()).await;
    (conn, client)
}

/// Insert a directory row with predictable fields.
pub(crate) async fn seed_user(store: &SqliteStore, identity: &str) {
    store
        .upsert_user(UserProfile {
            identity: identity.to_string(),
            display_name: format!("User {identity}"),
            avatar_url: format!("https://example.test/{identity}.png"),
            public_key: format!("pk-{identity}"),
        })
        .await
        .unwrap();
}
