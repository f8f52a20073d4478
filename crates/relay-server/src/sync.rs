//! Connect-time sync pushes.
//!
//! Three independent read-then-push tasks: the user directory, the
//! friend list with recent history, and the undelivered backlog. They
//! are spawned when a session registers and re-run individually when a
//! refresh frame arrives. Each task is best-effort: a store failure or a
//! receiver that disconnected mid-push is logged and skipped; the next
//! connect or an explicit refresh triggers it again.

use std::sync::Arc;

use tracing::{debug, warn};

use relay_core::{DirectoryEntry, Frame, FrameKind, FriendEntry, HistoryItem};
use relay_store::Store;

use crate::registry::ConnectionRegistry;

/// How many delivered text messages each friend-list entry replays.
const RECENT_HISTORY_LIMIT: u32 = 10;

/// Launch all three sync tasks for a freshly connected identity. None
/// of them blocks the caller or the others.
pub fn spawn_connect_sync(
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    identity: String,
) {
    {
        let registry = registry.clone();
        let store = store.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            push_user_directory(&registry, store.as_ref(), &identity).await;
        });
    }
    {
        let registry = registry.clone();
        let store = store.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            push_friend_list(&registry, store.as_ref(), &identity).await;
        });
    }
    tokio::spawn(async move {
        push_undelivered(&registry, store.as_ref(), &identity).await;
    });
}

/// Push the full user directory to `identity`.
pub async fn push_user_directory(
    registry: &ConnectionRegistry,
    store: &dyn Store,
    identity: &str,
) {
    let users = match store.list_all_users().await {
        Ok(users) => users,
        Err(e) => {
            warn!(error = %e, "failed to fetch user directory");
            return;
        }
    };

    let entries: Vec<DirectoryEntry> = users
        .into_iter()
        .map(|user| DirectoryEntry {
            identity: user.identity,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
            public_key: user.public_key,
        })
        .collect();

    push_to(registry, identity, FrameKind::UpdateUserlist, &entries).await;
}

/// Push the friend list with rotation state and recent delivered
/// history to `identity`.
pub async fn push_friend_list(registry: &ConnectionRegistry, store: &dyn Store, identity: &str) {
    let edges = match store.list_friends(identity).await {
        Ok(edges) => edges,
        Err(e) => {
            warn!(error = %e, "failed to fetch friend list");
            return;
        }
    };

    let mut entries = Vec::with_capacity(edges.len());
    for edge in edges {
        let profile = match store.get_user(&edge.friend).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!(friend = %edge.friend, "friend edge without directory row, skipping");
                continue;
            }
            Err(e) => {
                warn!(friend = %edge.friend, error = %e, "failed to fetch friend profile");
                continue;
            }
        };

        let history = match store
            .list_recent_messages(identity, &edge.friend, RECENT_HISTORY_LIMIT)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(friend = %edge.friend, error = %e, "failed to fetch recent history");
                Vec::new()
            }
        };

        entries.push(FriendEntry {
            identity: profile.identity,
            display_name: profile.display_name,
            avatar_url: profile.avatar_url,
            public_key: profile.public_key,
            chain_iv: edge.chain_iv,
            chain_key: edge.chain_key,
            messages: history
                .into_iter()
                .map(|msg| HistoryItem {
                    kind: msg.kind,
                    data: msg.data,
                    sender: msg.sender,
                    receiver: msg.receiver,
                })
                .collect(),
        });
    }

    push_to(registry, identity, FrameKind::UpdateFriendlist, &entries).await;
}

/// Replay the undelivered backlog to `identity`, oldest first. Rows stay
/// undelivered until the client confirms them; a disconnect mid-replay
/// stops the loop and leaves the remainder for the next connect.
pub async fn push_undelivered(registry: &ConnectionRegistry, store: &dyn Store, identity: &str) {
    let backlog = match store.list_undelivered(identity).await {
        Ok(backlog) => backlog,
        Err(e) => {
            warn!(error = %e, "failed to fetch undelivered messages");
            return;
        }
    };

    for msg in backlog {
        let Some(conn) = registry.lookup(identity).await else {
            debug!(identity = %identity, "disconnected during backlog replay");
            return;
        };

        let frame = Frame {
            id: msg.id,
            kind: msg.kind,
            sender: msg.sender,
            receiver: msg.receiver,
            data: msg.data,
        };
        if let Err(e) = conn.send_frame(&frame).await {
            warn!(identity = %identity, id = frame.id, error = %e, "failed to replay message");
        }
    }
}

/// Serialize `payload` and push it as a server-originated frame
/// (`id = 0`, sender == receiver == the synced identity).
async fn push_to<T: serde::Serialize>(
    registry: &ConnectionRegistry,
    identity: &str,
    kind: FrameKind,
    payload: &T,
) {
    let data = match serde_json::to_string(payload) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "failed to serialize sync payload");
            return;
        }
    };

    let frame = Frame {
        id: 0,
        kind: kind.as_str().to_string(),
        sender: identity.to_string(),
        receiver: identity.to_string(),
        data,
    };

    match registry.lookup(identity).await {
        Some(conn) => {
            if let Err(e) = conn.send_frame(&frame).await {
                warn!(identity = %identity, kind = %kind, error = %e, "failed to push sync frame");
            }
        }
        None => {
            debug!(identity = %identity, kind = %kind, "disconnected before sync push");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{registered_connection, seed_user};
    use futures_util::StreamExt;
    use relay_core::decode_frame;
    use relay_store::{NewMessage, SqliteStore};

    fn text_row(sender: &str, receiver: &str, ts: i64) -> NewMessage {
        NewMessage {
            kind: "text".into(),
            sender: sender.into(),
            receiver: receiver.into(),
            data: format!("{{\"n\":{ts}}}"),
            timestamp: Some(ts),
        }
    }

    #[tokio::test]
    async fn user_directory_push_carries_every_row() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "alice").await;
        seed_user(&store, "bob").await;

        let (_conn, mut client) = registered_connection(&registry, "alice").await;
        push_user_directory(&registry, &store, "alice").await;

        let msg = client.next().await.unwrap().unwrap();
        let frame = decode_frame(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame.id, 0);
        assert_eq!(frame.kind, "update_userlist");
        assert_eq!(frame.sender, "alice");
        assert_eq!(frame.receiver, "alice");

        let entries: Vec<DirectoryEntry> = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identity, "alice");
        assert_eq!(entries[1].public_key, "pk-bob");
    }

    #[tokio::test]
    async fn friend_list_push_includes_rotation_state_and_history() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "alice").await;
        seed_user(&store, "bob").await;
        store.create_friend_edge_pair("alice", "bob").await.unwrap();
        store
            .update_rotation_state("alice", "bob", "iv-7", "ck-7")
            .await
            .unwrap();

        // Two delivered text rows and one undelivered; history carries
        // only the delivered ones, newest first.
        for ts in [10, 20] {
            let id = store.insert_message(text_row("bob", "alice", ts)).await.unwrap();
            store.mark_delivered(id).await.unwrap();
        }
        store.insert_message(text_row("bob", "alice", 30)).await.unwrap();

        let (_conn, mut client) = registered_connection(&registry, "alice").await;
        push_friend_list(&registry, &store, "alice").await;

        let msg = client.next().await.unwrap().unwrap();
        let frame = decode_frame(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame.kind, "update_friendlist");

        let entries: Vec<FriendEntry> = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.identity, "bob");
        assert_eq!(entry.chain_iv, "iv-7");
        assert_eq!(entry.chain_key, "ck-7");
        assert_eq!(entry.messages.len(), 2);
        assert_eq!(entry.messages[0].data, "{\"n\":20}");
        assert_eq!(entry.messages[1].data, "{\"n\":10}");
    }

    #[tokio::test]
    async fn backlog_replay_is_oldest_first_and_leaves_rows_undelivered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert_message(text_row("bob", "alice", 100)).await.unwrap();
        let second = store.insert_message(text_row("bob", "alice", 200)).await.unwrap();

        let (_conn, mut client) = registered_connection(&registry, "alice").await;
        push_undelivered(&registry, &store, "alice").await;

        let msg = client.next().await.unwrap().unwrap();
        let frame = decode_frame(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame.id, first);

        let msg = client.next().await.unwrap().unwrap();
        let frame = decode_frame(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame.id, second);

        // Transport handoff is not delivery; only a confirm frame is.
        assert_eq!(store.list_undelivered("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pushes_to_offline_identity_are_skipped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "alice").await;
        store.insert_message(text_row("bob", "alice", 1)).await.unwrap();

        // Nobody is connected; all three complete without effect.
        push_user_directory(&registry, &store, "alice").await;
        push_friend_list(&registry, &store, "alice").await;
        push_undelivered(&registry, &store, "alice").await;

        assert_eq!(store.list_undelivered("alice").await.unwrap().len(), 1);
    }
}
