//! Frame dispatch and the protocol handlers behind it.
//!
//! One [`FrameRouter`] instance is shared by every session loop. A
//! handler may read and write the store and notify the counterpart
//! through the registry, but it never terminates a connection: protocol
//! and store failures degrade to a dropped frame or a missing push
//! (logged), and stream-level failure is the session loop's business.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use relay_core::{Frame, FrameKind, RotationPayload, TextPayload};
use relay_store::{NewMessage, Store, StoreError};

use crate::registry::ConnectionRegistry;
use crate::sync;

/// Decodes nothing itself; receives decoded frames from the session
/// loop and routes them by type tag.
pub struct FrameRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
}

impl FrameRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Store>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Route one inbound frame from the authenticated `identity`.
    /// Unknown types are logged and ignored.
    pub async fn dispatch(&self, identity: &str, mut frame: Frame) {
        let Some(kind) = frame.frame_kind() else {
            warn!(sender = %frame.sender, kind = %frame.kind, "unknown frame type");
            return;
        };
        // Canonical lowercase tag from here on (matching was
        // case-insensitive).
        frame.kind = kind.as_str().to_string();

        match kind {
            FrameKind::Text => self.handle_text(frame).await,
            FrameKind::EventConfirm => self.handle_confirm(frame).await,
            FrameKind::EventAddFriend => self.handle_add_friend(frame).await,
            FrameKind::EventDenyFriend => self.handle_deny_friend(frame).await,
            FrameKind::EventAllowFriend => self.handle_allow_friend(frame).await,
            FrameKind::ChangeKeychain => self.handle_rotation(frame).await,
            FrameKind::ChangePublickey => self.handle_public_key_change(frame).await,
            FrameKind::UpdateUserlist => {
                sync::push_user_directory(&self.registry, self.store.as_ref(), identity).await;
            }
            FrameKind::UpdateFriendlist => {
                sync::push_friend_list(&self.registry, self.store.as_ref(), identity).await;
            }
        }
    }

    /// Persist an undelivered text message and forward it with the
    /// store-assigned id if the receiver is online. The stored row keeps
    /// the client-supplied timestamp.
    async fn handle_text(&self, frame: Frame) {
        let payload: TextPayload = match serde_json::from_str(&frame.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(sender = %frame.sender, error = %e, "malformed text payload");
                return;
            }
        };

        self.persist_and_forward(frame, Some(payload.timestamp)).await;
    }

    /// Flip the delivered flag for the referenced message. `id == 0`
    /// means "not store-assigned" and is ignored.
    async fn handle_confirm(&self, frame: Frame) {
        if frame.id == 0 {
            return;
        }
        match self.store.mark_delivered(frame.id).await {
            Ok(true) => {}
            Ok(false) => debug!(id = frame.id, "confirm for unknown message"),
            Err(e) => error!(id = frame.id, error = %e, "failed to mark message delivered"),
        }
    }

    /// Friend request: reject duplicates while one is pending, then
    /// persist and forward.
    async fn handle_add_friend(&self, frame: Frame) {
        match self
            .store
            .find_pending_friend_request(&frame.sender, &frame.receiver)
            .await
        {
            Ok(Some(_)) => {
                info!(
                    requester = %frame.sender,
                    target = %frame.receiver,
                    "duplicate friend request ignored"
                );
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "failed to check pending friend request");
                return;
            }
        }

        self.persist_and_forward(frame, None).await;
    }

    /// Denial: consume the pending request, record the denial event for
    /// the requester, forward it. No friend edge is created.
    async fn handle_deny_friend(&self, frame: Frame) {
        // The pending request runs opposite to the denial frame.
        self.consume_pending_request(&frame.receiver, &frame.sender)
            .await;
        self.persist_and_forward(frame, None).await;
    }

    /// Acceptance: consume the pending request, create both friend
    /// edges in one transaction, record the acceptance event, forward.
    async fn handle_allow_friend(&self, frame: Frame) {
        self.consume_pending_request(&frame.receiver, &frame.sender)
            .await;

        match self
            .store
            .create_friend_edge_pair(&frame.sender, &frame.receiver)
            .await
        {
            Ok(()) => {}
            Err(e @ StoreError::CorruptEdgePair(_, _)) => {
                // A half-friendship corrupts every later check; surface
                // it and do not record an acceptance on top of it.
                error!(error = %e, "friend edge pair is corrupt");
                return;
            }
            Err(e) => {
                error!(
                    accepter = %frame.sender,
                    requester = %frame.receiver,
                    error = %e,
                    "failed to create friend edges"
                );
                return;
            }
        }

        self.persist_and_forward(frame, None).await;
    }

    /// Key-chain rotation: update the stored state on the
    /// (sender → receiver) edge. Nothing is persisted to the message
    /// log and nothing is forwarded.
    async fn handle_rotation(&self, frame: Frame) {
        let payload: RotationPayload = match serde_json::from_str(&frame.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(sender = %frame.sender, error = %e, "malformed rotation payload");
                return;
            }
        };

        match self
            .store
            .update_rotation_state(
                &frame.sender,
                &frame.receiver,
                &payload.chain_iv,
                &payload.chain_key,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                owner = %frame.sender,
                friend = %frame.receiver,
                "rotation for unknown friend edge"
            ),
            Err(e) => error!(error = %e, "failed to update rotation state"),
        }
    }

    /// Public-key change announcement: persisted like a content message
    /// so offline receivers get it on their next connect.
    async fn handle_public_key_change(&self, frame: Frame) {
        self.persist_and_forward(frame, None).await;
    }

    /// Mark the pending request from `requester` to `target` delivered
    /// (consumed by a deny/allow resolution).
    async fn consume_pending_request(&self, requester: &str, target: &str) {
        match self
            .store
            .find_pending_friend_request(requester, target)
            .await
        {
            Ok(Some(request)) => {
                if let Err(e) = self.store.mark_delivered(request.id).await {
                    error!(id = request.id, error = %e, "failed to consume friend request");
                }
            }
            Ok(None) => warn!(
                requester = %requester,
                target = %target,
                "resolution without a pending friend request"
            ),
            Err(e) => error!(error = %e, "failed to look up pending friend request"),
        }
    }

    /// Append the frame to the message log (undelivered), stamp it with
    /// the assigned id, and hand it to the receiver's connection if one
    /// is registered. Transport handoff does not mark the row
    /// delivered; only an explicit confirm frame does.
    async fn persist_and_forward(&self, mut frame: Frame, timestamp: Option<i64>) {
        let row = NewMessage {
            kind: frame.kind.clone(),
            sender: frame.sender.clone(),
            receiver: frame.receiver.clone(),
            data: frame.data.clone(),
            timestamp,
        };

        match self.store.insert_message(row).await {
            Ok(id) => frame.id = id,
            Err(e) => {
                error!(kind = %frame.kind, error = %e, "failed to persist message");
                return;
            }
        }

        if let Some(conn) = self.registry.lookup(&frame.receiver).await {
            if let Err(e) = conn.send_frame(&frame).await {
                warn!(
                    receiver = %frame.receiver,
                    id = frame.id,
                    error = %e,
                    "failed to forward frame"
                );
            }
        }
    }
}
