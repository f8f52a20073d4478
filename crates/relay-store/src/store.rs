//! The persistence seam consumed by the hub.
//!
//! Every component takes an `Arc<dyn Store>` instead of reaching for a
//! shared handle, so tests can substitute an isolated instance.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FriendEdge, NewMessage, StoredMessage, UserProfile};

/// Durable operations on accounts, friend edges, and the message log.
///
/// Implementations must be safe to call concurrently from many
/// connection tasks; no method may require the caller to hold any lock
/// across the await.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a message row and return its assigned id.
    async fn insert_message(&self, message: NewMessage) -> Result<u64>;

    /// Flip the delivered flag. Returns false when no such row exists.
    async fn mark_delivered(&self, id: u64) -> Result<bool>;

    /// The undelivered friend request from `requester` to `target`, if
    /// one is pending.
    async fn find_pending_friend_request(
        &self,
        requester: &str,
        target: &str,
    ) -> Result<Option<StoredMessage>>;

    /// Create both directions of an accepted friendship in a single
    /// transaction. Re-creating a complete pair is a no-op; finding
    /// exactly one existing direction fails with
    /// [`StoreError::CorruptEdgePair`](crate::StoreError::CorruptEdgePair).
    async fn create_friend_edge_pair(&self, a: &str, b: &str) -> Result<()>;

    /// Replace the rotation state on the (owner, friend) edge. Returns
    /// false when no such edge exists.
    async fn update_rotation_state(
        &self,
        owner: &str,
        friend: &str,
        chain_iv: &str,
        chain_key: &str,
    ) -> Result<bool>;

    /// All edges owned by `identity`.
    async fn list_friends(&self, identity: &str) -> Result<Vec<FriendEdge>>;

    /// Undelivered messages addressed to `identity`, oldest first.
    async fn list_undelivered(&self, identity: &str) -> Result<Vec<StoredMessage>>;

    /// The most recent delivered text messages between `a` and `b`,
    /// newest first.
    async fn list_recent_messages(&self, a: &str, b: &str, limit: u32)
        -> Result<Vec<StoredMessage>>;

    /// The whole user directory.
    async fn list_all_users(&self) -> Result<Vec<UserProfile>>;

    /// One directory row, if present.
    async fn get_user(&self, identity: &str) -> Result<Option<UserProfile>>;

    /// Insert or replace a directory row (provisioning and tests).
    async fn upsert_user(&self, user: UserProfile) -> Result<()>;
}
