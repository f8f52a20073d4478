//! JSON wire frames exchanged over a live connection.
//!
//! Every message unit is one [`Frame`]: a flat envelope whose `data`
//! field carries either opaque ciphertext or a JSON-encoded sub-payload,
//! depending on the frame type. An `id` of 0 means "not yet assigned by
//! the store"; forwarded content frames always carry the store id so the
//! receiving client can confirm them.

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// One wire frame. The transport projection of a stored message, or a
/// transient control signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    pub receiver: String,
    pub data: String,
}

impl Frame {
    /// Parse the type tag; `None` for unknown tags.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::parse(&self.kind)
    }
}

/// Known frame type tags. Matching is case-insensitive; the canonical
/// lowercase form goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// End-to-end-encrypted text message.
    Text,
    /// Receiver acknowledges a stored message by id.
    EventConfirm,
    /// Friend request.
    EventAddFriend,
    /// Friend request denied.
    EventDenyFriend,
    /// Friend request accepted.
    EventAllowFriend,
    /// Key-chain rotation state update for one friend edge.
    ChangeKeychain,
    /// Public-key change announcement.
    ChangePublickey,
    /// User directory push / refresh request.
    UpdateUserlist,
    /// Friend list push / refresh request.
    UpdateFriendlist,
}

impl FrameKind {
    pub const ALL: [FrameKind; 9] = [
        FrameKind::Text,
        FrameKind::EventConfirm,
        FrameKind::EventAddFriend,
        FrameKind::EventDenyFriend,
        FrameKind::EventAllowFriend,
        FrameKind::ChangeKeychain,
        FrameKind::ChangePublickey,
        FrameKind::UpdateUserlist,
        FrameKind::UpdateFriendlist,
    ];

    /// Case-insensitive tag lookup.
    pub fn parse(tag: &str) -> Option<FrameKind> {
        match tag.to_ascii_lowercase().as_str() {
            "text" => Some(FrameKind::Text),
            "event_confirm" => Some(FrameKind::EventConfirm),
            "event_addfriend" => Some(FrameKind::EventAddFriend),
            "event_denyfriend" => Some(FrameKind::EventDenyFriend),
            "event_allowfriend" => Some(FrameKind::EventAllowFriend),
            "change_keychain" => Some(FrameKind::ChangeKeychain),
            "change_publickey" => Some(FrameKind::ChangePublickey),
            "update_userlist" => Some(FrameKind::UpdateUserlist),
            "update_friendlist" => Some(FrameKind::UpdateFriendlist),
            _ => None,
        }
    }

    /// Canonical wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Text => "text",
            FrameKind::EventConfirm => "event_confirm",
            FrameKind::EventAddFriend => "event_addfriend",
            FrameKind::EventDenyFriend => "event_denyfriend",
            FrameKind::EventAllowFriend => "event_allowfriend",
            FrameKind::ChangeKeychain => "change_keychain",
            FrameKind::ChangePublickey => "change_publickey",
            FrameKind::UpdateUserlist => "update_userlist",
            FrameKind::UpdateFriendlist => "update_friendlist",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a frame for transmission.
pub fn encode_frame(frame: &Frame) -> RelayResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one frame from the wire. Unknown extra fields are tolerated.
pub fn decode_frame(raw: &str) -> RelayResult<Frame> {
    serde_json::from_str(raw).map_err(|e| RelayError::InvalidFrame(e.to_string()))
}

// ---------------------------------------------------------------------------
// Structured sub-payloads carried inside `Frame::data`
// ---------------------------------------------------------------------------

/// Payload of a `text` frame. `content` and `content_iv` are opaque to
/// the relay; the ratchet counters and the client-supplied timestamp
/// (unix milliseconds) are stored alongside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    pub content: String,
    pub content_iv: String,
    pub x_ratchet: i64,
    pub y_ratchet: i64,
    pub timestamp: i64,
}

/// Payload of a `change_keychain` frame: the next opaque rotation state
/// for the (sender, receiver) friend edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPayload {
    pub chain_iv: String,
    pub chain_key: String,
}

/// One entry of the pushed user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub identity: String,
    pub display_name: String,
    pub avatar_url: String,
    pub public_key: String,
}

/// One friend-list entry: directory fields plus the stored rotation
/// state and the most recent delivered history between the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEntry {
    pub identity: String,
    pub display_name: String,
    pub avatar_url: String,
    pub public_key: String,
    pub chain_iv: String,
    pub chain_key: String,
    pub messages: Vec<HistoryItem>,
}

/// One replayed history message. Carries no id: history is informational
/// and is never confirmed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    pub sender: String,
    pub receiver: String,
}
