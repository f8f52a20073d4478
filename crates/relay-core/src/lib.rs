//! relay-core: Shared protocol library for the ratchet relay.
//!
//! Provides the JSON wire frame and its structured sub-payloads, the
//! frame codec, and HMAC capability tokens. The relay never interprets
//! message ciphertext or rotation metadata; everything opaque stays an
//! opaque string here.

pub mod error;
pub mod frame;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use frame::{
    decode_frame, encode_frame, DirectoryEntry, Frame, FrameKind, FriendEntry, HistoryItem,
    RotationPayload, TextPayload,
};
pub use token::{generate_secret, issue_token, validate_token, Claims};
