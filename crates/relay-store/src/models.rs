//! Typed rows of the relay database.

/// One row of the user directory. Provisioned out-of-band; the relay
/// only reads these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub identity: String,
    pub display_name: String,
    pub avatar_url: String,
    pub public_key: String,
}

/// One directed accepted-friendship edge. `chain_iv` / `chain_key` are
/// opaque rotation state the relay stores but cannot interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendEdge {
    pub owner: String,
    pub friend: String,
    pub chain_iv: String,
    pub chain_key: String,
}

/// A message row about to be inserted. `timestamp` is unix milliseconds;
/// `None` lets the store assign the insertion time (text messages carry
/// a client-supplied timestamp instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub kind: String,
    pub sender: String,
    pub receiver: String,
    pub data: String,
    pub timestamp: Option<i64>,
}

/// A persisted message row. `id` is assigned on insert, monotonic, and
/// serves as the replay/confirm key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub kind: String,
    pub sender: String,
    pub receiver: String,
    pub data: String,
    pub delivered: bool,
    pub timestamp: i64,
}
