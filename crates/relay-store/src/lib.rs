//! # relay-store
//!
//! Persistence for the ratchet relay, backed by SQLite.
//!
//! The crate exposes the [`Store`] trait (the only surface the hub ever
//! talks to) plus the [`SqliteStore`] implementation. The message table
//! is an append-only delivery log: rows are inserted undelivered, flipped
//! to delivered exactly once, and never updated otherwise.

pub mod error;
pub mod migrations;
pub mod models;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use models::{FriendEdge, NewMessage, StoredMessage, UserProfile};
pub use sqlite::SqliteStore;
pub use store::Store;
