//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `users`, `friends`, and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- User directory
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    identity     TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    avatar_url   TEXT NOT NULL,
    public_key   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Friend edges (directed; an accepted friendship is two rows)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friends (
    owner     TEXT NOT NULL,
    friend    TEXT NOT NULL,
    chain_iv  TEXT NOT NULL DEFAULT '',
    chain_key TEXT NOT NULL DEFAULT '',

    PRIMARY KEY (owner, friend)
);

-- ----------------------------------------------------------------
-- Message log (append-only; only `delivered` ever changes)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    kind      TEXT NOT NULL,
    sender    TEXT NOT NULL,
    receiver  TEXT NOT NULL,
    data      TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,     -- boolean 0/1
    timestamp INTEGER NOT NULL                -- unix milliseconds
);

CREATE INDEX IF NOT EXISTS idx_messages_receiver_delivered
    ON messages(receiver, delivered);

CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
    ON messages(sender, receiver, timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
