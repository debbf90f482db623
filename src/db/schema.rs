//! Database schema definitions
//!
//! Contains SQL for the participant and conversation tables

use rusqlite::Connection;
use super::DbError;

/// SQL schema for all tables
const SCHEMA: &str = r#"
-- Everyone taking part in a session
CREATE TABLE IF NOT EXISTS participants (
    session_name TEXT NOT NULL,
    session_id TEXT NOT NULL,
    participant_id TEXT PRIMARY KEY,
    is_human INTEGER NOT NULL DEFAULT 0,
    url TEXT NOT NULL,
    time_in TEXT,
    time_out TEXT
);

CREATE INDEX IF NOT EXISTS idx_participants_session ON participants(session_id);

-- One row per bot, rewritten after every exchange
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    bot_parms TEXT NOT NULL,
    conversation TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);
"#;

/// Create all database tables
pub fn create_tables(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        // Idempotent
        create_tables(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 2);
    }
}
