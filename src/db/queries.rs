//! Database query implementations
//!
//! Contains functions for recording participants and bot conversations

use rusqlite::{params, Connection, OptionalExtension};
use super::DbError;
use crate::models::conversation::{ChatMessage, ConversationRecord};
use crate::models::participant::ParticipantRecord;

/// Insert a participant, replacing any earlier row with the same code
pub fn insert_participant(conn: &Connection, participant: &ParticipantRecord) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO participants (
            session_name, session_id, participant_id, is_human, url, time_in, time_out
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(participant_id) DO UPDATE SET
            session_name = excluded.session_name,
            session_id = excluded.session_id,
            is_human = excluded.is_human,
            url = excluded.url
        "#,
        params![
            participant.session_name,
            participant.session_id,
            participant.participant_id,
            if participant.is_human { 1 } else { 0 },
            participant.url,
            participant.time_in,
            participant.time_out
        ],
    )?;
    Ok(())
}

/// Record when a bot started
pub fn set_time_in(conn: &Connection, participant_id: &str, time: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE participants SET time_in = ?2 WHERE participant_id = ?1",
        params![participant_id, time],
    )?;
    Ok(())
}

/// Record when a bot finished
pub fn set_time_out(conn: &Connection, participant_id: &str, time: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE participants SET time_out = ?2 WHERE participant_id = ?1",
        params![participant_id, time],
    )?;
    Ok(())
}

/// Get all participants of a session ordered by insertion
pub fn get_participants(conn: &Connection, session_id: &str) -> Result<Vec<ParticipantRecord>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_name, session_id, participant_id, is_human, url, time_in, time_out
        FROM participants
        WHERE session_id = ?1
        ORDER BY rowid
        "#,
    )?;

    let participants = stmt
        .query_map(params![session_id], |row| {
            Ok(ParticipantRecord {
                session_name: row.get(0)?,
                session_id: row.get(1)?,
                participant_id: row.get(2)?,
                is_human: row.get::<_, i32>(3)? == 1,
                url: row.get(4)?,
                time_in: row.get(5)?,
                time_out: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(participants)
}

/// Insert or replace the conversation of a bot
pub fn upsert_conversation(
    conn: &Connection,
    id: &str,
    session_id: &str,
    bot_parms: &serde_json::Value,
    messages: &[ChatMessage],
) -> Result<(), DbError> {
    let parms = serde_json::to_string(bot_parms)?;
    let conversation = serde_json::to_string(messages)?;

    conn.execute(
        r#"
        INSERT INTO conversations (id, session_id, bot_parms, conversation, updated_at)
        VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            bot_parms = excluded.bot_parms,
            conversation = excluded.conversation,
            updated_at = excluded.updated_at
        "#,
        params![id, session_id, parms, conversation],
    )?;
    Ok(())
}

/// Get all conversations of a session
pub fn get_conversations(conn: &Connection, session_id: &str) -> Result<Vec<ConversationRecord>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, session_id, bot_parms, conversation
        FROM conversations
        WHERE session_id = ?1
        ORDER BY rowid
        "#,
    )?;

    let conversations = stmt
        .query_map(params![session_id], |row| {
            Ok(ConversationRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                bot_parms: row.get(2)?,
                conversation: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(conversations)
}

/// Get a single conversation by bot participant code
pub fn get_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRecord>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, bot_parms, conversation FROM conversations WHERE id = ?1",
    )?;

    let conversation = stmt
        .query_row(params![id], |row| {
            Ok(ConversationRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                bot_parms: row.get(2)?,
                conversation: row.get(3)?,
            })
        })
        .optional()?;

    Ok(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_tables;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn test_participants_roundtrip() {
        let conn = setup();
        insert_participant(&conn, &ParticipantRecord::new("rps", "s1", "a", true, "http://h/a")).unwrap();
        insert_participant(&conn, &ParticipantRecord::new("rps", "s1", "b", false, "http://h/b")).unwrap();
        insert_participant(&conn, &ParticipantRecord::new("rps", "s2", "c", false, "http://h/c")).unwrap();

        set_time_in(&conn, "b", "2024-01-01T00:00:00").unwrap();
        set_time_out(&conn, "b", "2024-01-01T00:05:00").unwrap();

        let rows = get_participants(&conn, "s1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].participant_id, "a");
        assert!(rows[0].is_human);
        assert_eq!(rows[1].time_in.as_deref(), Some("2024-01-01T00:00:00"));
        assert_eq!(rows[1].time_out.as_deref(), Some("2024-01-01T00:05:00"));
    }

    #[test]
    fn test_upsert_conversation_replaces() {
        let conn = setup();
        let parms = json!({"session_id": "s1", "model": "gemini/gemini-1.5-flash"});

        upsert_conversation(&conn, "b", "s1", &parms, &[ChatMessage::system("rules")]).unwrap();
        upsert_conversation(
            &conn,
            "b",
            "s1",
            &parms,
            &[ChatMessage::system("rules"), ChatMessage::user("page")],
        )
        .unwrap();

        let all = get_conversations(&conn, "s1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].messages().unwrap().len(), 2);

        let one = get_conversation(&conn, "b").unwrap().unwrap();
        assert_eq!(one.parms().unwrap()["model"], "gemini/gemini-1.5-flash");
        assert!(get_conversation(&conn, "missing").unwrap().is_none());
    }
}
