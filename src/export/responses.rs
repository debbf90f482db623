//! Bot responses export
//!
//! Rows are produced by the detailed aggregator first. When that fails the
//! flat aggregator is tried, and when writing still fails a single error
//! row is written so the file always exists.

use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use super::csv_export::write_responses_csv;
use super::ExportError;
use crate::db::{queries, Database};
use crate::parser::responses::{detailed_rows, flat_rows, ResponseRow};

/// Which export produced the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Detailed,
    Flat,
    ErrorRow,
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportMode::Detailed => "detailed",
            ExportMode::Flat => "flat",
            ExportMode::ErrorRow => "error row",
        };
        write!(f, "{}", name)
    }
}

/// Result of a responses export
#[derive(Debug, Clone)]
pub struct ResponsesExport {
    pub mode: ExportMode,
    pub rows: Vec<ResponseRow>,
}

/// Row written when no answers could be exported
pub fn error_row(session_id: &str, error: &str) -> ResponseRow {
    ResponseRow {
        session_id: session_id.to_string(),
        participant_id: "error".to_string(),
        round: 1,
        question_id: "export_error".to_string(),
        answer: format!("Export failed: {}", error),
        reason: "System error during data export".to_string(),
        summary: "Error occurred during data export process".to_string(),
        prompt: "N/A".to_string(),
    }
}

fn detailed(db: &Database, session_id: &str, path: &Path) -> Result<Vec<ResponseRow>, ExportError> {
    let conversations = db.with_connection(|conn| queries::get_conversations(conn, session_id))?;
    let rows = detailed_rows(session_id, &conversations)?;
    write_responses_csv(&rows, path)?;
    Ok(rows)
}

fn flat(db: &Database, session_id: &str, path: &Path) -> Result<Vec<ResponseRow>, ExportError> {
    let conversations = db.with_connection(|conn| queries::get_conversations(conn, session_id))?;
    let rows = flat_rows(session_id, &conversations);
    write_responses_csv(&rows, path)?;
    Ok(rows)
}

/// Export the answers of every bot in `session_id` to `path`
pub fn export_responses(db: &Database, session_id: &str, path: &Path) -> Result<ResponsesExport, ExportError> {
    let first = match detailed(db, session_id, path) {
        Ok(rows) => {
            info!("Wrote {} responses to {}", rows.len(), path.display());
            return Ok(ResponsesExport {
                mode: ExportMode::Detailed,
                rows,
            });
        }
        Err(e) => e,
    };
    warn!("Detailed response export failed: {}", first);

    match flat(db, session_id, path) {
        Ok(rows) => {
            info!("Flat export wrote {} responses to {}", rows.len(), path.display());
            Ok(ResponsesExport {
                mode: ExportMode::Flat,
                rows,
            })
        }
        Err(second) => {
            warn!("Flat response export also failed: {}", second);
            let rows = vec![error_row(session_id, &first.to_string())];
            write_responses_csv(&rows, path)?;
            Ok(ResponsesExport {
                mode: ExportMode::ErrorRow,
                rows,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::csv_export::read_responses_csv;
    use crate::models::conversation::ChatMessage;
    use rusqlite::params;
    use serde_json::json;

    fn setup_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn store(db: &Database, id: &str, messages: &[ChatMessage]) {
        let parms = json!({"session_id": "sess01", "participant_code": id});
        db.with_connection(|conn| queries::upsert_conversation(conn, id, "sess01", &parms, messages))
            .unwrap();
    }

    fn answer(choice: &str) -> ChatMessage {
        ChatMessage::assistant(
            json!({
                "summary": "played",
                "answers": {"choice": {"answer": choice, "reason": "because"}}
            })
            .to_string(),
        )
    }

    #[test]
    fn test_detailed_export() {
        let db = setup_db();
        store(
            &db,
            "p1",
            &[
                ChatMessage::system("You are a participant"),
                ChatMessage::user("Round 1 of 2"),
                answer("R"),
                ChatMessage::user("Round 2 of 2"),
                answer("P"),
            ],
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.csv");

        let export = export_responses(&db, "sess01", &path).unwrap();

        assert_eq!(export.mode, ExportMode::Detailed);
        let rows = read_responses_csv(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].round, rows[0].answer.as_str()), (1, "R"));
        assert_eq!((rows[1].round, rows[1].answer.as_str()), (2, "P"));
    }

    #[test]
    fn test_falls_back_to_flat_export() {
        let db = setup_db();
        store(&db, "p1", &[ChatMessage::user("Round 3"), answer("S")]);
        // bot_parms without a session id breaks the detailed export only
        db.with_connection(|conn| {
            conn.execute(
                "UPDATE conversations SET bot_parms = '{}' WHERE id = ?1",
                params!["p1"],
            )?;
            Ok(())
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.csv");

        let export = export_responses(&db, "sess01", &path).unwrap();

        assert_eq!(export.mode, ExportMode::Flat);
        assert_eq!(export.rows.len(), 1);
        assert_eq!(export.rows[0].round, 1);
        assert_eq!(export.rows[0].answer, "S");
    }

    #[test]
    fn test_error_row() {
        let row = error_row("sess01", "boom");

        assert_eq!(row.participant_id, "error");
        assert_eq!(row.round, 1);
        assert_eq!(row.question_id, "export_error");
        assert_eq!(row.answer, "Export failed: boom");
        assert_eq!(row.prompt, "N/A");
    }

    #[test]
    fn test_no_conversations_writes_header_only() {
        let db = setup_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.csv");

        let export = export_responses(&db, "sess01", &path).unwrap();

        assert_eq!(export.mode, ExportMode::Detailed);
        assert!(export.rows.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
