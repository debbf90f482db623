//! CSV export functionality
//!
//! Every file gets its header row, even when there are no records, so that
//! downstream tools can load empty exports.

use std::fs::File;
use std::path::Path;

use csv::{Writer, WriterBuilder};
use serde::Serialize;

use super::{ExportError, ExportableParticipant};
use crate::parser::responses::ResponseRow;

/// Columns of the bot responses CSV
pub const RESPONSE_COLUMNS: [&str; 8] = [
    "session_id",
    "participant_id",
    "round",
    "question_id",
    "answer",
    "reason",
    "summary",
    "prompt",
];

fn create_writer(path: &Path) -> Result<Writer<File>, ExportError> {
    let file = File::create(path)?;
    Ok(WriterBuilder::new().has_headers(false).from_writer(file))
}

/// Write serializable records under an explicit header
pub fn write_records<T: Serialize>(
    headers: &[&str],
    records: &[T],
    path: &Path,
) -> Result<(), ExportError> {
    let mut writer = create_writer(path)?;

    writer.write_record(headers)?;
    for record in records {
        writer.serialize(record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write string rows under an explicit header
pub fn write_rows(headers: &[String], rows: &[Vec<String>], path: &Path) -> Result<(), ExportError> {
    let mut writer = create_writer(path)?;

    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write bot answers to CSV format
pub fn write_responses_csv(rows: &[ResponseRow], path: &Path) -> Result<(), ExportError> {
    write_records(&RESPONSE_COLUMNS, rows, path)
}

/// Write bot participants to CSV format
pub fn write_participants_csv(
    participants: &[ExportableParticipant],
    path: &Path,
) -> Result<(), ExportError> {
    write_records(&ExportableParticipant::COLUMNS, participants, path)
}

/// Read back a responses CSV
pub fn read_responses_csv(path: &Path) -> Result<Vec<ResponseRow>, ExportError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn create_test_row() -> ResponseRow {
        ResponseRow {
            session_id: "sess01".to_string(),
            participant_id: "p1".to_string(),
            round: 2,
            question_id: "choice".to_string(),
            answer: "R".to_string(),
            reason: "Rock, because paper is rare".to_string(),
            summary: "Played rock".to_string(),
            prompt: "Round 2 of 3".to_string(),
        }
    }

    #[test]
    fn test_write_responses_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.csv");

        write_responses_csv(&[create_test_row()], &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("session_id,participant_id,round,question_id,answer,reason,summary,prompt")
        );
        assert!(content.contains("\"Rock, because paper is rare\""));
        assert_eq!(read_responses_csv(&path).unwrap(), vec![create_test_row()]);
    }

    #[test]
    fn test_empty_export_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participants.csv");

        write_participants_csv(&[], &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(
            lines,
            vec!["session_name,session_id,participant_id,is_human,url,time_in,time_out"]
        );
    }

    #[test]
    fn test_participant_optional_fields_are_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participants.csv");
        let participant = ExportableParticipant {
            session_name: "rps".to_string(),
            session_id: "sess01".to_string(),
            participant_id: "p1".to_string(),
            is_human: true,
            url: "http://otree.test/InitializeParticipant/p1".to_string(),
            time_in: None,
            time_out: None,
        };

        write_participants_csv(&[participant], &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("rps,sess01,p1,true,http://otree.test/InitializeParticipant/p1,,"));
    }

    #[test]
    fn test_write_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let headers = vec!["code".to_string(), "payoff".to_string()];
        let rows = vec![vec!["p1".to_string(), "3".to_string()]];

        write_rows(&headers, &rows, &path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "code,payoff\np1,3\n");
    }
}
