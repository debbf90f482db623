//! Export module for session results
//!
//! After a session ends, its data is written next to the conversation log:
//! - The oTree wide CSV and the tables normalized from it (`normalize`)
//! - Bot participants and bot answers from the conversation log (`responses`)
//! - A plain text summary of the run (`summary`)

pub mod csv_export;
pub mod normalize;
pub mod responses;
pub mod summary;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{queries, Database, DbError};
use crate::models::participant::ParticipantRecord;
use crate::otree::HostError;
use crate::parser::ParserError;

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("oTree error: {0}")]
    Host(#[from] HostError),

    #[error("Parse error: {0}")]
    Parser(#[from] ParserError),

    #[error("Wide CSV {0} has no header row")]
    EmptyWideCsv(PathBuf),
}

/// oTree tables split out of the wide CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Session,
    Participant,
    Group,
    Player,
}

impl Table {
    pub fn all() -> [Table; 4] {
        [Table::Session, Table::Participant, Table::Group, Table::Player]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Session => "session",
            Table::Participant => "participant",
            Table::Group => "group",
            Table::Player => "player",
        }
    }
}

/// Paths of every file a session exports
#[derive(Debug, Clone)]
pub struct SessionFiles {
    dir: PathBuf,
    session_id: String,
    suffix: String,
}

impl SessionFiles {
    /// `session_id` is the oTree session code, `suffix` the run suffix
    pub fn new(dir: &Path, session_id: &str, suffix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            session_id: session_id.to_string(),
            suffix: suffix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn wide_csv(&self) -> PathBuf {
        self.dir
            .join(format!("otree_{}_wide{}.csv", self.session_id, self.suffix))
    }

    pub fn table_csv(&self, table: Table) -> PathBuf {
        self.dir.join(format!(
            "otree_{}{}_{}.csv",
            self.session_id,
            self.suffix,
            table.as_str()
        ))
    }

    pub fn bot_participants_csv(&self) -> PathBuf {
        self.dir
            .join(format!("botex_{}_participants{}.csv", self.session_id, self.suffix))
    }

    pub fn bot_responses_csv(&self) -> PathBuf {
        self.dir
            .join(format!("botex_{}_responses{}.csv", self.session_id, self.suffix))
    }

    pub fn summary_txt(&self) -> PathBuf {
        self.dir
            .join(format!("data_export_summary_{}{}.txt", self.session_id, self.suffix))
    }
}

/// Participant row of the bot participants CSV
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportableParticipant {
    pub session_name: String,
    pub session_id: String,
    pub participant_id: String,
    pub is_human: bool,
    pub url: String,
    pub time_in: Option<String>,
    pub time_out: Option<String>,
}

impl ExportableParticipant {
    pub const COLUMNS: [&'static str; 7] = [
        "session_name",
        "session_id",
        "participant_id",
        "is_human",
        "url",
        "time_in",
        "time_out",
    ];
}

impl From<&ParticipantRecord> for ExportableParticipant {
    fn from(record: &ParticipantRecord) -> Self {
        Self {
            session_name: record.session_name.clone(),
            session_id: record.session_id.clone(),
            participant_id: record.participant_id.clone(),
            is_human: record.is_human,
            url: record.url.clone(),
            time_in: record.time_in.clone(),
            time_out: record.time_out.clone(),
        }
    }
}

/// Export the participants recorded in the conversation log
pub fn export_participants(db: &Database, session_id: &str, path: &Path) -> Result<usize, ExportError> {
    let participants = db.with_connection(|conn| queries::get_participants(conn, session_id))?;
    let rows: Vec<ExportableParticipant> = participants.iter().map(ExportableParticipant::from).collect();
    csv_export::write_participants_csv(&rows, path)?;
    Ok(rows.len())
}
