//! Participant data types
//!
//! Types representing the participants of an oTree session as recorded
//! by the bot conversation log

use serde::{Deserialize, Serialize};

/// A participant row in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Name of the app (session config) the participant belongs to
    pub session_name: String,
    /// oTree session code
    pub session_id: String,
    /// oTree participant code
    pub participant_id: String,
    pub is_human: bool,
    /// Start URL handed to the human or bot
    pub url: String,
    /// When a bot started working through its pages
    pub time_in: Option<String>,
    /// When a bot reached the end of the experiment
    pub time_out: Option<String>,
}

impl ParticipantRecord {
    /// Create a record for a participant that has not started yet
    pub fn new(
        session_name: &str,
        session_id: &str,
        participant_id: &str,
        is_human: bool,
        url: &str,
    ) -> Self {
        Self {
            session_name: session_name.to_string(),
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            is_human,
            url: url.to_string(),
            time_in: None,
            time_out: None,
        }
    }

    /// Participant kind label used in exports and logs
    pub fn kind(&self) -> &'static str {
        if self.is_human {
            "HUMAN"
        } else {
            "BOT"
        }
    }
}
