//! Response aggregator
//!
//! Walks the messages of a bot conversation and emits one row per answered
//! question. A user prompt mentioning `Round N` sets the current round; the
//! last mention in a prompt wins. When a prompt carries no round marker, a
//! reply to what looks like an opening question (choice, decision, ...) after
//! more than two answers in the round starts the next round.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ParserError, ParserResult};
use crate::bot::response::{parse_response, CORRECTION_PREFIX};
use crate::models::conversation::{ChatMessage, ConversationRecord, MessageRole};

/// Longest prompt excerpt kept per row, in characters
pub const PROMPT_EXCERPT_CHARS: usize = 500;
/// Question ids that usually open a round
pub const INITIAL_QUESTION_PATTERNS: [&str; 5] = ["choice", "decision", "select", "pick", "vote"];
/// Question number used for sorting ids without digits
const UNNUMBERED: u32 = 999;

lazy_static! {
    static ref ROUND_MARKER: Regex = Regex::new(r"[Rr]ound\s*(\d+)").unwrap();
    static ref NUMBER: Regex = Regex::new(r"\d+").unwrap();
}

/// One answered question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRow {
    pub session_id: String,
    pub participant_id: String,
    pub round: u32,
    pub question_id: String,
    pub answer: String,
    pub reason: String,
    pub summary: String,
    pub prompt: String,
}

/// Round announced by a prompt, if any
pub fn round_marker(prompt: &str) -> Option<u32> {
    ROUND_MARKER
        .captures_iter(prompt)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .last()
}

/// First number in a question id, `999` when there is none
pub fn question_number(question_id: &str) -> u32 {
    NUMBER
        .find(question_id)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(UNNUMBERED)
}

/// Prompt excerpt, cut on a character boundary
pub fn excerpt(prompt: &str) -> String {
    match prompt.char_indices().nth(PROMPT_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &prompt[..idx]),
        None => prompt.to_string(),
    }
}

fn looks_like_initial(question_ids: &[&String]) -> bool {
    question_ids.iter().any(|id| {
        let id = id.to_lowercase();
        INITIAL_QUESTION_PATTERNS.iter().any(|p| id.contains(p))
    })
}

/// Rows of the last reply, kept until we know it was not corrected
struct PendingReply {
    rows: Vec<ResponseRow>,
    round_before: u32,
    answered_before: usize,
}

/// Aggregates the messages of one conversation into rows
pub struct ResponseAggregator {
    session_id: String,
    participant_id: String,
    infer_rounds: bool,
    current_round: u32,
    answered_in_round: usize,
    prompt: String,
    prompt_has_marker: bool,
    pending: Option<PendingReply>,
    rows: Vec<ResponseRow>,
}

impl ResponseAggregator {
    /// Aggregator with round tracking
    pub fn new(session_id: &str, participant_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            infer_rounds: true,
            current_round: 1,
            answered_in_round: 0,
            prompt: String::new(),
            prompt_has_marker: false,
            pending: None,
            rows: Vec::new(),
        }
    }

    /// Aggregator that puts every row in round 1
    pub fn flat(session_id: &str, participant_id: &str) -> Self {
        Self {
            infer_rounds: false,
            ..Self::new(session_id, participant_id)
        }
    }

    /// Process a single message
    pub fn process_message(&mut self, message: &ChatMessage) {
        match message.role {
            MessageRole::System => {}
            MessageRole::User => self.process_prompt(&message.content),
            MessageRole::Assistant => self.process_reply(&message.content),
        }
    }

    fn process_prompt(&mut self, content: &str) {
        if content.starts_with(CORRECTION_PREFIX) {
            // The previous reply was rejected by the bot
            if let Some(rejected) = self.pending.take() {
                self.current_round = rejected.round_before;
                self.answered_in_round = rejected.answered_before;
            }
            return;
        }

        self.commit();
        self.prompt = content.to_string();
        self.prompt_has_marker = false;

        if !self.infer_rounds {
            return;
        }
        if let Some(round) = round_marker(content) {
            self.prompt_has_marker = true;
            if round != self.current_round {
                self.current_round = round;
                self.answered_in_round = 0;
            }
        }
    }

    fn process_reply(&mut self, content: &str) {
        // A reply replacing an uncorrected one should not happen, keep the first
        self.commit();

        let Ok(response) = parse_response(content) else {
            return;
        };
        if response.answers.is_empty() {
            return;
        }

        let round_before = self.current_round;
        let answered_before = self.answered_in_round;

        if self.infer_rounds && !self.prompt_has_marker {
            let ids: Vec<&String> = response.answers.keys().collect();
            if looks_like_initial(&ids) && self.answered_in_round > 2 {
                self.current_round += 1;
                self.answered_in_round = 0;
            }
        }

        let prompt = excerpt(&self.prompt);
        let mut rows = Vec::new();
        for (question_id, entry) in &response.answers {
            if question_id == "round" {
                continue;
            }
            rows.push(ResponseRow {
                session_id: self.session_id.clone(),
                participant_id: self.participant_id.clone(),
                round: self.current_round,
                question_id: question_id.clone(),
                answer: entry.answer.clone(),
                reason: entry.reason.clone(),
                summary: response.summary.clone(),
                prompt: prompt.clone(),
            });
            self.answered_in_round += 1;
        }

        self.pending = Some(PendingReply {
            rows,
            round_before,
            answered_before,
        });
    }

    fn commit(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.rows.extend(pending.rows);
        }
    }

    /// Commit the last reply and return all rows
    pub fn finish(mut self) -> Vec<ResponseRow> {
        self.commit();
        self.rows
    }
}

/// Order rows by participant, round, question number and question id
pub fn sort_rows(rows: &mut [ResponseRow]) {
    rows.sort_by(|a, b| {
        a.participant_id
            .cmp(&b.participant_id)
            .then(a.round.cmp(&b.round))
            .then(question_number(&a.question_id).cmp(&question_number(&b.question_id)))
            .then_with(|| a.question_id.cmp(&b.question_id))
    });
}

fn conversation_session(record: &ConversationRecord) -> ParserResult<String> {
    let parms = record.parms()?;
    parms
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ParserError::InvalidConversation {
            id: record.id.clone(),
            reason: "bot_parms has no session_id".to_string(),
        })
}

/// Rows with round tracking; any malformed conversation fails the export
pub fn detailed_rows(session_id: &str, conversations: &[ConversationRecord]) -> ParserResult<Vec<ResponseRow>> {
    let mut rows = Vec::new();

    for record in conversations {
        let record_session = conversation_session(record)?;
        if record_session != session_id {
            continue;
        }

        let mut aggregator = ResponseAggregator::new(&record_session, &record.id);
        for message in record.messages()? {
            aggregator.process_message(&message);
        }
        rows.extend(aggregator.finish());
    }

    sort_rows(&mut rows);
    Ok(rows)
}

/// Rows without round tracking, skipping conversations that cannot be read
pub fn flat_rows(session_id: &str, conversations: &[ConversationRecord]) -> Vec<ResponseRow> {
    let mut rows = Vec::new();

    for record in conversations {
        let messages = match record.messages() {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Skipping conversation {}: {}", record.id, e);
                continue;
            }
        };

        let mut aggregator = ResponseAggregator::flat(session_id, &record.id);
        for message in &messages {
            aggregator.process_message(message);
        }
        rows.extend(aggregator.finish());
    }

    sort_rows(&mut rows);
    rows
}
