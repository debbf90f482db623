//! Conversation log parsing
//!
//! This module turns stored bot conversations into response rows:
//! - Round tracking from prompts, with a fallback heuristic
//! - Discarding replies the bot had to correct
//! - Ordering rows for export

pub mod responses;

use thiserror::Error;

/// Parser errors
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid conversation {id}: {reason}")]
    InvalidConversation { id: String, reason: String },
}

/// Result type for parser operations
pub type ParserResult<T> = Result<T, ParserError>;
