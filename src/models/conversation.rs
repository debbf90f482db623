//! Conversation data types
//!
//! A bot conversation is the ordered list of chat messages exchanged with
//! the LLM while the bot worked through the experiment pages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Stored conversation row
///
/// `bot_parms` and `conversation` are kept as raw JSON text, exactly as
/// written by the bot, so that exports can re-parse them defensively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Participant code of the bot
    pub id: String,
    pub session_id: String,
    pub bot_parms: String,
    pub conversation: String,
}

impl ConversationRecord {
    /// Parse the bot parameters blob
    pub fn parms(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.bot_parms)
    }

    /// Parse the message list
    pub fn messages(&self) -> serde_json::Result<Vec<ChatMessage>> {
        serde_json::from_str(&self.conversation)
    }
}
