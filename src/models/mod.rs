//! Data models module
//!
//! Contains the records stored in the conversation log:
//! - Participant types
//! - Chat message and conversation types

pub mod participant;
pub mod conversation;
