//! Core identifier types shared across the relay.

use chrono::{DateTime, Utc};

/// Logical identity of a participant role, e.g. `agent_chat_1`.
pub type Channel = String;

/// AgentID: caller-supplied identity of one agent instance
pub type AgentID = String;

/// RegistrationID: UUID assigned when an agent starts waiting
pub type RegistrationID = String;

/// MessageID: UUID assigned when a message is accepted
pub type MessageID = String;

/// ConversationID: session key grouping messages and registrations
pub type ConversationID = String;

/// Wall-clock timestamp used on every persisted record
pub type Timestamp = DateTime<Utc>;

/// Generate a fresh record identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Longest accepted channel or agent name
pub const MAX_NAME_LEN: usize = 64;

/// Check a channel or agent name: non-empty, at most [`MAX_NAME_LEN`]
/// characters from `[A-Za-z0-9_.-]`.
pub fn validate_name(kind: &str, name: &str) -> Result<(), crate::error::RelayError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(crate::error::RelayError::InvalidRequest(format!(
            "invalid {} {:?}: use 1-{} characters from [A-Za-z0-9_.-]",
            kind, name, MAX_NAME_LEN
        )))
    }
}
