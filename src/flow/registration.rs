use crate::message::{Message, MessageBody, SourceTag};
use crate::store::{Collection, Record};
use crate::types::{AgentID, Channel, ConversationID, MessageID, RegistrationID, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Waiting,
    Resolved,
    TimedOut,
    Cancelled,
}

impl RegistrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RegistrationStatus::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Waiting => "WAITING",
            RegistrationStatus::Resolved => "RESOLVED",
            RegistrationStatus::TimedOut => "TIMED_OUT",
            RegistrationStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    /// A newer registration for the same (channel, agent_id) took over
    Superseded,
    /// Cancelled by the controller
    Cancelled,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Superseded => "superseded",
            CancelReason::Cancelled => "cancelled",
        }
    }
}

/// Payload handed to a resolved registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    /// Source message; absent only for hand-written controller payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageID>,
    pub sender_channel: Channel,
    pub source_tag: SourceTag,
    pub body: MessageBody,
    pub delivered_at: Timestamp,
}

impl DeliveredMessage {
    pub fn from_message(message: &Message, delivered_at: Timestamp) -> Self {
        Self {
            message_id: Some(message.id.clone()),
            sender_channel: message.sender_channel.clone(),
            source_tag: message.source_tag,
            body: message.body.clone(),
            delivered_at,
        }
    }
}

/// A waiting party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationID,
    pub channel: Channel,
    pub agent_id: AgentID,
    pub conversation_id: ConversationID,
    /// Text the agent sent when it started waiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: RegistrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_payload: Option<DeliveredMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl Record for Registration {
    const COLLECTION: Collection = Collection::Registrations;
    const KIND: &'static str = "Registration";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Terminal state requested for a registration
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Resolved(DeliveredMessage),
    TimedOut,
    Cancelled(CancelReason),
}

impl Terminal {
    pub fn status(&self) -> RegistrationStatus {
        match self {
            Terminal::Resolved(_) => RegistrationStatus::Resolved,
            Terminal::TimedOut => RegistrationStatus::TimedOut,
            Terminal::Cancelled(_) => RegistrationStatus::Cancelled,
        }
    }
}

/// Result of a requested state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The registration had already left `WAITING`; nothing changed
    Ignored { current: RegistrationStatus },
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Delivered(DeliveredMessage),
    TimedOut,
    Cancelled(CancelReason),
}

impl WaitOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, WaitOutcome::Delivered(_))
    }

    pub fn payload(&self) -> Option<&DeliveredMessage> {
        match self {
            WaitOutcome::Delivered(payload) => Some(payload),
            _ => None,
        }
    }
}

impl Registration {
    pub fn is_waiting(&self) -> bool {
        self.status == RegistrationStatus::Waiting
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    /// Apply `terminal` if still waiting. The only place status changes.
    pub fn transition(&mut self, terminal: Terminal, now: Timestamp) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored {
                current: self.status,
            };
        }
        self.status = terminal.status();
        self.finished_at = Some(now);
        match terminal {
            Terminal::Resolved(payload) => self.resolved_payload = Some(payload),
            Terminal::TimedOut => {}
            Terminal::Cancelled(reason) => self.cancel_reason = Some(reason),
        }
        Transition::Applied
    }

    /// Outcome seen by the blocked caller, once terminal.
    pub fn outcome(&self) -> Option<WaitOutcome> {
        match self.status {
            RegistrationStatus::Waiting => None,
            RegistrationStatus::Resolved => Some(match &self.resolved_payload {
                Some(payload) => WaitOutcome::Delivered(payload.clone()),
                // resolved records always carry a payload; treat a bare one as a timeout
                None => WaitOutcome::TimedOut,
            }),
            RegistrationStatus::TimedOut => Some(WaitOutcome::TimedOut),
            RegistrationStatus::Cancelled => Some(WaitOutcome::Cancelled(
                self.cancel_reason.unwrap_or(CancelReason::Cancelled),
            )),
        }
    }

    /// Time the record stopped changing, for retention
    pub fn settled_at(&self) -> Timestamp {
        self.finished_at.unwrap_or(self.created_at)
    }
}
