//! Messages
//!
//! A message is submitted once and tracked per recipient until every
//! recipient has it. Broadcast messages fan out to all conversation
//! participants except the sender.

use crate::store::{Collection, Record};
use crate::types::{Channel, ConversationID, MessageID, RegistrationID, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Origin of a message; admin messages jump ahead of agent messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Agent,
    Admin,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Agent => "agent",
            SourceTag::Admin => "admin",
        }
    }
}

/// Addressing mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "channel", rename_all = "snake_case")]
pub enum Target {
    /// Pairwise: one named recipient
    Channel(Channel),
    /// Group: every participant of the conversation except the sender
    Broadcast,
}

impl Target {
    pub fn channel(name: impl Into<Channel>) -> Self {
        Target::Channel(name.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    File,
    Folder,
    Image,
}

/// Reference to a file, folder or image; content is never copied into the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

impl Attachment {
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(AttachmentKind::File, path)
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self::new(AttachmentKind::Folder, path)
    }

    pub fn image(path: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            media_type: Some(media_type.into()),
            ..Self::new(AttachmentKind::Image, path)
        }
    }

    fn new(kind: AttachmentKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            media_type: None,
            workspace: None,
        }
    }

    pub fn in_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
}

/// Delivery state of a message for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientState {
    pub status: DeliveryStatus,
    /// Registration that received the message, if it was matched to a wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<RegistrationID>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<Timestamp>,
}

impl RecipientState {
    pub fn pending() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            registration_id: None,
            delivered_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageID,
    pub conversation_id: ConversationID,
    pub sender_channel: Channel,
    pub target: Target,
    pub body: MessageBody,
    pub source_tag: SourceTag,
    pub created_at: Timestamp,
    pub recipients: BTreeMap<Channel, RecipientState>,
}

impl Record for Message {
    const COLLECTION: Collection = Collection::Messages;
    const KIND: &'static str = "Message";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Message {
    pub fn is_pending_for(&self, channel: &str) -> bool {
        self.recipients
            .get(channel)
            .map(RecipientState::is_pending)
            .unwrap_or(false)
    }

    pub fn has_pending(&self) -> bool {
        self.recipients.values().any(RecipientState::is_pending)
    }

    /// Every recipient has the message; only then may it be cleaned up.
    pub fn fully_delivered(&self) -> bool {
        !self.has_pending()
    }

    pub fn pending_recipients(&self) -> Vec<&str> {
        self.recipients
            .iter()
            .filter(|(_, state)| state.is_pending())
            .map(|(channel, _)| channel.as_str())
            .collect()
    }

    /// Latest of creation and any delivery
    pub fn last_activity_at(&self) -> Timestamp {
        self.recipients
            .values()
            .filter_map(|state| state.delivered_at)
            .fold(self.created_at, |latest, at| latest.max(at))
    }
}

/// Input to [`crate::router::MessageRouter::submit`]
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_channel: Channel,
    pub target: Target,
    pub body: MessageBody,
    pub source_tag: SourceTag,
    /// Session key; derived from the participants when absent
    pub conversation_id: Option<ConversationID>,
    /// Extra participants to record on the conversation
    pub participants: Vec<Channel>,
}

impl NewMessage {
    pub fn to(sender: impl Into<Channel>, target: impl Into<Channel>, text: impl Into<String>) -> Self {
        Self::new(sender.into(), Target::Channel(target.into()), text.into())
    }

    pub fn broadcast(sender: impl Into<Channel>, text: impl Into<String>) -> Self {
        Self::new(sender.into(), Target::Broadcast, text.into())
    }

    fn new(sender_channel: Channel, target: Target, text: String) -> Self {
        Self {
            sender_channel,
            target,
            body: MessageBody::text(text),
            source_tag: SourceTag::Agent,
            conversation_id: None,
            participants: Vec::new(),
        }
    }

    pub fn admin(mut self) -> Self {
        self.source_tag = SourceTag::Admin;
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<ConversationID>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_participants<I, S>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Channel>,
    {
        self.participants.extend(participants.into_iter().map(Into::into));
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.body.attachments.push(attachment);
        self
    }
}
