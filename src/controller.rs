//! Controller facade
//!
//! What a human operator sees and does: listings, manual delivery, admin
//! messages and bulk maintenance. Every action goes through the coordinator
//! and router, so it obeys the same delivery rules as agents.

use crate::conversation::{self, Conversation};
use crate::error::RelayError;
use crate::flow::{FlowCoordinator, Registration};
use crate::message::{Message, MessageBody, NewMessage, SourceTag, Target};
use crate::router::{MessageRouter, SubmitReceipt};
use crate::store::{Collection, DurableStore};
use crate::types::{Channel, ConversationID, MessageID, Timestamp};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Sender channel recorded on admin messages
pub const ADMIN_CHANNEL: &str = "admin";

/// Point-in-time view of the relay
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub taken_at: Timestamp,
    pub waiting: Vec<Registration>,
    pub pending: Vec<Message>,
    pub registrations: usize,
    pub messages: usize,
    pub conversations: usize,
}

/// Result of [`Controller::clear_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub cancelled: usize,
    pub deleted: usize,
}

pub struct Controller {
    store: Arc<dyn DurableStore>,
    flow: Arc<FlowCoordinator>,
    router: Arc<MessageRouter>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn DurableStore>,
        flow: Arc<FlowCoordinator>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self { store, flow, router }
    }

    pub fn list_waiting(&self) -> Result<Vec<Registration>, RelayError> {
        self.flow.list_waiting(None)
    }

    pub fn list_pending_messages(&self) -> Result<Vec<Message>, RelayError> {
        self.router.list_pending()
    }

    pub fn conversations(&self) -> Result<Vec<Conversation>, RelayError> {
        conversation::list_recent(self.store.as_ref())
    }

    pub fn deliver(&self, message_id: &str, registration_id: &str) -> Result<bool, RelayError> {
        self.router.deliver_to(message_id, registration_id)
    }

    pub fn cancel(&self, registration_id: &str) -> Result<bool, RelayError> {
        self.flow.cancel(registration_id)
    }

    /// Submit an admin-tagged message.
    ///
    /// Without an explicit conversation, a channel target lands in the most
    /// recently active conversation that channel belongs to. Broadcasts need
    /// a conversation.
    pub fn send_admin(
        &self,
        target: Target,
        text: impl Into<String>,
        conversation_id: Option<ConversationID>,
    ) -> Result<SubmitReceipt, RelayError> {
        let conversation_id = match (conversation_id, &target) {
            (Some(id), _) => Some(id),
            (None, Target::Channel(channel)) => self.latest_conversation_of(channel)?,
            (None, Target::Broadcast) => {
                return Err(RelayError::InvalidRequest(
                    "admin broadcast needs a conversation".to_string(),
                ))
            }
        };

        let mut message = NewMessage {
            sender_channel: ADMIN_CHANNEL.to_string(),
            target,
            body: MessageBody::text(text),
            source_tag: SourceTag::Admin,
            conversation_id: None,
            participants: Vec::new(),
        };
        if let Some(id) = conversation_id {
            message = message.in_conversation(id);
        }
        let receipt = self.router.submit(message)?;
        info!(
            message_id = %receipt.message_id,
            conversation_id = %receipt.conversation_id,
            delivered = receipt.deliveries.len(),
            "Admin message submitted"
        );
        Ok(receipt)
    }

    fn latest_conversation_of(&self, channel: &Channel) -> Result<Option<ConversationID>, RelayError> {
        Ok(self
            .conversations()?
            .into_iter()
            .find(|c| c.participants.contains(channel))
            .map(|c| c.id))
    }

    pub fn status(&self) -> Result<RelayStatus, RelayError> {
        let registrations = self.flow.list_all()?;
        let messages = self.router.list_all()?;
        let conversations = self.conversations()?.len();

        let mut waiting: Vec<Registration> = registrations.iter().filter(|r| r.is_waiting()).cloned().collect();
        waiting.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let pending: Vec<Message> = messages.iter().filter(|m| m.has_pending()).cloned().collect();

        Ok(RelayStatus {
            taken_at: Utc::now(),
            waiting,
            pending,
            registrations: registrations.len(),
            messages: messages.len(),
            conversations,
        })
    }

    pub fn delete_messages(&self, ids: &[MessageID]) -> Result<usize, RelayError> {
        let deleted = self.router.delete_messages(ids)?;
        info!(requested = ids.len(), deleted, "Deleted messages");
        Ok(deleted)
    }

    /// Release every blocked caller, then delete all records.
    pub fn clear_all(&self) -> Result<ClearReport, RelayError> {
        let mut report = ClearReport::default();
        for registration in self.flow.list_waiting(None)? {
            if self.flow.cancel(&registration.id)? {
                report.cancelled += 1;
            }
        }

        for collection in Collection::ALL {
            for (id, _) in self.store.list(collection)? {
                match self.store.delete(collection, &id) {
                    Ok(true) => report.deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(collection = %collection, id = %id, error = %e, "Failed to delete record");
                        return Err(e.into());
                    }
                }
            }
        }

        info!(cancelled = report.cancelled, deleted = report.deleted, "Cleared relay state");
        Ok(report)
    }
}
