//! Message Router
//!
//! Persists submitted messages and pairs pending messages with waiting
//! registrations. Each pairing first claims the message for the recipient
//! (`PENDING -> DELIVERED`), then resolves the registration; a refused
//! resolve reverts the claim. A recipient therefore gets a message at most
//! once no matter how many dispatchers race.

mod ordering;

pub use ordering::{delivery_order, PendingSnapshot};

use crate::conversation;
use crate::error::RelayError;
use crate::flow::{DeliveredMessage, FlowCoordinator};
use crate::message::{DeliveryStatus, Message, NewMessage, RecipientState, SourceTag, Target};
use crate::store::{DurableStore, Mutation, Table};
use crate::types::{new_id, validate_name, Channel, ConversationID, MessageID, RegistrationID};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// One message handed to one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageID,
    pub registration_id: RegistrationID,
    pub channel: Channel,
}

/// What `submit` accepted and what it delivered right away
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub message_id: MessageID,
    pub conversation_id: ConversationID,
    pub recipients: Vec<Channel>,
    pub deliveries: Vec<Delivery>,
}

pub struct MessageRouter {
    store: Arc<dyn DurableStore>,
    flow: Arc<FlowCoordinator>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn DurableStore>, flow: Arc<FlowCoordinator>) -> Self {
        Self { store, flow }
    }

    fn messages(&self) -> Table<'_, Message> {
        Table::new(self.store.as_ref())
    }

    /// Persist `new` and deliver whatever can be delivered now.
    pub fn submit(&self, new: NewMessage) -> Result<SubmitReceipt, RelayError> {
        validate_name("sender channel", &new.sender_channel)?;
        if let Target::Channel(target) = &new.target {
            validate_name("target channel", target)?;
            if *target == new.sender_channel {
                return Err(RelayError::InvalidRequest(format!(
                    "channel {} cannot send to itself",
                    target
                )));
            }
        }
        for participant in &new.participants {
            validate_name("participant", participant)?;
        }
        if new.body.is_empty() {
            return Err(RelayError::InvalidRequest("message body is empty".to_string()));
        }

        // admin senders are not conversation members and never receive broadcasts
        let mut members: Vec<&str> = new.participants.iter().map(String::as_str).collect();
        if new.source_tag == SourceTag::Agent {
            members.push(&new.sender_channel);
        }
        if let Target::Channel(target) = &new.target {
            members.push(target);
        }

        let conversation_id = match &new.conversation_id {
            Some(id) => id.clone(),
            None if new.target == Target::Broadcast && members.len() < 2 => {
                return Err(RelayError::InvalidRequest(
                    "broadcast needs a conversation or participants".to_string(),
                ))
            }
            None => {
                let mut keyed = members.clone();
                keyed.push(&new.sender_channel);
                conversation::session_key(keyed)
            }
        };

        let now = Utc::now();
        let conversation = conversation::touch(self.store.as_ref(), &conversation_id, members, now)?;

        let recipients: Vec<Channel> = match &new.target {
            Target::Channel(target) => vec![target.clone()],
            Target::Broadcast => conversation
                .participants
                .iter()
                .filter(|p| **p != new.sender_channel)
                .cloned()
                .collect(),
        };
        if recipients.is_empty() {
            return Err(RelayError::InvalidRequest(format!(
                "conversation {} has no recipients besides {}",
                conversation_id, new.sender_channel
            )));
        }

        let message = Message {
            id: new_id(),
            conversation_id: conversation_id.clone(),
            sender_channel: new.sender_channel,
            target: new.target,
            body: new.body,
            source_tag: new.source_tag,
            created_at: now,
            recipients: recipients
                .iter()
                .map(|r| (r.clone(), RecipientState::pending()))
                .collect::<BTreeMap<_, _>>(),
        };
        self.messages().put(&message)?;
        info!(
            message_id = %message.id,
            conversation_id = %conversation_id,
            sender = %message.sender_channel,
            source = message.source_tag.as_str(),
            recipients = recipients.len(),
            "Accepted message"
        );

        let mut deliveries = Vec::new();
        for recipient in &recipients {
            deliveries.extend(self.dispatch(recipient)?);
        }

        Ok(SubmitReceipt {
            message_id: message.id,
            conversation_id,
            recipients,
            deliveries,
        })
    }

    /// Pair pending messages for `channel` with its waiting registrations
    /// until either side runs out.
    pub fn dispatch(&self, channel: &str) -> Result<Vec<Delivery>, RelayError> {
        let mut deliveries = Vec::new();
        let mut refused: HashSet<RegistrationID> = HashSet::new();

        loop {
            let waiting = self.flow.list_waiting(Some(channel))?;
            let Some(registration) = waiting.into_iter().find(|r| !refused.contains(&r.id)) else {
                break;
            };
            let Some(message) = self.pending_for(channel)?.next() else {
                break;
            };

            if !self.claim(&message.id, channel, &registration.id)? {
                // taken by another dispatcher; look again
                continue;
            }

            let payload = DeliveredMessage::from_message(&message, Utc::now());
            if self.flow.resolve(&registration.id, payload)? {
                info!(
                    message_id = %message.id,
                    registration_id = %registration.id,
                    channel,
                    source = message.source_tag.as_str(),
                    "Delivered message"
                );
                deliveries.push(Delivery {
                    message_id: message.id,
                    registration_id: registration.id,
                    channel: channel.to_string(),
                });
            } else {
                self.release(&message.id, channel, &registration.id)?;
                debug!(
                    registration_id = %registration.id,
                    message_id = %message.id,
                    "Registration left WAITING before delivery; claim reverted"
                );
                refused.insert(registration.id);
            }
        }

        Ok(deliveries)
    }

    /// `PENDING -> DELIVERED` for `channel`, recording the registration.
    fn claim(&self, message_id: &str, channel: &str, registration_id: &str) -> Result<bool, RelayError> {
        self.messages().atomic_update(message_id, |current| {
            let Some(mut message) = current else {
                return Ok((Mutation::Keep, false));
            };
            match message.recipients.get_mut(channel) {
                Some(state) if state.is_pending() => {
                    state.status = DeliveryStatus::Delivered;
                    state.registration_id = Some(registration_id.to_string());
                    state.delivered_at = Some(Utc::now());
                    Ok((Mutation::Put(message), true))
                }
                _ => Ok((Mutation::Keep, false)),
            }
        })
    }

    /// Undo a claim made for `registration_id`.
    fn release(&self, message_id: &str, channel: &str, registration_id: &str) -> Result<(), RelayError> {
        self.messages().atomic_update(message_id, |current| {
            let Some(mut message) = current else {
                return Ok((Mutation::Keep, ()));
            };
            match message.recipients.get_mut(channel) {
                Some(state) if state.registration_id.as_deref() == Some(registration_id) => {
                    *state = RecipientState::pending();
                    Ok((Mutation::Put(message), ()))
                }
                _ => Ok((Mutation::Keep, ())),
            }
        })
    }

    /// Undelivered messages addressed to `channel`, in delivery order.
    pub fn pending_for(&self, channel: &str) -> Result<PendingSnapshot, RelayError> {
        let pending = self.messages().list(|m| m.is_pending_for(channel))?;
        Ok(PendingSnapshot::new(pending))
    }

    /// Every message with at least one pending recipient, in delivery order.
    pub fn list_pending(&self) -> Result<Vec<Message>, RelayError> {
        let mut pending = self.messages().list(Message::has_pending)?;
        pending.sort_by(delivery_order);
        Ok(pending)
    }

    /// Mark `recipient`'s copy delivered without a registration.
    ///
    /// Returns false if it was already delivered. Unknown recipients are an
    /// invalid request.
    pub fn mark_delivered(&self, message_id: &str, recipient: &str) -> Result<bool, RelayError> {
        let changed = self.messages().atomic_update(message_id, |current| {
            let mut message = current.ok_or_else(|| RelayError::message_not_found(message_id))?;
            let state = message.recipients.get_mut(recipient).ok_or_else(|| {
                RelayError::InvalidRequest(format!(
                    "{} is not a recipient of message {}",
                    recipient, message_id
                ))
            })?;
            if !state.is_pending() {
                return Ok((Mutation::Keep, false));
            }
            state.status = DeliveryStatus::Delivered;
            state.delivered_at = Some(Utc::now());
            Ok((Mutation::Put(message), true))
        })?;
        if changed {
            debug!(message_id, recipient, "Marked delivered");
        }
        Ok(changed)
    }

    /// Hand a specific message to a specific waiting registration.
    ///
    /// When the registration's channel is a pending recipient the usual
    /// claim protocol applies. Otherwise the message is forwarded as is and
    /// its own delivery state is left alone.
    pub fn deliver_to(&self, message_id: &str, registration_id: &str) -> Result<bool, RelayError> {
        let registration = self.flow.get(registration_id)?;
        let message = self.get(message_id)?;
        if !registration.is_waiting() {
            debug!(registration_id, status = %registration.status, "Deliver skipped; not waiting");
            return Ok(false);
        }

        let channel = registration.channel.as_str();
        let claimed = message.is_pending_for(channel) && self.claim(message_id, channel, registration_id)?;
        let payload = DeliveredMessage::from_message(&message, Utc::now());
        let resolved = self.flow.resolve(registration_id, payload)?;
        if claimed && !resolved {
            self.release(message_id, channel, registration_id)?;
        }
        if resolved {
            info!(message_id, registration_id, channel, claimed, "Delivered message on request");
        }
        Ok(resolved)
    }

    pub fn get(&self, message_id: &str) -> Result<Message, RelayError> {
        self.messages().get(message_id)
    }

    pub fn list_all(&self) -> Result<Vec<Message>, RelayError> {
        let mut messages = self.messages().list(|_| true)?;
        messages.sort_by(delivery_order);
        Ok(messages)
    }

    /// Delete messages by id; returns how many existed.
    pub fn delete_messages(&self, ids: &[MessageID]) -> Result<usize, RelayError> {
        let mut deleted = 0;
        for id in ids {
            let existed = self.messages().atomic_update(id, |current| {
                Ok(match current {
                    Some(_) => (Mutation::Delete, true),
                    None => (Mutation::Keep, false),
                })
            })?;
            if existed {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
