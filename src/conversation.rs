//! Conversations: the session record grouping messages and registrations.

use crate::error::RelayError;
use crate::store::{Collection, DurableStore, Mutation, Record, Table};
use crate::types::{Channel, ConversationID, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

const KEY_PREFIX: &str = "conv:";
const MAX_KEY_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationID,
    pub participants: BTreeSet<Channel>,
    pub created_at: Timestamp,
    pub last_activity_at: Timestamp,
}

impl Record for Conversation {
    const COLLECTION: Collection = Collection::Conversations;
    const KIND: &'static str = "Conversation";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Conversation {
    /// Pairwise sessions have exactly two participants.
    pub fn is_pairwise(&self) -> bool {
        self.participants.len() == 2
    }
}

/// Default session key for a set of channels.
///
/// Channels are sorted and deduplicated, so both sides of a pair derive the
/// same key. Keys too long to be record ids are replaced by a stable hash.
pub fn session_key<'a, I>(participants: I) -> ConversationID
where
    I: IntoIterator<Item = &'a str>,
{
    let sorted: BTreeSet<&str> = participants.into_iter().collect();
    let joined = sorted.into_iter().collect::<Vec<_>>().join(":");
    let key = format!("{}{}", KEY_PREFIX, joined);
    if key.len() <= MAX_KEY_LEN {
        key
    } else {
        format!("{}h{:016x}", KEY_PREFIX, fnv1a(joined.as_bytes()))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Create the conversation or merge `participants` into it and bump its
/// activity time. Returns the record as stored.
pub fn touch<'a, I>(
    store: &dyn DurableStore,
    id: &str,
    participants: I,
    now: Timestamp,
) -> Result<Conversation, RelayError>
where
    I: IntoIterator<Item = &'a str>,
{
    let joining: Vec<&str> = participants.into_iter().collect();
    Table::<Conversation>::new(store).atomic_update(id, |current| {
        let conversation = match current {
            Some(mut conversation) => {
                conversation
                    .participants
                    .extend(joining.iter().map(|p| p.to_string()));
                conversation.last_activity_at = conversation.last_activity_at.max(now);
                conversation
            }
            None => {
                debug!(conversation_id = %id, participants = joining.len(), "Created conversation");
                Conversation {
                    id: id.to_string(),
                    participants: joining.iter().map(|p| p.to_string()).collect(),
                    created_at: now,
                    last_activity_at: now,
                }
            }
        };
        Ok((Mutation::Put(conversation.clone()), conversation))
    })
}

/// All conversations, most recently active first.
pub fn list_recent(store: &dyn DurableStore) -> Result<Vec<Conversation>, RelayError> {
    let mut conversations = Table::<Conversation>::new(store).list(|_| true)?;
    conversations.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(conversations)
}
