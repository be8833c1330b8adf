//! Janitor
//!
//! Best-effort cleanup. A sweep expires overdue waits and removes state
//! older than the retention window. Failures are logged and counted; the
//! next sweep tries again.

mod daemon;

pub use daemon::{JanitorDaemon, JanitorStats};

use crate::config::JanitorConfig;
use crate::conversation::Conversation;
use crate::flow::{FlowCoordinator, Registration};
use crate::message::Message;
use crate::store::{DurableStore, Mutation, Table};
use crate::types::{ConversationID, Timestamp};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Overdue `WAITING` registrations moved to `TIMED_OUT`
    pub expired: usize,
    pub deleted_registrations: usize,
    pub deleted_messages: usize,
    pub deleted_conversations: usize,
    /// Steps that failed and will be retried next sweep
    pub failures: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }

    pub fn absorb(&mut self, other: &SweepReport) {
        self.expired += other.expired;
        self.deleted_registrations += other.deleted_registrations;
        self.deleted_messages += other.deleted_messages;
        self.deleted_conversations += other.deleted_conversations;
        self.failures += other.failures;
    }
}

pub struct Janitor {
    store: Arc<dyn DurableStore>,
    flow: Arc<FlowCoordinator>,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(store: Arc<dyn DurableStore>, flow: Arc<FlowCoordinator>, config: JanitorConfig) -> Self {
        Self { store, flow, config }
    }

    pub fn config(&self) -> &JanitorConfig {
        &self.config
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// One pass as of `now`.
    pub fn sweep_at(&self, now: Timestamp) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = self
            .config
            .retention()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.expire_overdue(now, &mut report);

        let registrations = match Table::<Registration>::new(self.store.as_ref()).list(|_| true) {
            Ok(registrations) => registrations,
            Err(e) => {
                warn!(error = %e, "Sweep could not list registrations");
                report.failures += 1;
                return report;
            }
        };
        let active: HashSet<ConversationID> = registrations
            .iter()
            .filter(|r| r.is_waiting())
            .map(|r| r.conversation_id.clone())
            .collect();

        let removed = self.remove_idle_conversations(cutoff, &active, &mut report);
        self.remove_settled_registrations(&registrations, cutoff, &mut report);
        self.remove_old_messages(cutoff, &active, &removed, &mut report);

        if report.is_empty() {
            debug!("Sweep found nothing to do");
        } else {
            info!(
                expired = report.expired,
                deleted_registrations = report.deleted_registrations,
                deleted_messages = report.deleted_messages,
                deleted_conversations = report.deleted_conversations,
                failures = report.failures,
                "Sweep finished"
            );
        }
        report
    }

    fn expire_overdue(&self, now: Timestamp, report: &mut SweepReport) {
        let overdue = match self.flow.list_waiting(None) {
            Ok(waiting) => waiting.into_iter().filter(|r| r.is_expired(now)),
            Err(e) => {
                warn!(error = %e, "Sweep could not list waiting registrations");
                report.failures += 1;
                return;
            }
        };
        for registration in overdue {
            match self.flow.expire(&registration.id) {
                Ok(true) => {
                    info!(
                        registration_id = %registration.id,
                        channel = %registration.channel,
                        "Expired waiting registration"
                    );
                    report.expired += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(registration_id = %registration.id, error = %e, "Failed to expire registration");
                    report.failures += 1;
                }
            }
        }
    }

    /// Conversations idle past `cutoff` with nobody waiting. Returns the ids removed.
    fn remove_idle_conversations(
        &self,
        cutoff: Timestamp,
        active: &HashSet<ConversationID>,
        report: &mut SweepReport,
    ) -> HashSet<ConversationID> {
        let mut removed = HashSet::new();
        let table = Table::<Conversation>::new(self.store.as_ref());
        let idle = match table.list(|c| c.last_activity_at < cutoff && !active.contains(&c.id)) {
            Ok(idle) => idle,
            Err(e) => {
                warn!(error = %e, "Sweep could not list conversations");
                report.failures += 1;
                return removed;
            }
        };

        for conversation in idle {
            // re-check under the lock; a message may have arrived since the listing
            let deleted = table.atomic_update(&conversation.id, |current| match current {
                Some(current) if current.last_activity_at < cutoff => Ok((Mutation::Delete, true)),
                _ => Ok((Mutation::Keep, false)),
            });
            match deleted {
                Ok(true) => {
                    debug!(conversation_id = %conversation.id, "Deleted idle conversation");
                    report.deleted_conversations += 1;
                    removed.insert(conversation.id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(conversation_id = %conversation.id, error = %e, "Failed to delete conversation");
                    report.failures += 1;
                }
            }
        }
        removed
    }

    fn remove_settled_registrations(
        &self,
        registrations: &[Registration],
        cutoff: Timestamp,
        report: &mut SweepReport,
    ) {
        let table = Table::<Registration>::new(self.store.as_ref());
        let settled = registrations
            .iter()
            .filter(|r| !r.is_waiting() && r.settled_at() < cutoff);
        for registration in settled {
            let deleted = table.atomic_update(&registration.id, |current| match current {
                Some(current) if !current.is_waiting() => Ok((Mutation::Delete, true)),
                _ => Ok((Mutation::Keep, false)),
            });
            match deleted {
                Ok(true) => report.deleted_registrations += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(registration_id = %registration.id, error = %e, "Failed to delete registration");
                    report.failures += 1;
                }
            }
        }
    }

    /// Delivered messages past `cutoff`, plus any old message whose
    /// conversation is gone and not waited on.
    fn remove_old_messages(
        &self,
        cutoff: Timestamp,
        active: &HashSet<ConversationID>,
        removed: &HashSet<ConversationID>,
        report: &mut SweepReport,
    ) {
        let table = Table::<Message>::new(self.store.as_ref());
        let conversations = Table::<Conversation>::new(self.store.as_ref());
        let stale = match table.list(|m| m.last_activity_at() < cutoff) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Sweep could not list messages");
                report.failures += 1;
                return;
            }
        };

        for message in stale {
            let orphaned = removed.contains(&message.conversation_id)
                || (!active.contains(&message.conversation_id)
                    && matches!(conversations.find(&message.conversation_id), Ok(None)));
            if !message.fully_delivered() && !orphaned {
                continue;
            }
            // a delivery may have landed since the listing
            let deleted = table.atomic_update(&message.id, |current| match current {
                Some(current)
                    if current.last_activity_at() < cutoff
                        && (orphaned || current.fully_delivered()) =>
                {
                    Ok((Mutation::Delete, true))
                }
                _ => Ok((Mutation::Keep, false)),
            });
            match deleted {
                Ok(true) => report.deleted_messages += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Failed to delete message");
                    report.failures += 1;
                }
            }
        }
    }
}
