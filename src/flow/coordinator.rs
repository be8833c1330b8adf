use super::registration::{
    CancelReason, DeliveredMessage, Registration, RegistrationStatus, Terminal, Transition,
    WaitOutcome,
};
use crate::config::FlowConfig;
use crate::conversation;
use crate::error::RelayError;
use crate::store::{DurableStore, Mutation, Table};
use crate::types::{new_id, validate_name, Channel, ConversationID};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything needed to start waiting
#[derive(Debug, Clone)]
pub struct WaitRequest {
    pub channel: Channel,
    pub agent_id: String,
    /// Session key; derived from `channel` and `participants` when absent
    pub conversation_id: Option<ConversationID>,
    pub participants: Vec<Channel>,
    pub message: Option<String>,
    /// Falls back to the configured default
    pub timeout: Option<Duration>,
}

impl WaitRequest {
    pub fn new(channel: impl Into<Channel>, agent_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            agent_id: agent_id.into(),
            conversation_id: None,
            participants: Vec::new(),
            message: None,
            timeout: None,
        }
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

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check names and the timeout range; returns the effective wait length.
    pub fn validate(&self, default_timeout: Duration) -> Result<chrono::Duration, RelayError> {
        validate_name("channel", &self.channel)?;
        validate_name("agent id", &self.agent_id)?;
        for participant in &self.participants {
            validate_name("participant", participant)?;
        }

        let timeout = self.timeout.unwrap_or(default_timeout);
        chrono::Duration::from_std(timeout)
            .ok()
            .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or_else(|| {
                RelayError::InvalidRequest(format!("timeout {:?} is out of range", timeout))
            })
    }
}

/// Register / wait / resolve over the durable store.
///
/// Holds no registration state of its own: every operation re-reads the
/// record, and every transition is a single locked update, so any number of
/// processes can share one store.
pub struct FlowCoordinator {
    store: Arc<dyn DurableStore>,
    config: FlowConfig,
}

impl FlowCoordinator {
    pub fn new(store: Arc<dyn DurableStore>, config: FlowConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    fn registrations(&self) -> Table<'_, Registration> {
        Table::new(self.store.as_ref())
    }

    /// Persist a new `WAITING` registration, superseding any earlier wait of
    /// the same `(channel, agent_id)`.
    pub fn register_waiting(&self, request: WaitRequest) -> Result<Registration, RelayError> {
        let ttl = request.validate(self.config.default_timeout())?;
        let now = Utc::now();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            RelayError::InvalidRequest(format!("timeout {:?} is out of range", ttl))
        })?;

        let mut members: Vec<&str> = request.participants.iter().map(String::as_str).collect();
        members.push(&request.channel);
        let conversation_id = match &request.conversation_id {
            Some(id) => id.clone(),
            None => conversation::session_key(members.iter().copied()),
        };

        let registration = Registration {
            id: new_id(),
            channel: request.channel.clone(),
            agent_id: request.agent_id.clone(),
            conversation_id: conversation_id.clone(),
            message: request.message.clone(),
            created_at: now,
            expires_at,
            status: RegistrationStatus::Waiting,
            resolved_payload: None,
            cancel_reason: None,
            finished_at: None,
        };

        let superseded = self.registrations().locked(|table| {
            let earlier = table.list(|r| {
                r.is_waiting() && r.channel == request.channel && r.agent_id == request.agent_id
            })?;
            let mut superseded = Vec::with_capacity(earlier.len());
            for mut previous in earlier {
                if previous
                    .transition(Terminal::Cancelled(CancelReason::Superseded), now)
                    .applied()
                {
                    table.put(&previous)?;
                    superseded.push(previous.id);
                }
            }
            table.put(&registration)?;
            Ok(superseded)
        })?;

        for previous in &superseded {
            info!(
                registration_id = %previous,
                superseded_by = %registration.id,
                channel = %registration.channel,
                agent_id = %registration.agent_id,
                "Superseded waiting registration"
            );
        }

        conversation::touch(self.store.as_ref(), &conversation_id, members, now)?;

        debug!(
            registration_id = %registration.id,
            channel = %registration.channel,
            agent_id = %registration.agent_id,
            conversation_id = %conversation_id,
            expires_at = %registration.expires_at,
            "Registered waiting"
        );
        Ok(registration)
    }

    /// Block until the registration is terminal or `timeout` elapses.
    ///
    /// The deadline is the earlier of `now + timeout` and the registration's
    /// `expires_at`. On the deadline the registration is expired; if that
    /// loses to a concurrent resolve, the delivered payload is returned.
    pub fn wait_for_delivery(
        &self,
        registration_id: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, RelayError> {
        let started = Instant::now();
        let poll = self.config.poll_interval();
        let mut seen = false;

        loop {
            let registration = match self.registrations().find(registration_id)? {
                Some(registration) => registration,
                None if seen => {
                    warn!(registration_id, "Registration vanished while waiting");
                    return Ok(WaitOutcome::Cancelled(CancelReason::Cancelled));
                }
                None => return Err(RelayError::registration_not_found(registration_id)),
            };
            seen = true;

            if let Some(outcome) = registration.outcome() {
                return Ok(outcome);
            }

            let elapsed = started.elapsed();
            let until_expiry = (registration.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let remaining = timeout.saturating_sub(elapsed).min(until_expiry);
            if remaining.is_zero() {
                return self.settle_timeout(registration_id);
            }
            std::thread::sleep(poll.min(remaining));
        }
    }

    fn settle_timeout(&self, registration_id: &str) -> Result<WaitOutcome, RelayError> {
        self.expire(registration_id)?;
        let registration = self.registrations().get(registration_id)?;
        Ok(registration.outcome().unwrap_or(WaitOutcome::TimedOut))
    }

    /// `WAITING -> RESOLVED` with `payload`. False when no longer waiting.
    pub fn resolve(&self, registration_id: &str, payload: DeliveredMessage) -> Result<bool, RelayError> {
        let applied = self.finish(registration_id, Terminal::Resolved(payload))?;
        Ok(applied.applied())
    }

    /// `WAITING -> CANCELLED` by the controller.
    pub fn cancel(&self, registration_id: &str) -> Result<bool, RelayError> {
        let applied = self.finish(registration_id, Terminal::Cancelled(CancelReason::Cancelled))?;
        Ok(applied.applied())
    }

    /// `WAITING -> TIMED_OUT`; shared by the wait loop and the janitor.
    pub fn expire(&self, registration_id: &str) -> Result<bool, RelayError> {
        let applied = self.finish(registration_id, Terminal::TimedOut)?;
        Ok(applied.applied())
    }

    fn finish(&self, registration_id: &str, terminal: Terminal) -> Result<Transition, RelayError> {
        let requested = terminal.status();
        let transition = self.registrations().atomic_update(registration_id, |current| {
            let mut registration =
                current.ok_or_else(|| RelayError::registration_not_found(registration_id))?;
            let transition = registration.transition(terminal, Utc::now());
            let mutation = if transition.applied() {
                Mutation::Put(registration)
            } else {
                Mutation::Keep
            };
            Ok((mutation, transition))
        })?;

        match transition {
            Transition::Applied => {
                debug!(registration_id, status = %requested, "Registration finished")
            }
            Transition::Ignored { current } => debug!(
                registration_id,
                current = %current,
                requested = %requested,
                "Ignored transition out of terminal state"
            ),
        }
        Ok(transition)
    }

    pub fn get(&self, registration_id: &str) -> Result<Registration, RelayError> {
        self.registrations().get(registration_id)
    }

    /// Waiting registrations, oldest first, optionally for one channel.
    pub fn list_waiting(&self, channel: Option<&str>) -> Result<Vec<Registration>, RelayError> {
        let mut waiting = self.registrations().list(|r| {
            r.is_waiting() && channel.map(|c| r.channel == c).unwrap_or(true)
        })?;
        waiting.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(waiting)
    }

    pub fn list_all(&self) -> Result<Vec<Registration>, RelayError> {
        self.registrations().list(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, SourceTag};
    use crate::store::SledStore;

    fn coordinator() -> FlowCoordinator {
        let config = FlowConfig {
            poll_interval_ms: 5,
            ..FlowConfig::default()
        };
        FlowCoordinator::new(Arc::new(SledStore::temporary().unwrap()), config)
    }

    fn payload(text: &str) -> DeliveredMessage {
        DeliveredMessage {
            message_id: Some("m1".to_string()),
            sender_channel: "agent_chat_2".to_string(),
            source_tag: SourceTag::Agent,
            body: MessageBody::text(text),
            delivered_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_derives_conversation() {
        let flow = coordinator();
        let reg = flow
            .register_waiting(WaitRequest::new("agent_chat_1", "a1").with_participants(["agent_chat_2"]))
            .unwrap();
        assert_eq!(reg.conversation_id, "conv:agent_chat_1:agent_chat_2");
        assert!(reg.is_waiting());
        assert!(reg.expires_at > reg.created_at);
    }

    #[test]
    fn test_register_rejects_bad_channel() {
        let flow = coordinator();
        let err = flow.register_waiting(WaitRequest::new("bad channel", "a1")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[test]
    fn test_register_rejects_out_of_range_timeout() {
        let flow = coordinator();
        let request = WaitRequest::new("c1", "a1").with_timeout(Duration::from_secs(u64::MAX / 2));
        assert!(matches!(
            request.validate(Duration::from_secs(1)),
            Err(RelayError::InvalidRequest(_))
        ));
        let err = flow.register_waiting(request).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
        assert!(flow.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_new_registration_supersedes_old() {
        let flow = coordinator();
        let first = flow.register_waiting(WaitRequest::new("c1", "a1")).unwrap();
        let other_agent = flow.register_waiting(WaitRequest::new("c1", "a2")).unwrap();
        let second = flow.register_waiting(WaitRequest::new("c1", "a1")).unwrap();

        let first = flow.get(&first.id).unwrap();
        assert_eq!(first.status, RegistrationStatus::Cancelled);
        assert_eq!(first.cancel_reason, Some(CancelReason::Superseded));
        assert!(flow.get(&other_agent.id).unwrap().is_waiting());

        let waiting: Vec<_> = flow.list_waiting(Some("c1")).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(waiting, vec![other_agent.id, second.id]);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let flow = coordinator();
        let reg = flow.register_waiting(WaitRequest::new("c1", "a1")).unwrap();
        assert!(flow.resolve(&reg.id, payload("first")).unwrap());
        assert!(!flow.resolve(&reg.id, payload("second")).unwrap());
        assert!(!flow.expire(&reg.id).unwrap());
        assert!(!flow.cancel(&reg.id).unwrap());

        let outcome = flow.wait_for_delivery(&reg.id, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.payload().unwrap().body.text, "first");
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let flow = coordinator();
        assert!(flow.resolve("missing", payload("x")).unwrap_err().is_not_found());
        assert!(flow.wait_for_delivery("missing", Duration::from_millis(10)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_wait_times_out() {
        let flow = coordinator();
        let reg = flow.register_waiting(WaitRequest::new("c1", "a1")).unwrap();
        let started = Instant::now();
        let outcome = flow.wait_for_delivery(&reg.id, Duration::from_millis(50)).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(flow.get(&reg.id).unwrap().status, RegistrationStatus::TimedOut);
    }

    #[test]
    fn test_wait_stops_at_expiry() {
        let flow = coordinator();
        let reg = flow
            .register_waiting(WaitRequest::new("c1", "a1").with_timeout(Duration::from_millis(30)))
            .unwrap();
        let started = Instant::now();
        let outcome = flow.wait_for_delivery(&reg.id, Duration::from_secs(10)).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_returns_cancellation() {
        let flow = Arc::new(coordinator());
        let reg = flow.register_waiting(WaitRequest::new("c1", "a1")).unwrap();
        let canceller = {
            let flow = flow.clone();
            let id = reg.id.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                flow.cancel(&id).unwrap()
            })
        };
        let outcome = flow.wait_for_delivery(&reg.id, Duration::from_secs(5)).unwrap();
        assert!(canceller.join().unwrap());
        assert_eq!(outcome, WaitOutcome::Cancelled(CancelReason::Cancelled));
    }
}
