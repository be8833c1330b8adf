use agent_relay::flow::{
    CancelReason, DeliveredMessage, Registration, RegistrationStatus, Terminal,
};
use agent_relay::message::{Message, MessageBody, SourceTag, Target};
use agent_relay::router::{delivery_order, PendingSnapshot};
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn waiting() -> Registration {
    let now = Utc::now();
    Registration {
        id: "r".to_string(),
        channel: "c".to_string(),
        agent_id: "a".to_string(),
        conversation_id: "conv:c".to_string(),
        message: None,
        created_at: now,
        expires_at: now + Duration::seconds(60),
        status: RegistrationStatus::Waiting,
        resolved_payload: None,
        cancel_reason: None,
        finished_at: None,
    }
}

fn terminal_strategy() -> impl Strategy<Value = Terminal> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|text| Terminal::Resolved(DeliveredMessage {
            message_id: None,
            sender_channel: "s".to_string(),
            source_tag: SourceTag::Agent,
            body: MessageBody::text(text),
            delivered_at: Utc::now(),
        })),
        Just(Terminal::TimedOut),
        Just(Terminal::Cancelled(CancelReason::Cancelled)),
        Just(Terminal::Cancelled(CancelReason::Superseded)),
    ]
}

fn message(id: usize, admin: bool, offset_secs: i64) -> Message {
    Message {
        id: format!("m{:03}", id),
        conversation_id: "c".to_string(),
        sender_channel: "s".to_string(),
        target: Target::channel("r"),
        body: MessageBody::text("x"),
        source_tag: if admin { SourceTag::Admin } else { SourceTag::Agent },
        created_at: Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap(),
        recipients: BTreeMap::new(),
    }
}

proptest! {
    #[test]
    fn first_transition_wins(transitions in prop::collection::vec(terminal_strategy(), 1..8)) {
        let mut registration = waiting();
        let first = transitions[0].status();
        for (i, terminal) in transitions.into_iter().enumerate() {
            let applied = registration.transition(terminal, Utc::now()).applied();
            prop_assert_eq!(applied, i == 0);
            prop_assert_eq!(registration.status, first);
        }
        prop_assert!(registration.outcome().is_some());
        prop_assert_eq!(registration.resolved_payload.is_some(), first == RegistrationStatus::Resolved);
        prop_assert_eq!(registration.cancel_reason.is_some(), first == RegistrationStatus::Cancelled);
    }

    #[test]
    fn snapshot_yields_admin_first_then_fifo(
        specs in prop::collection::vec((any::<bool>(), 0i64..50), 0..40)
    ) {
        let messages: Vec<Message> = specs
            .iter()
            .enumerate()
            .map(|(i, (admin, offset))| message(i, *admin, *offset))
            .collect();
        let ordered: Vec<Message> = PendingSnapshot::new(messages.clone()).collect();
        prop_assert_eq!(ordered.len(), messages.len());

        for pair in ordered.windows(2) {
            prop_assert_ne!(delivery_order(&pair[0], &pair[1]), Ordering::Greater);
            if pair[0].source_tag == pair[1].source_tag {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
            } else {
                prop_assert_eq!(pair[0].source_tag, SourceTag::Admin);
            }
        }
    }
}
