use crate::support::file_relay;
use agent_relay::flow::{RegistrationStatus, WaitRequest};
use agent_relay::message::NewMessage;
use chrono::{Duration, Utc};
use tempfile::TempDir;

#[test]
fn stale_idle_conversation_is_deleted() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let receipt = relay.router().submit(NewMessage::to("a", "b", "old news")).unwrap();
    let reg = relay.flow().register_waiting(WaitRequest::new("a", "agent-a").with_participants(["b"])).unwrap();
    relay.flow().cancel(&reg.id).unwrap();

    let report = relay.janitor().sweep_at(Utc::now() + Duration::hours(25));
    assert_eq!(report.deleted_conversations, 1);
    assert_eq!(report.deleted_messages, 1);
    assert_eq!(report.deleted_registrations, 1);
    assert_eq!(report.failures, 0);
    assert!(relay.controller().conversations().unwrap().is_empty());
    assert!(relay.router().get(&receipt.message_id).unwrap_err().is_not_found());
}

#[test]
fn conversation_with_waiter_survives() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let receipt = relay.router().submit(NewMessage::to("a", "b", "still relevant")).unwrap();
    let reg = relay
        .flow()
        .register_waiting(
            WaitRequest::new("a", "agent-a")
                .with_participants(["b"])
                .with_timeout(std::time::Duration::from_secs(3 * 24 * 3600)),
        )
        .unwrap();

    let report = relay.janitor().sweep_at(Utc::now() + Duration::hours(25));
    assert_eq!(report.deleted_conversations, 0);
    assert_eq!(report.deleted_messages, 0);
    assert_eq!(relay.controller().conversations().unwrap().len(), 1);
    assert!(relay.router().get(&receipt.message_id).is_ok());
    assert_eq!(relay.flow().get(&reg.id).unwrap().status, RegistrationStatus::Waiting);
}

#[test]
fn delivered_messages_age_out_of_active_conversations() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let reg = relay
        .flow()
        .register_waiting(
            WaitRequest::new("b", "agent-b")
                .with_participants(["a"])
                .with_timeout(std::time::Duration::from_secs(3 * 24 * 3600)),
        )
        .unwrap();
    let delivered = relay.router().submit(NewMessage::to("a", "b", "read")).unwrap();
    assert_eq!(delivered.deliveries.len(), 1);
    let waiter = relay
        .flow()
        .register_waiting(
            WaitRequest::new("b", "agent-b")
                .with_participants(["a"])
                .with_timeout(std::time::Duration::from_secs(3 * 24 * 3600)),
        )
        .unwrap();
    let unread = relay.router().submit(NewMessage::to("a", "c", "unread")).unwrap();

    let report = relay.janitor().sweep_at(Utc::now() + Duration::hours(25));
    assert_eq!(report.deleted_messages, 2);
    assert_eq!(report.deleted_conversations, 1);
    assert!(relay.router().get(&delivered.message_id).unwrap_err().is_not_found());
    assert!(relay.flow().get(&reg.id).unwrap_err().is_not_found());
    assert!(relay.flow().get(&waiter.id).unwrap().is_waiting());
    // conversation a:c is idle, so its unread message goes with it
    assert!(relay.router().get(&unread.message_id).unwrap_err().is_not_found());
}

#[test]
fn sweep_expires_overdue_waits() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let reg = relay
        .flow()
        .register_waiting(WaitRequest::new("a", "agent-a").with_timeout(std::time::Duration::from_secs(60)))
        .unwrap();

    let report = relay.janitor().sweep_at(Utc::now() + Duration::minutes(2));
    assert_eq!(report.expired, 1);
    assert_eq!(relay.flow().get(&reg.id).unwrap().status, RegistrationStatus::TimedOut);
    // a second sweep finds nothing new to expire
    assert_eq!(relay.janitor().sweep_at(Utc::now() + Duration::minutes(2)).expired, 0);
}
