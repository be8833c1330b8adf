use crate::support::{file_relay, wait_until};
use agent_relay::flow::{CancelReason, RegistrationStatus, WaitRequest};
use agent_relay::message::{Attachment, NewMessage, SourceTag, Target};
use agent_relay::store::Collection;
use agent_relay::{ToolCall, WaitOutcome};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[test]
fn wait_resolves_when_reply_arrives() {
    let dir = TempDir::new().unwrap();
    let waiter = file_relay(dir.path());
    let sender = file_relay(dir.path());

    let replier = thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        sender
            .router()
            .submit(NewMessage::to("agent_chat_2", "agent_chat_1", "reply at one second"))
            .unwrap()
    });

    let started = Instant::now();
    let reply = waiter
        .call(
            ToolCall::new("agent_chat_1", "a1", Target::channel("agent_chat_2"), "question")
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();
    let elapsed = started.elapsed();
    let receipt = replier.join().unwrap();

    assert!(reply.is_delivered());
    assert!(elapsed >= Duration::from_millis(900), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "returned late: {:?}", elapsed);
    assert_eq!(receipt.deliveries.len(), 1);
    assert!(reply.render().starts_with("reply at one second"));
}

#[test]
fn two_agents_hold_a_conversation() {
    let dir = TempDir::new().unwrap();
    let first = Arc::new(file_relay(dir.path()));
    let second = Arc::new(file_relay(dir.path()));

    let b = {
        let relay = second.clone();
        thread::spawn(move || {
            // B listens first, then answers what it hears
            let heard = relay
                .call(
                    ToolCall::new("agent_chat_2", "b", Target::channel("agent_chat_1"), "")
                        .with_timeout(Duration::from_secs(5)),
                )
                .unwrap();
            let text = heard.outcome.payload().unwrap().body.text.clone();
            relay
                .call(
                    ToolCall::new("agent_chat_2", "b", Target::channel("agent_chat_1"), format!("echo: {}", text))
                        .with_timeout(Duration::from_millis(200)),
                )
                .unwrap()
        })
    };

    assert!(wait_until(Duration::from_secs(5), || {
        !first.flow().list_waiting(Some("agent_chat_2")).unwrap().is_empty()
    }));
    let reply = first
        .call(
            ToolCall::new("agent_chat_1", "a", Target::channel("agent_chat_2"), "ping")
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    assert_eq!(reply.outcome.payload().unwrap().body.text, "echo: ping");
    assert_eq!(reply.conversation_id, "conv:agent_chat_1:agent_chat_2");
    let last = b.join().unwrap();
    assert_eq!(last.outcome, WaitOutcome::TimedOut);
}

#[test]
fn broadcast_fans_out_to_group() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let mut registrations = Vec::new();
    for channel in ["b", "c", "d"] {
        registrations.push(
            relay
                .flow()
                .register_waiting(WaitRequest::new(channel, format!("agent-{}", channel)).in_conversation("team"))
                .unwrap(),
        );
    }

    let receipt = relay
        .router()
        .submit(NewMessage::broadcast("a", "standup").in_conversation("team"))
        .unwrap();
    assert_eq!(receipt.recipients.len(), 3);
    assert_eq!(receipt.deliveries.len(), 3);
    for registration in registrations {
        let registration = relay.flow().get(&registration.id).unwrap();
        assert_eq!(registration.status, RegistrationStatus::Resolved);
    }
    assert!(relay.router().get(&receipt.message_id).unwrap().fully_delivered());
}

#[test]
fn admin_message_delivered_before_older_agent_messages() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    relay.router().submit(NewMessage::to("a", "b", "first")).unwrap();
    relay.router().submit(NewMessage::to("a", "b", "second")).unwrap();
    relay
        .controller()
        .send_admin(Target::channel("b"), "override", None)
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let reply = relay
            .call(ToolCall::new("b", "agent-b", Target::channel("a"), "").with_timeout(Duration::from_secs(2)))
            .unwrap();
        let payload = reply.outcome.payload().unwrap().clone();
        seen.push((payload.source_tag, payload.body.text));
    }
    assert_eq!(
        seen,
        vec![
            (SourceTag::Admin, "override".to_string()),
            (SourceTag::Agent, "first".to_string()),
            (SourceTag::Agent, "second".to_string()),
        ]
    );
}

#[test]
fn superseded_caller_is_released() {
    let dir = TempDir::new().unwrap();
    let relay = Arc::new(file_relay(dir.path()));
    let first = {
        let relay = relay.clone();
        thread::spawn(move || {
            relay
                .call(ToolCall::new("a", "same-agent", Target::channel("b"), "").with_timeout(Duration::from_secs(5)))
                .unwrap()
        })
    };
    assert!(wait_until(Duration::from_secs(5), || {
        !relay.flow().list_waiting(Some("a")).unwrap().is_empty()
    }));
    relay
        .flow()
        .register_waiting(WaitRequest::new("a", "same-agent").with_participants(["b"]))
        .unwrap();

    let reply = first.join().unwrap();
    assert_eq!(reply.outcome, WaitOutcome::Cancelled(CancelReason::Superseded));
    assert!(reply.render().contains("superseded"));
}

#[test]
fn attachments_travel_with_the_reply() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let reg = relay.flow().register_waiting(WaitRequest::new("a", "agent-a")).unwrap();
    let message = NewMessage::to("b", "a", "look")
        .with_attachment(Attachment::folder("src").in_workspace("relay"))
        .with_attachment(Attachment::file("Cargo.toml"));
    relay.router().submit(message).unwrap();

    let outcome = relay.flow().wait_for_delivery(&reg.id, Duration::from_secs(1)).unwrap();
    let payload = outcome.payload().unwrap();
    assert_eq!(payload.body.attachments.len(), 2);
}

#[test]
fn corrupt_record_is_an_error_not_absence() {
    let dir = TempDir::new().unwrap();
    let relay = file_relay(dir.path());
    let reg = relay.flow().register_waiting(WaitRequest::new("a", "agent-a")).unwrap();

    let path = dir
        .path()
        .join(Collection::Registrations.as_str())
        .join(format!("{}.json", reg.id));
    std::fs::write(&path, b"{ not json").unwrap();

    assert!(relay.flow().get(&reg.id).unwrap_err().is_corruption());
    assert!(relay.flow().list_waiting(None).unwrap_err().is_corruption());
    assert!(relay.controller().status().unwrap_err().is_corruption());
}
