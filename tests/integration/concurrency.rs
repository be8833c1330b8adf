use crate::support::file_relay;
use agent_relay::flow::{CancelReason, RegistrationStatus, WaitRequest};
use agent_relay::message::NewMessage;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

#[test]
fn concurrent_double_registration_leaves_one_waiting() {
    let dir = TempDir::new().unwrap();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let path = dir.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                // separate store handle per thread, like separate processes
                let relay = file_relay(&path);
                barrier.wait();
                relay
                    .flow()
                    .register_waiting(WaitRequest::new("agent_chat_1", "same-agent"))
                    .unwrap()
                    .id
            })
        })
        .collect();
    let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let relay = file_relay(dir.path());
    let waiting = relay.flow().list_waiting(Some("agent_chat_1")).unwrap();
    assert_eq!(waiting.len(), 1);

    for id in ids.iter().filter(|id| **id != waiting[0].id) {
        let registration = relay.flow().get(id).unwrap();
        assert_eq!(registration.status, RegistrationStatus::Cancelled);
        assert_eq!(registration.cancel_reason, Some(CancelReason::Superseded));
    }
}

#[test]
fn racing_dispatchers_deliver_each_message_once() {
    let dir = TempDir::new().unwrap();
    let setup = file_relay(dir.path());
    let messages = 12;

    let mut registrations = Vec::new();
    for i in 0..messages {
        registrations.push(
            setup
                .flow()
                .register_waiting(WaitRequest::new("inbox", format!("agent-{}", i)))
                .unwrap()
                .id,
        );
    }
    for i in 0..messages {
        setup
            .router()
            .submit(NewMessage::to(format!("sender{}", i % 3), "inbox", format!("m{}", i)))
            .unwrap();
    }
    // queue messages with nobody waiting, then add waiters without dispatching
    for i in 0..4 {
        setup
            .router()
            .submit(NewMessage::to("late_sender", "inbox", format!("late{}", i)))
            .unwrap();
    }
    let extra: Vec<String> = (0..4)
        .map(|i| {
            setup
                .flow()
                .register_waiting(WaitRequest::new("inbox", format!("late-{}", i)))
                .unwrap()
                .id
        })
        .collect();
    assert_eq!(setup.router().pending_for("inbox").unwrap().len(), 4);

    let barrier = Arc::new(Barrier::new(4));
    let racers: Vec<_> = (0..4)
        .map(|_| {
            let path = dir.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let relay = file_relay(&path);
                barrier.wait();
                relay.router().dispatch("inbox").unwrap()
            })
        })
        .collect();
    for racer in racers {
        racer.join().unwrap();
    }

    let mut delivered_texts = HashSet::new();
    for id in registrations.iter().chain(extra.iter()) {
        let registration = setup.flow().get(id).unwrap();
        assert_eq!(registration.status, RegistrationStatus::Resolved);
        let text = registration.resolved_payload.unwrap().body.text;
        assert!(delivered_texts.insert(text.clone()), "{} delivered twice", text);
    }
    assert_eq!(delivered_texts.len(), messages + 4);
    assert!(setup.router().list_pending().unwrap().is_empty());
}
