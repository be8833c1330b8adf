use crate::support::{file_relay, wait_until};
use agent_relay::message::NewMessage;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

fn relay_command(data_dir: &Path, config_home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_agent-relay"));
    command
        .arg("--data-dir")
        .arg(data_dir)
        .env("XDG_CONFIG_HOME", config_home)
        .env("AGENT_RELAY_LOG", "off")
        .env("AGENT_RELAY_LOG_OUTPUT", "stderr")
        .env("AGENT_RELAY__FLOW__POLL_INTERVAL_MS", "20")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

#[test]
fn child_call_blocks_until_reply() {
    let data = TempDir::new().unwrap();
    let config_home = TempDir::new().unwrap();

    let child = relay_command(data.path(), config_home.path())
        .args([
            "call", "--channel", "agent_chat_1", "--agent-id", "child", "--to", "agent_chat_2",
            "--message", "are you there?", "--timeout", "20",
        ])
        .spawn()
        .unwrap();

    let relay = file_relay(data.path());
    assert!(wait_until(Duration::from_secs(15), || {
        relay
            .flow()
            .list_waiting(Some("agent_chat_1"))
            .map(|w| !w.is_empty())
            .unwrap_or(false)
    }));
    let question: Vec<_> = relay.router().pending_for("agent_chat_2").unwrap().collect();
    assert_eq!(question.len(), 1);
    assert_eq!(question[0].body.text, "are you there?");

    relay
        .router()
        .submit(NewMessage::to("agent_chat_2", "agent_chat_1", "yes, here"))
        .unwrap();

    let output = child.wait_with_output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.starts_with("yes, here"));
    assert!(stdout.contains("<source channel=\"agent_chat_2\">agent</source>"));
}

#[test]
fn child_call_without_reply_exits_two() {
    let data = TempDir::new().unwrap();
    let config_home = TempDir::new().unwrap();
    let output = relay_command(data.path(), config_home.path())
        .args(["call", "--channel", "a", "--agent-id", "x", "--to", "b", "--message", "hello", "--timeout", "1"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("No reply arrived within 1 seconds"));
}

#[test]
fn status_json_reports_queue() {
    let data = TempDir::new().unwrap();
    let config_home = TempDir::new().unwrap();
    let send = relay_command(data.path(), config_home.path())
        .args(["send", "--from", "a", "--to", "b", "--message", "queued"])
        .output()
        .unwrap();
    assert!(send.status.success());

    let status = relay_command(data.path(), config_home.path())
        .args(["status", "--format", "json"])
        .output()
        .unwrap();
    assert!(status.status.success());
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(json["messages"], 1);
    assert_eq!(json["pending"][0]["body"]["text"], "queued");
}

#[test]
fn unknown_registration_fails_with_exit_one() {
    let data = TempDir::new().unwrap();
    let config_home = TempDir::new().unwrap();
    let output = relay_command(data.path(), config_home.path())
        .args(["cancel", "no-such-registration"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Registration not found"));
}
