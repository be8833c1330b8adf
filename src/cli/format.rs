//! Text and JSON rendering for CLI listings.

use crate::controller::{ClearReport, RelayStatus};
use crate::conversation::Conversation;
use crate::error::RelayError;
use crate::flow::Registration;
use crate::janitor::SweepReport;
use crate::message::{Message, Target};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Serialize;

const PREVIEW_CHARS: usize = 48;

/// Section heading in bold/underline.
pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RelayError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| RelayError::InvalidRequest(format!("Failed to render JSON: {}", e)))
}

fn preview(text: &str) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= PREVIEW_CHARS {
        single_line
    } else {
        let cut: String = single_line.chars().take(PREVIEW_CHARS - 3).collect();
        format!("{}...", cut)
    }
}

fn target_label(target: &Target) -> String {
    match target {
        Target::Channel(channel) => channel.clone(),
        Target::Broadcast => "(broadcast)".to_string(),
    }
}

pub fn format_registrations_table(registrations: &[Registration]) -> String {
    if registrations.is_empty() {
        return "No waiting registrations.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Registration", "Channel", "Agent", "Conversation", "Expires", "Message"]);
    for r in registrations {
        table.add_row(vec![
            r.id.clone(),
            r.channel.clone(),
            r.agent_id.clone(),
            r.conversation_id.clone(),
            r.expires_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            r.message.as_deref().map(preview).unwrap_or_default(),
        ]);
    }
    table.to_string()
}

pub fn format_messages_table(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "No pending messages.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Message", "Source", "From", "To", "Waiting on", "Created", "Text"]);
    for m in messages {
        table.add_row(vec![
            m.id.clone(),
            m.source_tag.as_str().to_string(),
            m.sender_channel.clone(),
            target_label(&m.target),
            m.pending_recipients().join(", "),
            m.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            preview(&m.body.text),
        ]);
    }
    table.to_string()
}

pub fn format_conversations_table(conversations: &[Conversation]) -> String {
    if conversations.is_empty() {
        return "No conversations.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Conversation", "Participants", "Created", "Last activity"]);
    for c in conversations {
        let participants: Vec<&str> = c.participants.iter().map(String::as_str).collect();
        table.add_row(vec![
            c.id.clone(),
            participants.join(", "),
            c.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            c.last_activity_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table.to_string()
}

pub fn format_status_text(status: &RelayStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Relay Status")));
    out.push_str(&format!("  Taken at: {}\n", status.taken_at.to_rfc3339()));
    out.push_str(&format!("  Registrations: {}\n", status.registrations));
    out.push_str(&format!("  Messages: {}\n", status.messages));
    out.push_str(&format!("  Conversations: {}\n\n", status.conversations));

    out.push_str(&format!(
        "{}\n\n",
        format_section_heading(&format!("Waiting ({})", status.waiting.len()))
    ));
    out.push_str(&format_registrations_table(&status.waiting));
    out.push_str("\n\n");
    out.push_str(&format!(
        "{}\n\n",
        format_section_heading(&format!("Pending ({})", status.pending.len()))
    ));
    out.push_str(&format_messages_table(&status.pending));
    out
}

pub fn status_json(status: &RelayStatus) -> Result<String, RelayError> {
    to_json(&serde_json::json!({
        "taken_at": status.taken_at,
        "registrations": status.registrations,
        "messages": status.messages,
        "conversations": status.conversations,
        "waiting": status.waiting,
        "pending": status.pending,
    }))
}

pub fn format_sweep_report(report: &SweepReport) -> String {
    format!(
        "Sweep: {} expired, {} registrations, {} messages, {} conversations deleted, {} failures",
        report.expired,
        report.deleted_registrations,
        report.deleted_messages,
        report.deleted_conversations,
        report.failures
    )
}

pub fn format_clear_report(report: &ClearReport) -> String {
    format!(
        "Cleared: {} waits cancelled, {} records deleted",
        report.cancelled, report.deleted
    )
}
