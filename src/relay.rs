//! Tool boundary
//!
//! [`Relay`] wires the store, coordinator and router together and exposes
//! the one blocking call an agent makes: send a message, then wait for the
//! reply addressed back to it.

use crate::config::RelayConfig;
use crate::controller::Controller;
use crate::error::RelayError;
use crate::flow::{CancelReason, DeliveredMessage, FlowCoordinator, WaitOutcome, WaitRequest};
use crate::janitor::Janitor;
use crate::message::{Attachment, AttachmentKind, MessageBody, NewMessage, SourceTag, Target};
use crate::router::MessageRouter;
use crate::store::{open_store, DurableStore};
use crate::types::{Channel, ConversationID, MessageID, RegistrationID};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One agent tool invocation
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub channel: Channel,
    pub agent_id: String,
    /// Text to send; an empty body with no attachments only waits
    pub message: String,
    pub target: Target,
    pub conversation_id: Option<ConversationID>,
    pub participants: Vec<Channel>,
    pub attachments: Vec<Attachment>,
    pub timeout: Option<Duration>,
}

impl ToolCall {
    pub fn new(
        channel: impl Into<Channel>,
        agent_id: impl Into<String>,
        target: Target,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            agent_id: agent_id.into(),
            message: message.into(),
            target,
            conversation_id: None,
            participants: Vec::new(),
            attachments: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
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

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// What the agent gets back
#[derive(Debug, Clone)]
pub struct ToolReply {
    pub registration_id: RegistrationID,
    pub conversation_id: ConversationID,
    /// The message this call sent, if it sent one
    pub sent_message_id: Option<MessageID>,
    pub outcome: WaitOutcome,
    pub timeout: Duration,
    pub waited: Duration,
}

impl ToolReply {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_delivered()
    }

    /// Text handed back to the agent. Never empty.
    pub fn render(&self) -> String {
        match &self.outcome {
            WaitOutcome::Delivered(payload) => render_delivered(payload),
            WaitOutcome::TimedOut => format!(
                "No reply arrived within {} seconds (registration {}). Call again to keep waiting.",
                self.timeout.as_secs(),
                self.registration_id
            ),
            WaitOutcome::Cancelled(CancelReason::Superseded) => format!(
                "This wait was superseded by a newer call from the same agent (registration {}).",
                self.registration_id
            ),
            WaitOutcome::Cancelled(CancelReason::Cancelled) => format!(
                "This wait was cancelled by the controller (registration {}).",
                self.registration_id
            ),
        }
    }
}

/// Render a delivered payload: text, attachments, workspace, then sender.
pub fn render_delivered(payload: &DeliveredMessage) -> String {
    let mut out = payload.body.text.clone();
    render_attachments(&payload.body, &mut out);
    let _ = write!(
        out,
        "\n\n<source channel=\"{}\">{}</source>",
        payload.sender_channel,
        payload.source_tag.as_str()
    );
    out
}

fn render_attachments(body: &MessageBody, out: &mut String) {
    if body.attachments.is_empty() {
        return;
    }
    let (folders, files): (Vec<&Attachment>, Vec<&Attachment>) = body
        .attachments
        .iter()
        .partition(|a| a.kind == AttachmentKind::Folder);

    out.push_str("\n\n<attachments>\n");
    if !folders.is_empty() {
        out.push_str("FOLDERS:\n");
        for folder in &folders {
            let _ = writeln!(out, "- {}", folder.path);
        }
    }
    if !files.is_empty() {
        if !folders.is_empty() {
            out.push('\n');
        }
        out.push_str("FILES:\n");
        for file in &files {
            match &file.media_type {
                Some(media_type) => {
                    let _ = writeln!(out, "- {} ({})", file.path, media_type);
                }
                None => {
                    let _ = writeln!(out, "- {}", file.path);
                }
            }
        }
    }
    out.push_str("</attachments>");

    if let Some(workspace) = body.attachments.iter().find_map(|a| a.workspace.as_deref()) {
        let _ = write!(out, "\n\n<workspace>{}</workspace>", workspace);
    }
}

/// The assembled relay over one store
pub struct Relay {
    store: Arc<dyn DurableStore>,
    flow: Arc<FlowCoordinator>,
    router: Arc<MessageRouter>,
    config: RelayConfig,
}

impl Relay {
    /// Open the configured store and build the relay on it.
    pub fn open(config: RelayConfig) -> Result<Self, RelayError> {
        let store = open_store(&config.storage)?;
        Ok(Self::with_store(store, config))
    }

    pub fn with_store(store: Arc<dyn DurableStore>, config: RelayConfig) -> Self {
        let flow = Arc::new(FlowCoordinator::new(store.clone(), config.flow.clone()));
        let router = Arc::new(MessageRouter::new(store.clone(), flow.clone()));
        Self {
            store,
            flow,
            router,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn flow(&self) -> &Arc<FlowCoordinator> {
        &self.flow
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn janitor(&self) -> Janitor {
        Janitor::new(self.store.clone(), self.flow.clone(), self.config.janitor.clone())
    }

    pub fn controller(&self) -> Controller {
        Controller::new(self.store.clone(), self.flow.clone(), self.router.clone())
    }

    /// Send, register, pick up anything already waiting, then block.
    pub fn call(&self, call: ToolCall) -> Result<ToolReply, RelayError> {
        let started = Instant::now();
        let timeout = call.timeout.unwrap_or_else(|| self.config.flow.default_timeout());

        let body = MessageBody {
            text: call.message.clone(),
            attachments: call.attachments.clone(),
        };
        let mut participants = call.participants.clone();
        if let Target::Channel(target) = &call.target {
            participants.push(target.clone());
        }

        let mut request = WaitRequest::new(call.channel.clone(), call.agent_id.clone())
            .with_participants(participants.clone())
            .with_timeout(timeout);
        request.validate(timeout)?;

        let (sent_message_id, conversation_id) = if body.is_empty() {
            (None, call.conversation_id.clone())
        } else {
            let receipt = self.router.submit(NewMessage {
                sender_channel: call.channel.clone(),
                target: call.target.clone(),
                body,
                source_tag: SourceTag::Agent,
                conversation_id: call.conversation_id.clone(),
                participants: participants.clone(),
            })?;
            (Some(receipt.message_id), Some(receipt.conversation_id))
        };

        if let Some(conversation_id) = conversation_id {
            request = request.in_conversation(conversation_id);
        }
        if !call.message.is_empty() {
            request = request.with_message(call.message.clone());
        }
        let registration = self.flow.register_waiting(request)?;

        let picked_up = self.router.dispatch(&call.channel)?;
        if !picked_up.is_empty() {
            debug!(registration_id = %registration.id, "Reply was already waiting");
        }

        let outcome = self.flow.wait_for_delivery(&registration.id, timeout)?;
        let waited = started.elapsed();
        info!(
            registration_id = %registration.id,
            channel = %call.channel,
            delivered = outcome.is_delivered(),
            waited_ms = waited.as_millis() as u64,
            "Tool call finished"
        );

        Ok(ToolReply {
            registration_id: registration.id,
            conversation_id: registration.conversation_id,
            sent_message_id,
            outcome,
            timeout,
            waited,
        })
    }
}
