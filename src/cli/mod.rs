//! CLI Tooling
//!
//! Command-line front end over [`Relay`]. `call` is the agent tool boundary;
//! the remaining commands are controller and maintenance operations.

pub mod format;

use crate::config::{ConfigLoader, RelayConfig};
use crate::error::{RelayError, StorageError};
use crate::janitor::JanitorDaemon;
use crate::message::{Attachment, MessageBody, NewMessage, SourceTag, Target};
use crate::relay::{Relay, ToolCall};
use clap::{Parser, Subcommand};
use format::{
    format_clear_report, format_conversations_table, format_messages_table,
    format_registrations_table, format_status_text, format_sweep_report, status_json, to_json,
};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Exit code when a call ends without a delivered reply
pub const EXIT_NO_REPLY: i32 = 2;

/// agent-relay - message relay for blocking agent tool calls
#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(about = "Relay messages between agents that can only block on a tool call")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Relay state directory (overrides storage.data_dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Configuration file path, layered over the global config
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Load layered configuration and apply command-line overrides.
    pub fn load_config(&self) -> Result<RelayConfig, RelayError> {
        let mut config = ConfigLoader::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(output) = &self.log_output {
            config.logging.output = output.clone();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message and block until a reply arrives (agent tool call)
    Call {
        /// Channel of the calling agent
        #[arg(long)]
        channel: String,
        /// Identity of this agent instance
        #[arg(long)]
        agent_id: String,
        /// Recipient channel
        #[arg(long, conflicts_with = "broadcast", required_unless_present = "broadcast")]
        to: Option<String>,
        /// Send to every other participant of the conversation
        #[arg(long)]
        broadcast: bool,
        /// Message text; empty only waits
        #[arg(long, default_value = "")]
        message: String,
        /// Conversation id (defaults to a key derived from the participants)
        #[arg(long)]
        conversation: Option<String>,
        /// Additional participant channel (repeatable)
        #[arg(long = "participant")]
        participants: Vec<String>,
        /// Attach a file path (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
        /// Attach a folder path (repeatable)
        #[arg(long = "folder")]
        folders: Vec<String>,
        /// Workspace the attachments belong to
        #[arg(long)]
        workspace: Option<String>,
        /// Seconds to wait (defaults to flow.default_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Submit a message without waiting
    Send {
        /// Sender channel (not used with --admin)
        #[arg(long, required_unless_present = "admin")]
        from: Option<String>,
        /// Recipient channel
        #[arg(long, conflicts_with = "broadcast", required_unless_present = "broadcast")]
        to: Option<String>,
        /// Send to every other participant of the conversation
        #[arg(long)]
        broadcast: bool,
        /// Message text
        #[arg(long)]
        message: String,
        /// Tag as an admin message (delivered ahead of agent messages)
        #[arg(long)]
        admin: bool,
        /// Conversation id
        #[arg(long)]
        conversation: Option<String>,
        /// Additional participant channel (repeatable)
        #[arg(long = "participant")]
        participants: Vec<String>,
    },
    /// List waiting registrations
    Waiting {
        /// Only this channel
        #[arg(long)]
        channel: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List undelivered messages
    Pending {
        /// Only messages pending for this channel
        #[arg(long)]
        channel: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List conversations, most recent first
    Conversations {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Deliver a message to a waiting registration
    Deliver {
        message_id: String,
        registration_id: String,
    },
    /// Cancel a waiting registration
    Cancel { registration_id: String },
    /// Run one janitor sweep
    Sweep,
    /// Run the janitor until interrupted
    Janitor {
        /// Seconds between sweeps (defaults to janitor.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show counts, waiting registrations and pending messages
    Status {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Delete messages by id
    DeleteMessages {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Cancel every wait and delete all relay state
    Clear,
    /// Print the effective configuration
    Config,
}

/// Text to print and the process exit code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            exit_code: 0,
        }
    }
}

fn target_from(to: &Option<String>, broadcast: bool) -> Result<Target, RelayError> {
    match (to, broadcast) {
        (Some(channel), false) => Ok(Target::channel(channel.clone())),
        (None, true) => Ok(Target::Broadcast),
        _ => Err(RelayError::InvalidRequest(
            "give exactly one of --to or --broadcast".to_string(),
        )),
    }
}

fn check_format(format: &str) -> Result<bool, RelayError> {
    match format {
        "text" => Ok(false),
        "json" => Ok(true),
        other => Err(RelayError::InvalidRequest(format!(
            "Unknown format {:?}; use text or json",
            other
        ))),
    }
}

/// CLI context: one relay opened from configuration
pub struct CliContext {
    relay: Relay,
}

impl CliContext {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        Ok(Self {
            relay: Relay::open(config)?,
        })
    }

    pub fn from_relay(relay: Relay) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Execute a CLI command
    pub fn execute(&self, command: &Commands) -> Result<CommandOutput, RelayError> {
        match command {
            Commands::Call {
                channel,
                agent_id,
                to,
                broadcast,
                message,
                conversation,
                participants,
                files,
                folders,
                workspace,
                timeout,
            } => {
                let mut call = ToolCall::new(
                    channel.clone(),
                    agent_id.clone(),
                    target_from(to, *broadcast)?,
                    message.clone(),
                )
                .with_participants(participants.iter().cloned());
                if let Some(conversation) = conversation {
                    call = call.in_conversation(conversation.clone());
                }
                if let Some(secs) = timeout {
                    call = call.with_timeout(Duration::from_secs(*secs));
                }
                let attachments = folders
                    .iter()
                    .map(Attachment::folder)
                    .chain(files.iter().map(Attachment::file));
                for attachment in attachments {
                    call = call.with_attachment(match workspace {
                        Some(w) => attachment.in_workspace(w.clone()),
                        None => attachment,
                    });
                }
                self.handle_call(call)
            }
            Commands::Send {
                from,
                to,
                broadcast,
                message,
                admin,
                conversation,
                participants,
            } => self.handle_send(
                from.as_deref(),
                target_from(to, *broadcast)?,
                message,
                *admin,
                conversation.clone(),
                participants,
            ),
            Commands::Waiting { channel, format } => {
                let waiting = self.relay.flow().list_waiting(channel.as_deref())?;
                if check_format(format)? {
                    Ok(CommandOutput::ok(to_json(&waiting)?))
                } else {
                    Ok(CommandOutput::ok(format_registrations_table(&waiting)))
                }
            }
            Commands::Pending { channel, format } => {
                let pending: Vec<_> = match channel {
                    Some(channel) => self.relay.router().pending_for(channel)?.collect(),
                    None => self.relay.router().list_pending()?,
                };
                if check_format(format)? {
                    Ok(CommandOutput::ok(to_json(&pending)?))
                } else {
                    Ok(CommandOutput::ok(format_messages_table(&pending)))
                }
            }
            Commands::Conversations { format } => {
                let conversations = self.relay.controller().conversations()?;
                if check_format(format)? {
                    Ok(CommandOutput::ok(to_json(&conversations)?))
                } else {
                    Ok(CommandOutput::ok(format_conversations_table(&conversations)))
                }
            }
            Commands::Deliver {
                message_id,
                registration_id,
            } => {
                let delivered = self.relay.controller().deliver(message_id, registration_id)?;
                Ok(if delivered {
                    CommandOutput::ok(format!(
                        "{} message {} to registration {}",
                        "Delivered".green(),
                        message_id,
                        registration_id
                    ))
                } else {
                    CommandOutput {
                        text: format!(
                            "{}: registration {} is no longer waiting",
                            "Not delivered".yellow(),
                            registration_id
                        ),
                        exit_code: 1,
                    }
                })
            }
            Commands::Cancel { registration_id } => {
                let cancelled = self.relay.controller().cancel(registration_id)?;
                Ok(if cancelled {
                    CommandOutput::ok(format!("Cancelled registration {}", registration_id))
                } else {
                    CommandOutput::ok(format!(
                        "Registration {} was not waiting; nothing changed",
                        registration_id
                    ))
                })
            }
            Commands::Sweep => {
                let report = self.relay.janitor().sweep();
                Ok(CommandOutput::ok(format_sweep_report(&report)))
            }
            Commands::Janitor { interval } => self.handle_janitor(*interval),
            Commands::Status { format } => {
                let status = self.relay.controller().status()?;
                if check_format(format)? {
                    Ok(CommandOutput::ok(status_json(&status)?))
                } else {
                    Ok(CommandOutput::ok(format_status_text(&status)))
                }
            }
            Commands::DeleteMessages { ids } => {
                let deleted = self.relay.controller().delete_messages(ids)?;
                Ok(CommandOutput::ok(format!(
                    "Deleted {} of {} messages",
                    deleted,
                    ids.len()
                )))
            }
            Commands::Clear => {
                let report = self.relay.controller().clear_all()?;
                Ok(CommandOutput::ok(format_clear_report(&report)))
            }
            Commands::Config => Ok(CommandOutput::ok(ConfigLoader::to_toml(self.relay.config())?)),
        }
    }

    fn handle_call(&self, call: ToolCall) -> Result<CommandOutput, RelayError> {
        let reply = self.relay.call(call)?;
        Ok(CommandOutput {
            text: reply.render(),
            exit_code: if reply.is_delivered() { 0 } else { EXIT_NO_REPLY },
        })
    }

    fn handle_send(
        &self,
        from: Option<&str>,
        target: Target,
        message: &str,
        admin: bool,
        conversation: Option<String>,
        participants: &[String],
    ) -> Result<CommandOutput, RelayError> {
        let receipt = if admin {
            self.relay
                .controller()
                .send_admin(target, message.to_string(), conversation)?
        } else {
            let from = from.ok_or_else(|| {
                RelayError::InvalidRequest("--from is required for agent messages".to_string())
            })?;
            let mut new = NewMessage {
                sender_channel: from.to_string(),
                target,
                body: MessageBody::text(message),
                source_tag: SourceTag::Agent,
                conversation_id: None,
                participants: Vec::new(),
            }
            .with_participants(participants.iter().cloned());
            if let Some(conversation) = conversation {
                new = new.in_conversation(conversation);
            }
            self.relay.router().submit(new)?
        };

        Ok(CommandOutput::ok(format!(
            "Accepted message {} in {} ({} recipients, {} delivered now)",
            receipt.message_id,
            receipt.conversation_id,
            receipt.recipients.len(),
            receipt.deliveries.len()
        )))
    }

    fn handle_janitor(&self, interval: Option<u64>) -> Result<CommandOutput, RelayError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| RelayError::Storage(StorageError::IoError(e)))?;

        let janitor = Arc::new(self.relay.janitor());
        let daemon = match interval {
            Some(secs) => JanitorDaemon::with_interval(janitor, Duration::from_secs(secs.max(1))),
            None => JanitorDaemon::new(janitor),
        };

        let stats = runtime.block_on(async {
            daemon.start();
            let signal = tokio::signal::ctrl_c().await;
            daemon.stop().await;
            signal.map(|_| daemon.stats())
        });
        let stats = stats.map_err(|e| RelayError::Storage(StorageError::IoError(e)))?;
        info!(sweeps = stats.sweeps, "Janitor exited");

        Ok(CommandOutput::ok(format!(
            "Janitor ran {} sweeps. {}",
            stats.sweeps,
            format_sweep_report(&stats.totals)
        )))
    }
}
