//! Script replay: drive the engine against in-memory collaborators.
//!
//! A script seeds the Chat API, then walks through hub events and local
//! actions. After every step all spawned calls are settled, so the final
//! snapshot is deterministic apart from timestamps.

use crate::chat_api::{ConversationRecord, MessageRecord};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::hub::{HubCommand, HubEvent, IncomingMessage, SendTarget};
use crate::memory::{InMemoryChatApi, InMemoryHub};
use crate::messenger_types::{Attachment, ConversationId, MessageKind, UserId};
use crate::reconciler::EngineSnapshot;
use crate::runtime::ChatSession;
use crate::session::SessionContext;
use chrono::Utc;
use colored::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayScript {
    pub user_id: UserId,
    #[serde(default)]
    pub conversations: Vec<ConversationRecord>,
    #[serde(default)]
    pub histories: HashMap<ConversationId, Vec<MessageRecord>>,
    #[serde(default)]
    pub steps: Vec<ReplayStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReplayStep {
    /// Push a hub event
    Event { event: HubEvent },
    Open { id: ConversationId },
    OpenPeer { peer: UserId },
    Close,
    Send {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        attachment: Option<Attachment>,
    },
    Keystroke,
    Edit { message_id: String, content: String },
    Delete { message_id: String },
    Disconnect {
        #[serde(default)]
        reason: String,
    },
    Reconnect,
    /// Server confirms our most recent send under `id`
    Echo {
        id: String,
        #[serde(default)]
        conversation_id: Option<ConversationId>,
    },
}

impl ReplayScript {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub snapshot: EngineSnapshot,
    pub sent: Vec<HubCommand>,
    pub errors: Vec<StepError>,
    pub last_active: Option<ConversationId>,
}

pub async fn run_script(script: ReplayScript, config: Config) -> Result<ReplayOutcome> {
    let api = Arc::new(InMemoryChatApi::new());
    api.set_conversations(script.conversations).await;
    for (id, history) in script.histories {
        api.set_history(&id, history).await;
    }
    let hub = Arc::new(InMemoryHub::new());

    let mut session = SessionContext::begin(script.user_id, None);
    if let Some(dir) = &config.data_dir {
        session = session.restore(dir)?;
    }

    let mut chat = ChatSession::begin(config, session, api, hub.clone())?;
    chat.settle().await;

    let mut errors = Vec::new();
    for (index, step) in script.steps.into_iter().enumerate() {
        if let Err(e) = apply_step(&mut chat, &hub, step) {
            warn!("Step {} failed: {}", index, e);
            errors.push(StepError {
                index,
                error: e.to_string(),
            });
        }
        chat.settle().await;
    }

    let snapshot = chat.reconciler().snapshot();
    let sent = hub.sent();
    let session = chat.end();
    info!("Replay finished with {} step errors", errors.len());

    Ok(ReplayOutcome {
        snapshot,
        sent,
        errors,
        last_active: session.last_active,
    })
}

fn apply_step(chat: &mut ChatSession, hub: &InMemoryHub, step: ReplayStep) -> Result<()> {
    let rec = chat.reconciler_mut();
    match step {
        ReplayStep::Event { event } => {
            hub.emit(event);
        }
        ReplayStep::Open { id } => rec.open_conversation(&id)?,
        ReplayStep::OpenPeer { peer } => {
            rec.open_with_peer(&peer)?;
        }
        ReplayStep::Close => rec.close_conversation(),
        ReplayStep::Send {
            content,
            attachment,
        } => {
            rec.send_message(content, attachment)?;
        }
        ReplayStep::Keystroke => rec.note_keystroke()?,
        ReplayStep::Edit {
            message_id,
            content,
        } => rec.edit_message(&message_id, &content)?,
        ReplayStep::Delete { message_id } => rec.delete_message(&message_id)?,
        ReplayStep::Disconnect { reason } => hub.disconnect(&reason),
        ReplayStep::Reconnect => {
            hub.reconnect();
        }
        ReplayStep::Echo {
            id,
            conversation_id,
        } => {
            let echo = echo_last_send(hub, rec.user_id(), id, conversation_id)?;
            let is_group = rec
                .conversations()
                .get(&echo.conversation_id)
                .is_some_and(|c| c.is_group);
            hub.emit(HubEvent::MessageReceived {
                message: IncomingMessage { is_group, ..echo },
            });
        }
    }
    Ok(())
}

/// Build the server's confirmation of the latest send on the wire
fn echo_last_send(
    hub: &InMemoryHub,
    me: &str,
    id: String,
    conversation_id: Option<ConversationId>,
) -> Result<IncomingMessage> {
    let last = hub.sent().into_iter().rev().find_map(|cmd| match cmd {
        HubCommand::SendMessage {
            target,
            content,
            attachment,
            correlation_id,
        } => Some((target, content, attachment, correlation_id)),
        _ => None,
    });
    let Some((target, content, attachment, correlation_id)) = last else {
        return Err(SyncError::InvalidAction("nothing has been sent yet".to_string()));
    };

    let conversation_id = match (conversation_id, target) {
        (Some(id), _) => id,
        (None, SendTarget::Conversation(id)) => id,
        (None, SendTarget::Peer(peer)) => {
            return Err(SyncError::InvalidAction(format!(
                "echo of a send to new peer {} needs a conversation_id",
                peer
            )))
        }
    };
    let kind = match (&content, &attachment) {
        (None, Some(att)) => att.kind(),
        _ => MessageKind::Text,
    };

    Ok(IncomingMessage {
        id,
        conversation_id,
        is_group: false,
        sender: me.to_string(),
        content,
        attachment,
        kind,
        timestamp: Utc::now(),
        correlation_id: Some(correlation_id),
    })
}

/// Human-readable digest of a replay
pub fn render_summary(outcome: &ReplayOutcome) -> String {
    let snap = &outcome.snapshot;
    let mut out = String::new();

    out.push_str(&format!("{}\n", "Replay summary".bright_cyan().bold()));
    let link = if snap.connected {
        "connected".green()
    } else {
        "disconnected".red()
    };
    out.push_str(&format!("  user {} ({})\n", snap.user_id.cyan(), link));

    for conv in &snap.conversations {
        let open = matches!(&snap.active, Some(key) if key.conversation_id() == Some(conv.id.as_str()));
        let marker = if open { "▶".bright_green() } else { " ".normal() };
        let unread = if conv.unread_count > 0 {
            format!("{} unread", conv.unread_count).yellow().bold()
        } else {
            "read".dimmed()
        };
        let title = conv.title.clone().unwrap_or_else(|| conv.participants.join(", "));
        out.push_str(&format!("  {} {} {} [{}]\n", marker, conv.id.bright_white(), title, unread));
    }

    if let Some(key) = &snap.active {
        out.push_str(&format!("{} {}\n", "Open thread".bright_white().bold(), key));
        for msg in &snap.active_thread {
            let id = if msg.is_placeholder() {
                msg.id.to_string().yellow()
            } else {
                msg.id.to_string().green()
            };
            let text = msg.content.clone().unwrap_or_default();
            out.push_str(&format!("  {} {}: {}\n", id, msg.sender.cyan(), text));
        }
    }

    out.push_str(&format!(
        "  total unread {}  |  commands sent {}\n",
        snap.total_unread.to_string().bold(),
        outcome.sent.len()
    ));
    for err in &outcome.errors {
        out.push_str(&format!("  {} step {}: {}\n", "✗".red().bold(), err.index, err.error.red()));
    }
    out
}
