//! Realtime Hub contract: the push transport.
//!
//! Delivery is at-least-once and unordered across kinds. Outbound commands are
//! handed to the transport's buffer; `send` never waits on the network.

use crate::chat_api::ConversationRecord;
use crate::error::Result;
use crate::messenger_types::{
    Attachment, ConversationId, Message, MessageId, MessageKind, ReadState, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type SubscriptionId = u64;

/// Kinds of inbound events the router subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    MessageEdited,
    MessageDeleted,
    TypingStarted,
    TypingStopped,
    MessagesRead,
    OnlineList,
    PresenceChanged,
    GroupCreated,
    MembershipChanged,
    Connection,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::MessageReceived,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
        EventKind::TypingStarted,
        EventKind::TypingStopped,
        EventKind::MessagesRead,
        EventKind::OnlineList,
        EventKind::PresenceChanged,
        EventKind::GroupCreated,
        EventKind::MembershipChanged,
        EventKind::Connection,
    ];
}

/// A confirmed message pushed by the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub is_group: bool,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    /// Echo of the client correlation id, present on our own sends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl IncomingMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::Confirmed(self.id),
            conversation_id: Some(self.conversation_id),
            sender: self.sender,
            content: self.content,
            attachment: self.attachment,
            kind: self.kind,
            timestamp: self.timestamp,
            read: ReadState::unread(self.is_group),
            correlation_id: self.correlation_id,
            edited: false,
        }
    }
}

/// Inbound push events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    MessageReceived {
        message: IncomingMessage,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message_id: String,
        content: String,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: String,
    },
    TypingStarted {
        conversation_id: ConversationId,
        user: UserId,
    },
    TypingStopped {
        conversation_id: ConversationId,
        user: UserId,
    },
    /// `message_ids = None` means every message in the conversation
    MessagesRead {
        conversation_id: ConversationId,
        reader: UserId,
        #[serde(default)]
        message_ids: Option<Vec<String>>,
    },
    OnlineList {
        users: Vec<UserId>,
    },
    PresenceChanged {
        user: UserId,
        online: bool,
    },
    GroupCreated {
        conversation: ConversationRecord,
    },
    MembershipChanged {
        conversation_id: ConversationId,
        #[serde(default)]
        added: Vec<UserId>,
        #[serde(default)]
        removed: Vec<UserId>,
    },
    ConnectionLost {
        #[serde(default)]
        reason: String,
    },
    ConnectionRestored,
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::MessageEdited { .. } => EventKind::MessageEdited,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::TypingStarted { .. } => EventKind::TypingStarted,
            Self::TypingStopped { .. } => EventKind::TypingStopped,
            Self::MessagesRead { .. } => EventKind::MessagesRead,
            Self::OnlineList { .. } => EventKind::OnlineList,
            Self::PresenceChanged { .. } => EventKind::PresenceChanged,
            Self::GroupCreated { .. } => EventKind::GroupCreated,
            Self::MembershipChanged { .. } => EventKind::MembershipChanged,
            Self::ConnectionLost { .. } | Self::ConnectionRestored => EventKind::Connection,
        }
    }
}

/// Where an outbound command is addressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SendTarget {
    Conversation(ConversationId),
    /// Conversation not created yet: address the peer directly
    Peer(UserId),
}

/// Outbound commands accepted by the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HubCommand {
    SendMessage {
        target: SendTarget,
        content: Option<String>,
        attachment: Option<Attachment>,
        correlation_id: Uuid,
    },
    TypingStarted {
        target: SendTarget,
    },
    TypingStopped {
        target: SendTarget,
    },
    EditMessage {
        conversation_id: ConversationId,
        message_id: String,
        content: String,
    },
    DeleteMessage {
        conversation_id: ConversationId,
        message_id: String,
    },
    ClearChat {
        conversation_id: ConversationId,
    },
    LeaveGroup {
        conversation_id: ConversationId,
    },
}

pub trait RealtimeHub: Send + Sync {
    /// Register `sink` for every event of `kind`
    fn subscribe(&self, kind: EventKind, sink: mpsc::UnboundedSender<HubEvent>)
        -> Result<SubscriptionId>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Queue an outbound command on the transport
    fn send(&self, command: HubCommand) -> Result<()>;
}
