/// Shared types for the conversation sync engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Identity of a user (sender, reader, participant)
pub type UserId = String;

/// Server-issued conversation id
pub type ConversationId = String;

/// Key of a message thread.
///
/// A brand-new 1:1 conversation has no server id until the first message
/// round-trips, so its thread is keyed by the peer instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationKey {
    Id { id: ConversationId },
    Pending { peer: UserId },
}

impl ConversationKey {
    pub fn id(id: impl Into<ConversationId>) -> Self {
        Self::Id { id: id.into() }
    }

    pub fn pending(peer: impl Into<UserId>) -> Self {
        Self::Pending { peer: peer.into() }
    }

    /// Server id, if the conversation has one yet
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Id { id } => Some(id),
            Self::Pending { .. } => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id { id } => write!(f, "{}", id),
            Self::Pending { peer } => write!(f, "pending:{}", peer),
        }
    }
}

/// Message id: durable server id, or a local placeholder awaiting confirmation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Confirmed(String),
    Placeholder(String),
}

impl MessageId {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Confirmed(id) | Self::Placeholder(id) => id,
        }
    }

    /// True when this is the confirmed id `id`
    pub fn is_confirmed_as(&self, id: &str) -> bool {
        matches!(self, Self::Confirmed(own) if own == id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// Descriptor of an uploaded file; the bytes themselves live elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl Attachment {
    pub fn kind(&self) -> MessageKind {
        match self.mime_type.as_deref() {
            Some(mime) if mime.starts_with("image/") => MessageKind::Image,
            _ => MessageKind::File,
        }
    }
}

/// Preview of the most recent message shown in the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub sender: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    #[default]
    Member,
    Admin,
    /// Invited to a group but not yet joined
    Pending,
}

/// Summary of one conversation (list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub title: Option<String>,
    pub participants: Vec<UserId>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub membership: MembershipStatus,
}

impl Conversation {
    /// Direct conversation synthesized locally before the server lists it
    pub fn direct(id: impl Into<ConversationId>, me: &str, peer: &str) -> Self {
        Self {
            id: id.into(),
            is_group: false,
            title: None,
            participants: vec![me.to_string(), peer.to_string()],
            last_message: None,
            unread_count: 0,
            membership: MembershipStatus::Member,
        }
    }

    /// The other party of a 1:1 conversation
    pub fn peer_of(&self, me: &str) -> Option<&UserId> {
        if self.is_group {
            return None;
        }
        self.participants.iter().find(|p| p.as_str() != me)
    }

    pub fn has_participant(&self, user: &str) -> bool {
        self.participants.iter().any(|p| p == user)
    }
}

/// Read state: a flag for 1:1, the set of acknowledgers for groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadState {
    Direct { read: bool },
    Group { read_by: BTreeSet<UserId> },
}

impl ReadState {
    pub fn unread(is_group: bool) -> Self {
        if is_group {
            Self::Group {
                read_by: BTreeSet::new(),
            }
        } else {
            Self::Direct { read: false }
        }
    }

    /// Record that `reader` acknowledged the message. Returns true if anything changed.
    pub fn acknowledge(&mut self, reader: &str) -> bool {
        match self {
            Self::Direct { read } => !std::mem::replace(read, true),
            Self::Group { read_by } => read_by.insert(reader.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// `None` only for placeholders of a conversation the server has not created yet
    pub conversation_id: Option<ConversationId>,
    pub sender: UserId,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub read: ReadState,
    /// Client-generated id echoed back by the server for our own sends
    pub correlation_id: Option<Uuid>,
    pub edited: bool,
}

impl Message {
    pub fn is_placeholder(&self) -> bool {
        self.id.is_placeholder()
    }

    /// Snippet for the conversation list
    pub fn preview(&self) -> LastMessage {
        let content = match (&self.content, &self.attachment) {
            (Some(text), _) if !text.is_empty() => text.clone(),
            (_, Some(att)) => att.file_name.clone().unwrap_or_else(|| att.url.clone()),
            _ => String::new(),
        };
        LastMessage {
            content,
            sender: self.sender.clone(),
            timestamp: self.timestamp,
            kind: self.kind,
        }
    }
}

/// Notifications the engine publishes for readers of the stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineUpdate {
    /// Conversation list order, summaries or unread counts changed
    ConversationsChanged,
    /// A message thread changed
    ThreadChanged { key: ConversationKey },
    /// The open conversation changed
    ActiveChanged { key: Option<ConversationKey> },
    TypingChanged {
        conversation_id: ConversationId,
        typing: Vec<UserId>,
    },
    PresenceChanged,
    ConnectionChanged { connected: bool },
    /// An asynchronous request failed; the stores were left unchanged
    RequestFailed { action: String, reason: String },
}
