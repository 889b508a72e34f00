//! Chat API contract: the durable REST service for conversations and messages.
//!
//! The engine never talks HTTP itself; it holds an `Arc<dyn ChatApi>` and
//! spawns each call so a slow request never stalls the event loop.

use crate::error::Result;
use crate::messenger_types::{
    Attachment, Conversation, ConversationId, LastMessage, MembershipStatus, Message, MessageId,
    MessageKind, ReadState, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation summary as returned by "list conversations"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub membership: MembershipStatus,
}

impl From<ConversationRecord> for Conversation {
    fn from(r: ConversationRecord) -> Self {
        Self {
            id: r.id,
            is_group: r.is_group,
            title: r.title,
            participants: r.participants,
            last_message: r.last_message,
            unread_count: r.unread_count,
            membership: r.membership,
        }
    }
}

/// Message as returned by "fetch history"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    /// Group acknowledgers; for 1:1 any reader other than the sender means "read"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Vec<UserId>>,
    #[serde(default)]
    pub edited: bool,
}

impl MessageRecord {
    pub fn into_message(self, conversation_id: &str, is_group: bool) -> Message {
        let mut read = ReadState::unread(is_group);
        for reader in self.read_by.iter().flatten() {
            if reader != &self.sender {
                read.acknowledge(reader);
            }
        }
        let kind = match &self.attachment {
            Some(att) if self.content.as_deref().map_or(true, str::is_empty) => att.kind(),
            _ => MessageKind::Text,
        };
        Message {
            id: MessageId::Confirmed(self.id),
            conversation_id: Some(conversation_id.to_string()),
            sender: self.sender,
            content: self.content,
            attachment: self.attachment,
            kind,
            timestamp: self.timestamp,
            read,
            correlation_id: None,
            edited: self.edited,
        }
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>>;

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<MessageRecord>>;

    async fn mark_read(&self, conversation_id: &str) -> Result<()>;

    async fn edit_message(&self, conversation_id: &str, message_id: &str, content: &str)
        -> Result<()>;

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()>;

    async fn clear_history(&self, conversation_id: &str) -> Result<()>;

    async fn leave_group(&self, conversation_id: &str) -> Result<()>;

    async fn block_contact(&self, user: &str) -> Result<()>;
}
