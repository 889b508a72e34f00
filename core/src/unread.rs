//! Unread state derived from the conversation store.
//!
//! Counts themselves live on each `Conversation`; this module only reads them
//! and projects read receipts into "seen by" figures.

use crate::conversation_store::ConversationStore;
use crate::messenger_types::{Conversation, Message, ReadState};
use serde::{Deserialize, Serialize};

/// Per-conversation read phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPhase {
    /// Not open, unread messages waiting
    Unseen,
    /// Not open, nothing unread
    Seen,
    /// Currently displayed
    Open,
}

/// Read-only view over the store's unread counts
#[derive(Debug, Clone, Copy)]
pub struct UnreadCounter<'a> {
    store: &'a ConversationStore,
}

impl<'a> UnreadCounter<'a> {
    pub fn new(store: &'a ConversationStore) -> Self {
        Self { store }
    }

    pub fn unread(&self, id: &str) -> u32 {
        self.store.get(id).map_or(0, |c| c.unread_count)
    }

    /// Sum over every conversation
    pub fn total(&self) -> u64 {
        self.store
            .list()
            .iter()
            .map(|c| u64::from(c.unread_count))
            .sum()
    }

    /// Number of conversations with at least one unread message
    pub fn conversations_with_unread(&self) -> usize {
        self.store.list().iter().filter(|c| c.unread_count > 0).count()
    }

    pub fn phase(&self, id: &str) -> Option<ReadPhase> {
        let conv = self.store.get(id)?;
        Some(if self.store.is_active(id) {
            ReadPhase::Open
        } else if conv.unread_count > 0 {
            ReadPhase::Unseen
        } else {
            ReadPhase::Seen
        })
    }
}

/// "Seen by N of M"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenBy {
    pub seen: usize,
    pub of: usize,
}

/// Acknowledgers other than the sender, against every other member
pub fn seen_by(message: &Message, conversation: &Conversation) -> SeenBy {
    let of = conversation
        .participants
        .iter()
        .filter(|p| **p != message.sender)
        .count();
    let seen = match &message.read {
        ReadState::Group { read_by } => read_by.iter().filter(|r| **r != message.sender).count(),
        ReadState::Direct { read } => usize::from(*read),
    };
    SeenBy { seen, of }
}
