/// Conversation list: ordered (most recently active first), unique by id
use crate::messenger_types::{Conversation, ConversationKey, LastMessage, UserId};

#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    order: Vec<Conversation>,
    active: Option<ConversationKey>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk load. The incoming order wins; duplicate ids keep their first occurrence.
    /// Returns true if the active selection was dropped because it vanished.
    pub fn upsert_many(&mut self, conversations: Vec<Conversation>) -> bool {
        let mut next: Vec<Conversation> = Vec::with_capacity(conversations.len());
        for conv in conversations {
            if !next.iter().any(|c| c.id == conv.id) {
                next.push(conv);
            }
        }
        self.order = next;

        let vanished = match &self.active {
            Some(ConversationKey::Id { id }) => !self.contains(id),
            _ => false,
        };
        if vanished {
            self.active = None;
        }
        vanished
    }

    /// Replace in place if known, otherwise insert at the front
    pub fn upsert_one(&mut self, conversation: Conversation) {
        match self.position(&conversation.id) {
            Some(idx) => self.order[idx] = conversation,
            None => self.order.insert(0, conversation),
        }
    }

    pub fn move_to_front(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(0) => true,
            Some(idx) => {
                let conv = self.order.remove(idx);
                self.order.insert(0, conv);
                true
            }
            None => false,
        }
    }

    /// Leave/block. Clears the selection when the open conversation goes away.
    pub fn remove_by_id(&mut self, id: &str) -> Option<Conversation> {
        let idx = self.position(id)?;
        if matches!(&self.active, Some(ConversationKey::Id { id: open }) if open == id) {
            self.active = None;
        }
        Some(self.order.remove(idx))
    }

    pub fn mark_all_read(&mut self, id: &str) -> bool {
        match self.get_mut(id) {
            Some(conv) => {
                conv.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub(crate) fn increment_unread(&mut self, id: &str) -> Option<u32> {
        let conv = self.get_mut(id)?;
        conv.unread_count = conv.unread_count.saturating_add(1);
        Some(conv.unread_count)
    }

    /// Subtract what a successful mark-read acknowledged; later arrivals stay unread
    pub(crate) fn acknowledge_unread(&mut self, id: &str, acknowledged: u32) -> Option<u32> {
        let conv = self.get_mut(id)?;
        conv.unread_count = conv.unread_count.saturating_sub(acknowledged);
        Some(conv.unread_count)
    }

    pub fn update_last_message(&mut self, id: &str, last: LastMessage) -> bool {
        match self.get_mut(id) {
            Some(conv) => {
                conv.last_message = Some(last);
                true
            }
            None => false,
        }
    }

    pub fn clear_last_message(&mut self, id: &str) -> bool {
        match self.get_mut(id) {
            Some(conv) => {
                conv.last_message = None;
                true
            }
            None => false,
        }
    }

    /// Apply a membership delta; returns false for an unknown conversation
    pub fn update_participants(&mut self, id: &str, added: &[UserId], removed: &[UserId]) -> bool {
        let Some(conv) = self.get_mut(id) else {
            return false;
        };
        conv.participants.retain(|p| !removed.contains(p));
        for user in added {
            if !conv.participants.contains(user) {
                conv.participants.push(user.clone());
            }
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.order.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.order.iter_mut().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|c| c.id == id)
    }

    /// Existing 1:1 conversation with `peer`
    pub fn find_direct_with(&self, me: &str, peer: &str) -> Option<&Conversation> {
        self.order
            .iter()
            .find(|c| c.peer_of(me).map(String::as_str) == Some(peer))
    }

    pub fn list(&self) -> &[Conversation] {
        &self.order
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.iter().map(|c| c.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    /// Conversation behind the active key, if it has a server id and is listed
    pub fn active_conversation(&self) -> Option<&Conversation> {
        match &self.active {
            Some(ConversationKey::Id { id }) => self.get(id),
            _ => None,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        matches!(&self.active, Some(ConversationKey::Id { id: open }) if open == id)
    }

    /// Select a conversation. Selection never reorders the list.
    pub fn set_active(&mut self, key: Option<ConversationKey>) {
        self.active = key;
    }

    /// Initial selection: requested target first, then the persisted one
    pub fn restore_selection(&self, requested: Option<&str>, persisted: Option<&str>) -> Option<String> {
        [requested, persisted]
            .into_iter()
            .flatten()
            .find(|id| self.contains(id))
            .map(str::to_string)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.active = None;
    }
}
