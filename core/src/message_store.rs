/// Message threads: per-conversation, append-ordered, loaded on demand
/// Arrival order is display order; nothing is ever re-sorted by timestamp.
use crate::messenger_types::{ConversationKey, Message, MessageId};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    threads: HashMap<ConversationKey, Vec<Message>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the confirmed content of a thread with freshly fetched history.
    /// Outstanding placeholders survive and stay after the loaded messages.
    pub fn load(&mut self, key: &ConversationKey, history: Vec<Message>) {
        let placeholders: Vec<Message> = self
            .threads
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .filter(Message::is_placeholder)
            .collect();

        let mut thread: Vec<Message> = Vec::with_capacity(history.len() + placeholders.len());
        for msg in history {
            if msg.is_placeholder() || thread.iter().any(|m| m.id == msg.id) {
                continue;
            }
            thread.push(msg);
        }
        thread.extend(placeholders);
        self.threads.insert(key.clone(), thread);
    }

    /// Append a confirmed message; a duplicate id is a no-op and returns false
    pub fn append_confirmed(&mut self, key: &ConversationKey, message: Message) -> bool {
        if message.is_placeholder() || self.contains(key, message.id.as_str()) {
            return false;
        }
        self.threads.entry(key.clone()).or_default().push(message);
        true
    }

    pub fn append_placeholder(&mut self, key: &ConversationKey, message: Message) {
        debug_assert!(message.is_placeholder());
        self.threads.entry(key.clone()).or_default().push(message);
    }

    pub fn edit_by_id(&mut self, key: &ConversationKey, id: &str, content: &str) -> bool {
        let Some(msg) = self.find_confirmed_mut(key, id) else {
            return false;
        };
        if msg.content.as_deref() == Some(content) {
            return true;
        }
        msg.content = Some(content.to_string());
        msg.edited = true;
        true
    }

    pub fn remove_by_id(&mut self, key: &ConversationKey, id: &str) -> Option<Message> {
        let thread = self.threads.get_mut(key)?;
        let idx = thread.iter().position(|m| m.id.is_confirmed_as(id))?;
        Some(thread.remove(idx))
    }

    /// Drop every placeholder of a thread; returns how many went away
    pub fn discard_placeholders(&mut self, key: &ConversationKey) -> usize {
        let Some(thread) = self.threads.get_mut(key) else {
            return 0;
        };
        let before = thread.len();
        thread.retain(|m| !m.is_placeholder());
        before - thread.len()
    }

    pub fn discard_placeholder_by_correlation(&mut self, key: &ConversationKey, correlation: Uuid) -> bool {
        self.discard_where(key, |m| m.is_placeholder() && m.correlation_id == Some(correlation))
    }

    pub fn discard_placeholder(&mut self, key: &ConversationKey, placeholder: &MessageId) -> bool {
        self.discard_where(key, |m| &m.id == placeholder)
    }

    fn discard_where(&mut self, key: &ConversationKey, pred: impl Fn(&Message) -> bool) -> bool {
        let Some(thread) = self.threads.get_mut(key) else {
            return false;
        };
        match thread.iter().position(|m| pred(m)) {
            Some(idx) => {
                thread.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn has_placeholder_with(&self, key: &ConversationKey, correlation: Uuid) -> bool {
        self.thread(key)
            .iter()
            .any(|m| m.is_placeholder() && m.correlation_id == Some(correlation))
    }

    /// Move a pending thread under its newly known server id
    pub fn rekey(&mut self, from: &ConversationKey, to: &ConversationKey) {
        let Some(mut moved) = self.threads.remove(from) else {
            return;
        };
        if let Some(id) = to.conversation_id() {
            for msg in &mut moved {
                msg.conversation_id = Some(id.to_string());
            }
        }
        let target = self.threads.entry(to.clone()).or_default();
        for msg in moved {
            if msg.is_placeholder() || !target.iter().any(|m| m.id == msg.id) {
                target.push(msg);
            }
        }
    }

    /// Clear history: confirmed messages go, in-flight placeholders stay
    pub fn clear_confirmed(&mut self, key: &ConversationKey) -> usize {
        let Some(thread) = self.threads.get_mut(key) else {
            return 0;
        };
        let before = thread.len();
        thread.retain(Message::is_placeholder);
        before - thread.len()
    }

    pub fn drop_thread(&mut self, key: &ConversationKey) {
        self.threads.remove(key);
    }

    /// Apply a read receipt from `reader` to messages it did not send.
    /// `ids = None` covers the whole thread. Returns how many messages changed.
    pub fn mark_read_by(&mut self, key: &ConversationKey, reader: &str, ids: Option<&[String]>) -> usize {
        let Some(thread) = self.threads.get_mut(key) else {
            return 0;
        };
        let mut changed = 0;
        for msg in thread.iter_mut() {
            if msg.is_placeholder() || msg.sender == reader {
                continue;
            }
            if let Some(ids) = ids {
                if !ids.iter().any(|id| msg.id.is_confirmed_as(id)) {
                    continue;
                }
            }
            if msg.read.acknowledge(reader) {
                changed += 1;
            }
        }
        changed
    }

    pub fn contains(&self, key: &ConversationKey, id: &str) -> bool {
        self.thread(key).iter().any(|m| m.id.is_confirmed_as(id))
    }

    pub fn get(&self, key: &ConversationKey, id: &str) -> Option<&Message> {
        self.thread(key).iter().find(|m| m.id.is_confirmed_as(id))
    }

    fn find_confirmed_mut(&mut self, key: &ConversationKey, id: &str) -> Option<&mut Message> {
        self.threads
            .get_mut(key)?
            .iter_mut()
            .find(|m| m.id.is_confirmed_as(id))
    }

    pub fn thread(&self, key: &ConversationKey) -> &[Message] {
        self.threads.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_loaded(&self, key: &ConversationKey) -> bool {
        self.threads.contains_key(key)
    }

    pub fn placeholder_count(&self, key: &ConversationKey) -> usize {
        self.thread(key).iter().filter(|m| m.is_placeholder()).count()
    }

    pub fn clear(&mut self) {
        self.threads.clear();
    }
}
