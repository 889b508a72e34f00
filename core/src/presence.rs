/// Who is typing where, and who is online
/// Typing entries leave only on an explicit stop; there is no local expiry.
use crate::messenger_types::{ConversationId, UserId};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct TypingPresenceTracker {
    typing: HashMap<ConversationId, BTreeSet<UserId>>,
    online: HashSet<UserId>,
}

impl TypingPresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `user` was not already typing in `conversation_id`
    pub fn start_typing(&mut self, conversation_id: &str, user: &str) -> bool {
        self.typing
            .entry(conversation_id.to_string())
            .or_default()
            .insert(user.to_string())
    }

    /// Returns true if `user` was typing in `conversation_id`
    pub fn stop_typing(&mut self, conversation_id: &str, user: &str) -> bool {
        let Some(set) = self.typing.get_mut(conversation_id) else {
            return false;
        };
        let removed = set.remove(user);
        if set.is_empty() {
            self.typing.remove(conversation_id);
        }
        removed
    }

    pub fn typing_in(&self, conversation_id: &str) -> Vec<UserId> {
        self.typing
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_typing(&self, conversation_id: &str, user: &str) -> bool {
        self.typing
            .get(conversation_id)
            .is_some_and(|set| set.contains(user))
    }

    pub fn clear_conversation(&mut self, conversation_id: &str) -> bool {
        self.typing.remove(conversation_id).is_some()
    }

    /// Replace the online set with a full snapshot. Returns true on any change.
    pub fn replace_online(&mut self, users: Vec<UserId>) -> bool {
        let next: HashSet<UserId> = users.into_iter().collect();
        if next == self.online {
            return false;
        }
        self.online = next;
        true
    }

    pub fn set_online(&mut self, user: &str, online: bool) -> bool {
        if online {
            self.online.insert(user.to_string())
        } else {
            self.online.remove(user)
        }
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.online.contains(user)
    }

    pub fn online(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        self.typing.clear();
        self.online.clear();
    }
}
