//! Shared fixtures for the integration tests
#![allow(dead_code)]

use chatsync_core::chat_api::{ConversationRecord, MessageRecord};
use chatsync_core::hub::{HubCommand, HubEvent, IncomingMessage, SendTarget};
use chatsync_core::memory::{InMemoryChatApi, InMemoryHub};
use chatsync_core::messenger_types::{MembershipStatus, MessageKind};
use chatsync_core::{ChatSession, Config, SessionContext, SyncReconciler};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub const ME: &str = "me";

pub fn direct(id: &str, peer: &str, unread: u32) -> ConversationRecord {
    ConversationRecord {
        id: id.to_string(),
        is_group: false,
        title: None,
        participants: vec![ME.to_string(), peer.to_string()],
        last_message: None,
        unread_count: unread,
        membership: MembershipStatus::Member,
    }
}

pub fn group(id: &str, members: &[&str], unread: u32) -> ConversationRecord {
    ConversationRecord {
        id: id.to_string(),
        is_group: true,
        title: Some(format!("group {}", id)),
        participants: members.iter().map(|m| m.to_string()).collect(),
        last_message: None,
        unread_count: unread,
        membership: MembershipStatus::Member,
    }
}

pub fn record(id: &str, sender: &str, text: &str) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        sender: sender.to_string(),
        content: Some(text.to_string()),
        attachment: None,
        timestamp: Utc::now(),
        read_by: None,
        edited: false,
    }
}

pub fn incoming(id: &str, conversation_id: &str, sender: &str, text: &str) -> IncomingMessage {
    IncomingMessage {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        is_group: false,
        sender: sender.to_string(),
        content: Some(text.to_string()),
        attachment: None,
        kind: MessageKind::Text,
        timestamp: Utc::now(),
        correlation_id: None,
    }
}

/// Every SendMessage that reached the wire: (target, content, correlation id)
pub fn sent_messages(hub: &InMemoryHub) -> Vec<(SendTarget, Option<String>, Uuid)> {
    hub.sent()
        .into_iter()
        .filter_map(|cmd| match cmd {
            HubCommand::SendMessage {
                target,
                content,
                correlation_id,
                ..
            } => Some((target, content, correlation_id)),
            _ => None,
        })
        .collect()
}

pub struct Harness {
    pub chat: ChatSession,
    pub api: Arc<InMemoryChatApi>,
    pub hub: Arc<InMemoryHub>,
}

impl Harness {
    pub async fn new(
        conversations: Vec<ConversationRecord>,
        histories: Vec<(&str, Vec<MessageRecord>)>,
    ) -> Self {
        Self::with(Config::default(), SessionContext::begin(ME, Some("token".to_string())), conversations, histories).await
    }

    /// Build and settle the initial load
    pub async fn with(
        config: Config,
        session: SessionContext,
        conversations: Vec<ConversationRecord>,
        histories: Vec<(&str, Vec<MessageRecord>)>,
    ) -> Self {
        let mut harness = Self::unsettled(config, session, conversations, histories).await;
        harness.settle().await;
        harness
    }

    /// Build without waiting for the initial conversation list
    pub async fn unsettled(
        config: Config,
        session: SessionContext,
        conversations: Vec<ConversationRecord>,
        histories: Vec<(&str, Vec<MessageRecord>)>,
    ) -> Self {
        let api = Arc::new(InMemoryChatApi::new());
        api.set_conversations(conversations).await;
        for (id, history) in histories {
            api.set_history(id, history).await;
        }
        let hub = Arc::new(InMemoryHub::new());
        let chat = ChatSession::begin(config, session, api.clone(), hub.clone()).unwrap();
        Self { chat, api, hub }
    }

    pub fn rec(&mut self) -> &mut SyncReconciler {
        self.chat.reconciler_mut()
    }

    pub fn view(&self) -> &SyncReconciler {
        self.chat.reconciler()
    }

    pub async fn settle(&mut self) {
        self.chat.settle().await;
    }

    pub fn emit(&self, event: HubEvent) {
        self.hub.emit(event);
    }

    pub fn receive(&self, message: IncomingMessage) {
        self.hub.emit(HubEvent::MessageReceived { message });
    }

    /// Open and wait for history plus mark-read
    pub async fn open(&mut self, id: &str) {
        self.rec().open_conversation(id).unwrap();
        self.settle().await;
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.view().conversations().ids()
    }

    pub fn thread_ids(&self) -> Vec<String> {
        self.view()
            .active_thread()
            .iter()
            .map(|m| m.id.to_string())
            .collect()
    }

    pub fn unread(&self, id: &str) -> u32 {
        self.view().unread().unread(id)
    }

    pub async fn call_count(&self, call: &str) -> usize {
        self.api.calls().await.iter().filter(|c| *c == call).count()
    }
}
