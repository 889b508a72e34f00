//! Sync reconciler: the only writer to the conversation and message stores.
//!
//! Inbound hub events and local actions are applied here one at a time.
//! Network calls never run inline; they are spawned and report back as
//! `Completion` values which the owning event loop feeds into
//! `apply_completion`. Every continuation re-reads current state before it
//! commits anything.

use crate::chat_api::{ChatApi, ConversationRecord, MessageRecord};
use crate::config::{Config, ReconcileMode};
use crate::conversation_store::ConversationStore;
use crate::error::{Result, SyncError};
use crate::hub::{HubCommand, IncomingMessage, RealtimeHub, SendTarget};
use crate::message_store::MessageStore;
use crate::messenger_types::{
    Attachment, Conversation, ConversationId, ConversationKey, EngineUpdate, Message, MessageId,
    MessageKind, ReadState, UserId,
};
use crate::presence::TypingPresenceTracker;
use crate::session::SessionContext;
use crate::typing::TypingDebouncer;
use crate::unread::UnreadCounter;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one history fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation_id: ConversationId,
    pub generation: u64,
}

/// A mutating Chat API call awaiting its result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Edit {
        conversation_id: ConversationId,
        message_id: String,
        content: String,
    },
    Delete {
        conversation_id: ConversationId,
        message_id: String,
    },
    Clear {
        conversation_id: ConversationId,
    },
    Leave {
        conversation_id: ConversationId,
    },
    Block {
        user: UserId,
    },
}

impl PendingAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Edit { .. } => "edit_message",
            Self::Delete { .. } => "delete_message",
            Self::Clear { .. } => "clear_history",
            Self::Leave { .. } => "leave_group",
            Self::Block { .. } => "block_contact",
        }
    }
}

/// Result of spawned work, applied later on the event loop
#[derive(Debug)]
pub enum Completion {
    ConversationList {
        result: Result<Vec<ConversationRecord>>,
    },
    History {
        ticket: LoadTicket,
        result: Result<Vec<MessageRecord>>,
    },
    MarkRead {
        conversation_id: ConversationId,
        unread_at_dispatch: u32,
        result: Result<()>,
    },
    Action {
        action: PendingAction,
        result: Result<()>,
    },
    TypingQuiet {
        key: ConversationKey,
        burst: u64,
    },
}

/// Bounded memory of applied message ids, oldest evicted first
#[derive(Debug)]
pub struct DeliveryLedger {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl DeliveryLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if `id` was already recorded
    pub fn remember(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Point-in-time view of everything a UI would render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub user_id: UserId,
    pub connected: bool,
    pub active: Option<ConversationKey>,
    pub conversations: Vec<Conversation>,
    pub active_thread: Vec<Message>,
    pub typing: BTreeMap<ConversationId, Vec<UserId>>,
    pub online: Vec<UserId>,
    pub total_unread: u64,
}

#[derive(Debug, Default)]
struct RefetchState {
    in_flight: bool,
    queued: bool,
}

pub struct SyncReconciler {
    me: UserId,
    config: Config,
    session: SessionContext,
    api: Arc<dyn ChatApi>,
    hub: Arc<dyn RealtimeHub>,

    conversations: ConversationStore,
    messages: MessageStore,
    presence: TypingPresenceTracker,
    typing: TypingDebouncer,
    ledger: DeliveryLedger,

    completions: mpsc::UnboundedSender<Completion>,
    updates: broadcast::Sender<EngineUpdate>,

    load_generations: HashMap<ConversationId, u64>,
    refetch: RefetchState,
    initial_loaded: bool,
    /// Conversation requested before it could be resolved
    pending_target: Option<ConversationId>,
    next_placeholder: u64,
    pending_calls: usize,
    connected: bool,
}

impl SyncReconciler {
    /// Build a reconciler and the receiving end of its completion channel.
    /// The caller's event loop owns the receiver and hands every item back
    /// to `apply_completion`.
    pub fn new(
        config: Config,
        session: SessionContext,
        api: Arc<dyn ChatApi>,
        hub: Arc<dyn RealtimeHub>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        let typing = TypingDebouncer::new(config.typing_quiet_window, completions.clone());

        let reconciler = Self {
            me: session.user_id.clone(),
            ledger: DeliveryLedger::new(config.dedup_capacity),
            config,
            session,
            api,
            hub,
            conversations: ConversationStore::new(),
            messages: MessageStore::new(),
            presence: TypingPresenceTracker::new(),
            typing,
            completions,
            updates,
            load_generations: HashMap::new(),
            refetch: RefetchState::default(),
            initial_loaded: false,
            pending_target: None,
            next_placeholder: 0,
            pending_calls: 0,
            connected: true,
        };
        (reconciler, completion_rx)
    }

    /// Kick off the initial conversation-list load
    pub fn start(&mut self) {
        info!("Starting sync for user {}", self.me);
        self.request_refetch();
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    pub fn update_sender(&self) -> broadcast::Sender<EngineUpdate> {
        self.updates.clone()
    }

    fn emit(&self, update: EngineUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn user_id(&self) -> &str {
        &self.me
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn presence(&self) -> &TypingPresenceTracker {
        &self.presence
    }

    pub fn unread(&self) -> UnreadCounter<'_> {
        UnreadCounter::new(&self.conversations)
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.conversations.active()
    }

    /// Thread of the open conversation (empty when none is open)
    pub fn active_thread(&self) -> &[Message] {
        match self.conversations.active() {
            Some(key) => self.messages.thread(key),
            None => &[],
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_composing(&self, key: &ConversationKey) -> bool {
        self.typing.is_composing(key)
    }

    /// Spawned network calls whose completions have not been applied yet
    pub fn pending_calls(&self) -> usize {
        self.pending_calls
    }

    pub fn initial_load_done(&self) -> bool {
        self.initial_loaded
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let typing = self
            .conversations
            .list()
            .iter()
            .filter_map(|c| {
                let users = self.presence.typing_in(&c.id);
                (!users.is_empty()).then(|| (c.id.clone(), users))
            })
            .collect();

        EngineSnapshot {
            user_id: self.me.clone(),
            connected: self.connected,
            active: self.conversations.active().cloned(),
            conversations: self.conversations.list().to_vec(),
            active_thread: self.active_thread().to_vec(),
            typing,
            online: self.presence.online(),
            total_unread: self.unread().total(),
        }
    }

    /// Cancel timers, drop all state and hand back the session for persistence
    pub fn teardown(mut self) -> SessionContext {
        self.typing.cancel_all();
        self.conversations.clear();
        self.messages.clear();
        self.presence.clear();

        if let Some(dir) = &self.config.data_dir {
            if let Err(e) = self.session.save(dir) {
                warn!("Failed to persist session: {}", e);
            }
        }
        info!("Sync stopped for user {}", self.me);
        self.session.end();
        self.session
    }

    // ─── Spawned work ────────────────────────────────────────────────────────

    fn spawn_call<F>(&mut self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.pending_calls += 1;
        let tx = self.completions.clone();
        tokio::spawn(async move {
            let _ = tx.send(call.await);
        });
    }

    /// Full list refetch; at most one in flight, later triggers coalesce into one follow-up
    fn request_refetch(&mut self) {
        if self.refetch.in_flight {
            self.refetch.queued = true;
            debug!("Conversation refetch already in flight, queued");
            return;
        }
        self.refetch.in_flight = true;
        let api = self.api.clone();
        self.spawn_call(async move {
            Completion::ConversationList {
                result: api.list_conversations().await,
            }
        });
    }

    fn spawn_history(&mut self, conversation_id: &str) {
        let generation = {
            let g = self
                .load_generations
                .entry(conversation_id.to_string())
                .or_insert(0);
            *g += 1;
            *g
        };
        let ticket = LoadTicket {
            conversation_id: conversation_id.to_string(),
            generation,
        };
        debug!(conversation = %conversation_id, generation, "Loading history");

        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.fetch_history(&ticket.conversation_id).await;
            Completion::History { ticket, result }
        });
    }

    fn spawn_mark_read(&mut self, conversation_id: &str) {
        let unread_at_dispatch = self.unread().unread(conversation_id);
        let conversation_id = conversation_id.to_string();
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.mark_read(&conversation_id).await;
            Completion::MarkRead {
                conversation_id,
                unread_at_dispatch,
                result,
            }
        });
    }

    fn dispatch_action(&mut self, action: PendingAction) {
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = match &action {
                PendingAction::Edit {
                    conversation_id,
                    message_id,
                    content,
                } => api.edit_message(conversation_id, message_id, content).await,
                PendingAction::Delete {
                    conversation_id,
                    message_id,
                } => api.delete_message(conversation_id, message_id).await,
                PendingAction::Clear { conversation_id } => api.clear_history(conversation_id).await,
                PendingAction::Leave { conversation_id } => api.leave_group(conversation_id).await,
                PendingAction::Block { user } => api.block_contact(user).await,
            };
            Completion::Action { action, result }
        });
    }

    /// Apply one finished piece of spawned work
    pub fn apply_completion(&mut self, completion: Completion) {
        if !matches!(completion, Completion::TypingQuiet { .. }) {
            self.pending_calls = self.pending_calls.saturating_sub(1);
        }

        match completion {
            Completion::ConversationList { result } => self.apply_conversation_list(result),
            Completion::History { ticket, result } => self.apply_history(ticket, result),
            Completion::MarkRead {
                conversation_id,
                unread_at_dispatch,
                result,
            } => self.apply_mark_read(&conversation_id, unread_at_dispatch, result),
            Completion::Action { action, result } => self.apply_action(action, result),
            Completion::TypingQuiet { key, burst } => {
                if self.typing.quiet_elapsed(&key, burst) {
                    debug!(%key, "Typing quiet window elapsed");
                    self.notify_hub(HubCommand::TypingStopped {
                        target: send_target(&key),
                    });
                }
            }
        }
    }

    fn apply_conversation_list(&mut self, result: Result<Vec<ConversationRecord>>) {
        self.refetch.in_flight = false;

        match result {
            Ok(records) => {
                let previous = self.conversations.active().cloned();
                let open_unread = self
                    .conversations
                    .active_conversation()
                    .map(|c| (c.id.clone(), c.unread_count));

                let mut incoming: Vec<Conversation> =
                    records.into_iter().map(Conversation::from).collect();
                // The open conversation's local count is authoritative
                if let Some((id, unread)) = open_unread {
                    if let Some(conv) = incoming.iter_mut().find(|c| c.id == id) {
                        conv.unread_count = unread;
                    }
                }

                let vanished = self.conversations.upsert_many(incoming);
                info!("Loaded {} conversations", self.conversations.len());

                if vanished {
                    if let Some(prev) = &previous {
                        warn!("Open conversation {} no longer exists", prev);
                        self.end_typing_burst(prev);
                    }
                    self.emit(EngineUpdate::ActiveChanged { key: None });
                }

                let requested = self.pending_target.take();
                if !self.initial_loaded {
                    self.initial_loaded = true;
                    if self.conversations.active().is_none() {
                        let restored = self.conversations.restore_selection(
                            requested.as_deref(),
                            self.session.last_active.as_deref(),
                        );
                        if let Some(id) = restored {
                            self.select(&id);
                        }
                    }
                } else if let Some(id) = requested {
                    if self.conversations.contains(&id) {
                        self.select(&id);
                    } else {
                        warn!("Requested conversation {} not found after refetch", id);
                        self.emit(EngineUpdate::RequestFailed {
                            action: "open_conversation".to_string(),
                            reason: SyncError::UnknownConversation(id).to_string(),
                        });
                    }
                }

                self.emit(EngineUpdate::ConversationsChanged);
            }
            Err(e) => {
                warn!("Conversation list fetch failed: {}", e);
                self.emit(EngineUpdate::RequestFailed {
                    action: "list_conversations".to_string(),
                    reason: e.to_string(),
                });
            }
        }

        if self.refetch.queued {
            self.refetch.queued = false;
            self.request_refetch();
        }
    }

    fn apply_history(&mut self, ticket: LoadTicket, result: Result<Vec<MessageRecord>>) {
        let id = ticket.conversation_id.as_str();
        let latest = self.load_generations.get(id).copied();
        if !self.conversations.is_active(id) || latest != Some(ticket.generation) {
            debug!(
                conversation = %id,
                generation = ticket.generation,
                "Discarding stale history load"
            );
            return;
        }

        match result {
            Ok(records) => {
                let is_group = self.conversations.get(id).is_some_and(|c| c.is_group);
                let history: Vec<Message> = records
                    .into_iter()
                    .map(|r| r.into_message(id, is_group))
                    .collect();
                for msg in &history {
                    self.ledger.remember(msg.id.as_str());
                }
                let key = ConversationKey::id(id);
                debug!(conversation = %id, count = history.len(), "History loaded");
                self.messages.load(&key, history);
                self.emit(EngineUpdate::ThreadChanged { key });
            }
            Err(e) => {
                warn!("History fetch for {} failed: {}", id, e);
                self.emit(EngineUpdate::RequestFailed {
                    action: "fetch_history".to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply_mark_read(&mut self, id: &str, unread_at_dispatch: u32, result: Result<()>) {
        match result {
            Ok(()) => {
                let key = ConversationKey::id(id);
                let changed = if self.conversations.is_active(id) {
                    self.conversations.mark_all_read(id)
                } else {
                    self.conversations
                        .acknowledge_unread(id, unread_at_dispatch)
                        .is_some()
                };
                if self.messages.mark_read_by(&key, &self.me, None) > 0 {
                    self.emit(EngineUpdate::ThreadChanged { key });
                }
                if changed {
                    self.emit(EngineUpdate::ConversationsChanged);
                }
            }
            Err(e) => {
                warn!("Mark-read for {} failed: {}", id, e);
                self.emit(EngineUpdate::RequestFailed {
                    action: "mark_read".to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply_action(&mut self, action: PendingAction, result: Result<()>) {
        if let Err(e) = result {
            warn!("{} failed: {}", action.name(), e);
            self.emit(EngineUpdate::RequestFailed {
                action: action.name().to_string(),
                reason: e.to_string(),
            });
            return;
        }

        match action {
            PendingAction::Edit {
                conversation_id,
                message_id,
                content,
            } => {
                let key = ConversationKey::id(conversation_id.as_str());
                if self.messages.edit_by_id(&key, &message_id, &content) {
                    self.emit(EngineUpdate::ThreadChanged { key });
                }
                self.notify_hub(HubCommand::EditMessage {
                    conversation_id,
                    message_id,
                    content,
                });
            }
            PendingAction::Delete {
                conversation_id,
                message_id,
            } => {
                let key = ConversationKey::id(conversation_id.as_str());
                if self.messages.remove_by_id(&key, &message_id).is_some() {
                    self.emit(EngineUpdate::ThreadChanged { key });
                }
                self.notify_hub(HubCommand::DeleteMessage {
                    conversation_id,
                    message_id,
                });
            }
            PendingAction::Clear { conversation_id } => {
                let key = ConversationKey::id(conversation_id.as_str());
                let removed = self.messages.clear_confirmed(&key);
                self.conversations.clear_last_message(&conversation_id);
                info!("Cleared {} messages from {}", removed, conversation_id);
                self.emit(EngineUpdate::ThreadChanged { key });
                self.emit(EngineUpdate::ConversationsChanged);
                self.notify_hub(HubCommand::ClearChat { conversation_id });
            }
            PendingAction::Leave { conversation_id } => {
                self.notify_hub(HubCommand::LeaveGroup {
                    conversation_id: conversation_id.clone(),
                });
                self.remove_conversation(&conversation_id);
            }
            PendingAction::Block { user } => {
                let direct = self
                    .conversations
                    .find_direct_with(&self.me, &user)
                    .map(|c| c.id.clone());
                if let Some(id) = direct {
                    self.remove_conversation(&id);
                }
                let pending = ConversationKey::pending(user.as_str());
                if self.conversations.active() == Some(&pending) {
                    self.close_conversation();
                }
                self.messages.drop_thread(&pending);
                info!("Blocked {}", user);
            }
        }
    }

    fn notify_hub(&self, command: HubCommand) {
        if let Err(e) = self.hub.send(command) {
            warn!("Hub rejected command: {}", e);
        }
    }

    fn end_typing_burst(&mut self, key: &ConversationKey) {
        if self.typing.finish(key) {
            self.notify_hub(HubCommand::TypingStopped {
                target: send_target(key),
            });
        }
    }

    /// Drop a conversation with everything cached about it
    fn remove_conversation(&mut self, id: &str) {
        let key = ConversationKey::id(id);
        let was_active = self.conversations.is_active(id);
        self.end_typing_burst(&key);

        if self.conversations.remove_by_id(id).is_none() {
            return;
        }
        self.messages.drop_thread(&key);
        self.presence.clear_conversation(id);
        if self.session.last_active.as_deref() == Some(id) {
            self.session.last_active = None;
        }
        info!("Removed conversation {}", id);

        if was_active {
            self.emit(EngineUpdate::ActiveChanged { key: None });
        }
        self.emit(EngineUpdate::ConversationsChanged);
    }

    /// Make a listed conversation the open one: history load and mark-read go out
    fn select(&mut self, id: &str) {
        let key = ConversationKey::id(id);
        if let Some(prev) = self.conversations.active().cloned() {
            if prev != key {
                self.end_typing_burst(&prev);
            }
        }

        self.conversations.set_active(Some(key.clone()));
        self.session.last_active = Some(id.to_string());
        self.spawn_history(id);
        self.spawn_mark_read(id);
        info!("Opened conversation {}", id);
        self.emit(EngineUpdate::ActiveChanged { key: Some(key) });
    }

    // ─── Local actions ───────────────────────────────────────────────────────

    /// Open a conversation by id. Unknown ids trigger a refetch and are opened
    /// once they appear.
    pub fn open_conversation(&mut self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(SyncError::InvalidAction("empty conversation id".to_string()));
        }
        if !self.initial_loaded {
            debug!("Initial load pending, deferring open of {}", id);
            self.pending_target = Some(id.to_string());
            return Ok(());
        }
        if self.conversations.is_active(id) {
            return Ok(());
        }
        if !self.conversations.contains(id) {
            info!("Conversation {} not known yet, refetching", id);
            self.pending_target = Some(id.to_string());
            self.request_refetch();
            return Ok(());
        }
        self.select(id);
        Ok(())
    }

    /// Open the 1:1 conversation with `peer`, creating a pending one if none exists
    pub fn open_with_peer(&mut self, peer: &str) -> Result<ConversationKey> {
        if peer.is_empty() || peer == self.me {
            return Err(SyncError::InvalidAction(format!(
                "cannot open a conversation with '{}'",
                peer
            )));
        }

        let existing = self
            .conversations
            .find_direct_with(&self.me, peer)
            .map(|c| c.id.clone());
        if let Some(id) = existing {
            if !self.conversations.is_active(&id) {
                self.select(&id);
            }
            return Ok(ConversationKey::id(id));
        }

        let key = ConversationKey::pending(peer);
        if self.conversations.active() == Some(&key) {
            return Ok(key);
        }
        if let Some(prev) = self.conversations.active().cloned() {
            self.end_typing_burst(&prev);
        }
        self.conversations.set_active(Some(key.clone()));
        info!("Started new conversation with {}", peer);
        self.emit(EngineUpdate::ActiveChanged {
            key: Some(key.clone()),
        });
        Ok(key)
    }

    pub fn close_conversation(&mut self) {
        let Some(prev) = self.conversations.active().cloned() else {
            return;
        };
        self.end_typing_burst(&prev);
        self.conversations.set_active(None);
        debug!("Closed conversation {}", prev);
        self.emit(EngineUpdate::ActiveChanged { key: None });
    }

    /// Optimistic send into the open conversation. Returns the placeholder id.
    pub fn send_message(
        &mut self,
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<MessageId> {
        let key = self
            .conversations
            .active()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;
        let content = content.filter(|c| !c.trim().is_empty());
        if content.is_none() && attachment.is_none() {
            return Err(SyncError::InvalidAction("message is empty".to_string()));
        }

        self.next_placeholder += 1;
        let id = MessageId::Placeholder(format!("temp-{}", self.next_placeholder));
        let correlation_id = Uuid::new_v4();
        let kind = match (&content, &attachment) {
            (None, Some(att)) => att.kind(),
            _ => MessageKind::Text,
        };
        let is_group = key
            .conversation_id()
            .and_then(|c| self.conversations.get(c))
            .is_some_and(|c| c.is_group);

        let placeholder = Message {
            id: id.clone(),
            conversation_id: key.conversation_id().map(str::to_string),
            sender: self.me.clone(),
            content: content.clone(),
            attachment: attachment.clone(),
            kind,
            timestamp: Utc::now(),
            read: ReadState::unread(is_group),
            correlation_id: Some(correlation_id),
            edited: false,
        };
        self.messages.append_placeholder(&key, placeholder);
        self.end_typing_burst(&key);

        let command = HubCommand::SendMessage {
            target: send_target(&key),
            content,
            attachment,
            correlation_id,
        };
        if let Err(e) = self.hub.send(command) {
            warn!("Send to {} rejected: {}", key, e);
            self.messages.discard_placeholder(&key, &id);
            self.emit(EngineUpdate::ThreadChanged { key });
            return Err(SyncError::Transport(e.to_string()));
        }

        debug!(%key, placeholder = %id, %correlation_id, "Message queued");
        self.emit(EngineUpdate::ThreadChanged { key });
        Ok(id)
    }

    /// Local keystroke in the open conversation's composer
    pub fn note_keystroke(&mut self) -> Result<()> {
        let key = self
            .conversations
            .active()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;
        if self.typing.keystroke(&key) {
            self.notify_hub(HubCommand::TypingStarted {
                target: send_target(&key),
            });
        }
        Ok(())
    }

    /// Own confirmed message in the open conversation, or an error
    fn own_open_message(&self, message_id: &str) -> Result<ConversationId> {
        let key = self
            .conversations
            .active()
            .ok_or(SyncError::NoActiveConversation)?;
        let conversation_id = key.conversation_id().ok_or_else(|| {
            SyncError::InvalidAction("conversation has not been created yet".to_string())
        })?;
        let message = self
            .messages
            .get(key, message_id)
            .ok_or_else(|| SyncError::MessageNotFound(message_id.to_string()))?;
        if message.sender != self.me {
            return Err(SyncError::InvalidAction(
                "only your own messages can be changed".to_string(),
            ));
        }
        Ok(conversation_id.to_string())
    }

    pub fn edit_message(&mut self, message_id: &str, content: &str) -> Result<()> {
        let conversation_id = self.own_open_message(message_id)?;
        if content.trim().is_empty() {
            return Err(SyncError::InvalidAction("edited message is empty".to_string()));
        }
        self.dispatch_action(PendingAction::Edit {
            conversation_id,
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    pub fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let conversation_id = self.own_open_message(message_id)?;
        self.dispatch_action(PendingAction::Delete {
            conversation_id,
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    pub fn clear_history(&mut self, conversation_id: &str) -> Result<()> {
        if !self.conversations.contains(conversation_id) {
            return Err(SyncError::UnknownConversation(conversation_id.to_string()));
        }
        self.dispatch_action(PendingAction::Clear {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    pub fn leave_group(&mut self, conversation_id: &str) -> Result<()> {
        let conv = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?;
        if !conv.is_group {
            return Err(SyncError::InvalidAction(format!(
                "{} is not a group",
                conversation_id
            )));
        }
        self.dispatch_action(PendingAction::Leave {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    pub fn block_contact(&mut self, user: &str) -> Result<()> {
        if user.is_empty() || user == self.me {
            return Err(SyncError::InvalidAction(format!("cannot block '{}'", user)));
        }
        self.dispatch_action(PendingAction::Block {
            user: user.to_string(),
        });
        Ok(())
    }

    pub fn refresh_conversations(&mut self) {
        self.request_refetch();
    }

    // ─── Inbound events ──────────────────────────────────────────────────────

    /// Does a message for `conversation_id` belong to the open conversation?
    /// A pending conversation is promoted to its server id on the first match.
    fn resolve_open(&mut self, conversation_id: &str, is_group: bool, message: &Message) -> bool {
        match self.conversations.active().cloned() {
            Some(ConversationKey::Id { id }) => id == conversation_id,
            Some(ConversationKey::Pending { peer }) => {
                let pending = ConversationKey::pending(peer.as_str());
                let from_peer = !is_group && message.sender == peer;
                let own_echo = message
                    .correlation_id
                    .is_some_and(|c| self.messages.has_placeholder_with(&pending, c));
                if !(from_peer || own_echo) {
                    return false;
                }
                self.promote_pending(&pending, &peer, conversation_id);
                true
            }
            None => false,
        }
    }

    fn promote_pending(&mut self, pending: &ConversationKey, peer: &str, conversation_id: &str) {
        let key = ConversationKey::id(conversation_id);
        self.end_typing_burst(pending);
        self.messages.rekey(pending, &key);
        if !self.conversations.contains(conversation_id) {
            self.conversations
                .upsert_one(Conversation::direct(conversation_id, &self.me, peer));
        }
        self.conversations.set_active(Some(key.clone()));
        self.session.last_active = Some(conversation_id.to_string());
        info!("Conversation with {} is now {}", peer, conversation_id);
        self.emit(EngineUpdate::ActiveChanged { key: Some(key) });
        self.emit(EngineUpdate::ConversationsChanged);
    }

    fn reconcile_placeholders(&mut self, key: &ConversationKey, message: &Message) -> usize {
        match (self.config.reconcile_mode, message.correlation_id) {
            (ReconcileMode::Legacy, _) => self.messages.discard_placeholders(key),
            (ReconcileMode::Correlated, Some(c)) => {
                usize::from(self.messages.discard_placeholder_by_correlation(key, c))
            }
            (ReconcileMode::Correlated, None) if message.sender == self.me => {
                self.messages.discard_placeholders(key)
            }
            (ReconcileMode::Correlated, None) => 0,
        }
    }

    pub fn on_message_received(&mut self, incoming: IncomingMessage) {
        let conversation_id = incoming.conversation_id.clone();
        let is_group = incoming.is_group;
        let message = incoming.into_message();
        let message_id = message.id.as_str().to_string();

        let open = self.resolve_open(&conversation_id, is_group, &message);
        let key = ConversationKey::id(conversation_id.as_str());

        let duplicate = self.ledger.contains(&message_id)
            || (open && self.messages.contains(&key, &message_id));
        if duplicate {
            debug!(conversation = %conversation_id, message = %message_id, "Duplicate delivery ignored");
            // The server copy may already be in the thread (history reload); its placeholders still go
            let discarded = if open {
                self.reconcile_placeholders(&key, &message)
            } else {
                message.correlation_id.map_or(0, |c| {
                    usize::from(self.messages.discard_placeholder_by_correlation(&key, c))
                })
            };
            if discarded > 0 {
                self.emit(EngineUpdate::ThreadChanged { key });
            }
            return;
        }
        self.ledger.remember(&message_id);

        if open {
            self.apply_open_message(key, &conversation_id, message);
            return;
        }

        if self.refetch_if_unknown(&conversation_id, "message received") {
            return;
        }

        let from_me = message.sender == self.me;
        self.conversations
            .update_last_message(&conversation_id, message.preview());
        if !from_me {
            self.conversations.increment_unread(&conversation_id);
        }
        if let Some(c) = message.correlation_id {
            if self.messages.discard_placeholder_by_correlation(&key, c) {
                self.emit(EngineUpdate::ThreadChanged { key });
            }
        }
        self.conversations.move_to_front(&conversation_id);
        self.emit(EngineUpdate::ConversationsChanged);
    }

    fn apply_open_message(&mut self, key: ConversationKey, conversation_id: &str, message: Message) {
        let sender = message.sender.clone();
        let preview = message.preview();

        let discarded = self.reconcile_placeholders(&key, &message);
        if discarded > 0 {
            debug!(conversation = %conversation_id, discarded, "Placeholders reconciled");
        }
        self.messages.append_confirmed(&key, message);

        if self.presence.stop_typing(conversation_id, &sender) {
            self.emit(EngineUpdate::TypingChanged {
                conversation_id: conversation_id.to_string(),
                typing: self.presence.typing_in(conversation_id),
            });
        }

        if self.conversations.update_last_message(conversation_id, preview) {
            self.conversations.move_to_front(conversation_id);
        } else {
            warn!("Open conversation {} missing from list, refetching", conversation_id);
            self.request_refetch();
        }

        if sender != self.me {
            self.spawn_mark_read(conversation_id);
        }
        self.emit(EngineUpdate::ThreadChanged { key });
        self.emit(EngineUpdate::ConversationsChanged);
    }

    /// Event for a conversation we do not have: report the anomaly and refetch.
    /// Returns true when the event must not be applied.
    fn refetch_if_unknown(&mut self, conversation_id: &str, event: &str) -> bool {
        if self.conversations.contains(conversation_id) {
            return false;
        }
        let anomaly = SyncError::Integrity(format!(
            "{} for unknown conversation {}",
            event, conversation_id
        ));
        warn!("{}, refetching", anomaly);
        self.request_refetch();
        true
    }

    pub fn on_message_edited(&mut self, conversation_id: &str, message_id: &str, content: &str) {
        if self.refetch_if_unknown(conversation_id, "message edited") {
            return;
        }
        let key = ConversationKey::id(conversation_id);
        if self.messages.edit_by_id(&key, message_id, content) {
            self.emit(EngineUpdate::ThreadChanged { key });
        } else {
            debug!(conversation = %conversation_id, message = %message_id, "Edit for message not loaded");
        }
    }

    pub fn on_message_deleted(&mut self, conversation_id: &str, message_id: &str) {
        if self.refetch_if_unknown(conversation_id, "message deleted") {
            return;
        }
        let key = ConversationKey::id(conversation_id);
        if self.messages.remove_by_id(&key, message_id).is_some() {
            self.emit(EngineUpdate::ThreadChanged { key });
        } else {
            debug!(conversation = %conversation_id, message = %message_id, "Delete for message not loaded");
        }
    }

    pub fn on_typing_started(&mut self, conversation_id: &str, user: &str) {
        if user == self.me || self.refetch_if_unknown(conversation_id, "typing started") {
            return;
        }
        if self.presence.start_typing(conversation_id, user) {
            self.emit(EngineUpdate::TypingChanged {
                conversation_id: conversation_id.to_string(),
                typing: self.presence.typing_in(conversation_id),
            });
        }
    }

    pub fn on_typing_stopped(&mut self, conversation_id: &str, user: &str) {
        if user == self.me || self.refetch_if_unknown(conversation_id, "typing stopped") {
            return;
        }
        if self.presence.stop_typing(conversation_id, user) {
            self.emit(EngineUpdate::TypingChanged {
                conversation_id: conversation_id.to_string(),
                typing: self.presence.typing_in(conversation_id),
            });
        }
    }

    pub fn on_messages_read(&mut self, conversation_id: &str, reader: &str, message_ids: Option<&[String]>) {
        if reader == self.me {
            debug!(conversation = %conversation_id, "Own read receipt ignored");
            return;
        }
        if self.refetch_if_unknown(conversation_id, "messages read") {
            return;
        }
        let key = ConversationKey::id(conversation_id);
        let changed = self.messages.mark_read_by(&key, reader, message_ids);
        if changed > 0 {
            debug!(conversation = %conversation_id, reader, changed, "Read receipts applied");
            self.emit(EngineUpdate::ThreadChanged { key });
        }
    }

    pub fn on_online_list(&mut self, users: Vec<UserId>) {
        if self.presence.replace_online(users) {
            self.emit(EngineUpdate::PresenceChanged);
        }
    }

    pub fn on_presence_changed(&mut self, user: &str, online: bool) {
        if self.presence.set_online(user, online) {
            self.emit(EngineUpdate::PresenceChanged);
        }
    }

    pub fn on_group_created(&mut self, record: ConversationRecord) {
        let conversation = Conversation::from(record);
        let id = conversation.id.clone();
        let known = self.conversations.contains(&id);
        self.conversations.upsert_one(conversation);
        if !known {
            info!("Joined group {}", id);
        }
        self.emit(EngineUpdate::ConversationsChanged);
    }

    pub fn on_membership_changed(&mut self, conversation_id: &str, added: &[UserId], removed: &[UserId]) {
        if removed.iter().any(|u| *u == self.me) {
            info!("Removed from {}", conversation_id);
            self.remove_conversation(conversation_id);
            return;
        }
        if self.refetch_if_unknown(conversation_id, "membership change") {
            return;
        }
        if self.conversations.update_participants(conversation_id, added, removed) {
            self.emit(EngineUpdate::ConversationsChanged);
        }
    }

    pub fn on_connection_lost(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        warn!("Realtime connection lost: {}", reason);
        self.emit(EngineUpdate::ConnectionChanged { connected: false });
    }

    /// Anything may have been missed while offline: refetch the list and the open thread
    pub fn on_connection_restored(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        info!("Realtime connection restored, resynchronizing");
        self.request_refetch();
        let open = self
            .conversations
            .active()
            .and_then(ConversationKey::conversation_id)
            .map(str::to_string);
        if let Some(id) = open {
            self.spawn_history(&id);
        }
        self.emit(EngineUpdate::ConnectionChanged { connected: true });
    }
}

fn send_target(key: &ConversationKey) -> SendTarget {
    match key {
        ConversationKey::Id { id } => SendTarget::Conversation(id.clone()),
        ConversationKey::Pending { peer } => SendTarget::Peer(peer.clone()),
    }
}
