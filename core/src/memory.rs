//! In-memory Chat API and Realtime Hub.
//!
//! Used by the replay binary and the integration tests. The Chat API can hold
//! a history fetch behind a gate and inject failures per operation; the hub
//! buffers outbound commands while disconnected and flushes them on reconnect.

use crate::chat_api::{ChatApi, ConversationRecord, MessageRecord};
use crate::error::{Result, SyncError};
use crate::hub::{EventKind, HubCommand, HubEvent, RealtimeHub, SubscriptionId};
use crate::messenger_types::ConversationId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

// ─── Chat API ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ApiState {
    conversations: Vec<ConversationRecord>,
    histories: HashMap<ConversationId, Vec<MessageRecord>>,
    gates: HashMap<ConversationId, oneshot::Receiver<()>>,
    failing: HashSet<String>,
    calls: Vec<String>,
    blocked: Vec<String>,
}

impl ApiState {
    /// Record the call and fail it if failures are injected for `op`
    fn enter(&mut self, op: &str, target: &str) -> Result<()> {
        self.calls.push(format!("{} {}", op, target).trim_end().to_string());
        if self.failing.contains(op) {
            return Err(SyncError::Request(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryChatApi {
    state: RwLock<ApiState>,
}

impl InMemoryChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_conversations(&self, conversations: Vec<ConversationRecord>) {
        self.state.write().await.conversations = conversations;
    }

    pub async fn set_history(&self, conversation_id: &str, history: Vec<MessageRecord>) {
        self.state
            .write()
            .await
            .histories
            .insert(conversation_id.to_string(), history);
    }

    /// Hold the next history fetch of `conversation_id` until the returned sender fires
    /// (or is dropped). The history is read when the call starts.
    pub async fn hold_history(&self, conversation_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state
            .write()
            .await
            .gates
            .insert(conversation_id.to_string(), rx);
        tx
    }

    /// Make every call of `op` (e.g. "mark_read") fail until switched off again
    pub async fn set_failing(&self, op: &str, failing: bool) {
        let mut state = self.state.write().await;
        if failing {
            state.failing.insert(op.to_string());
        } else {
            state.failing.remove(op);
        }
    }

    /// Calls in arrival order, as "op target"
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    pub async fn conversations(&self) -> Vec<ConversationRecord> {
        self.state.read().await.conversations.clone()
    }

    pub async fn history(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.state
            .read()
            .await
            .histories
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn blocked(&self) -> Vec<String> {
        self.state.read().await.blocked.clone()
    }
}

#[async_trait]
impl ChatApi for InMemoryChatApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        let mut state = self.state.write().await;
        state.enter("list_conversations", "")?;
        Ok(state.conversations.clone())
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let (history, gate) = {
            let mut state = self.state.write().await;
            state.enter("fetch_history", conversation_id)?;
            let history = state
                .histories
                .get(conversation_id)
                .cloned()
                .unwrap_or_default();
            (history, state.gates.remove(conversation_id))
        };
        if let Some(gate) = gate {
            debug!("History fetch for {} held", conversation_id);
            let _ = gate.await;
        }
        Ok(history)
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("mark_read", conversation_id)?;
        if let Some(conv) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conv.unread_count = 0;
        }
        Ok(())
    }

    async fn edit_message(&self, conversation_id: &str, message_id: &str, content: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("edit_message", message_id)?;
        let msg = state
            .histories
            .get_mut(conversation_id)
            .and_then(|h| h.iter_mut().find(|m| m.id == message_id));
        if let Some(msg) = msg {
            msg.content = Some(content.to_string());
            msg.edited = true;
        }
        Ok(())
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_message", message_id)?;
        if let Some(history) = state.histories.get_mut(conversation_id) {
            history.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn clear_history(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("clear_history", conversation_id)?;
        state.histories.remove(conversation_id);
        if let Some(conv) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conv.last_message = None;
        }
        Ok(())
    }

    async fn leave_group(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("leave_group", conversation_id)?;
        state.conversations.retain(|c| c.id != conversation_id);
        Ok(())
    }

    async fn block_contact(&self, user: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("block_contact", user)?;
        state
            .conversations
            .retain(|c| c.is_group || !c.participants.iter().any(|p| p == user));
        state.blocked.push(user.to_string());
        Ok(())
    }
}

// ─── Realtime Hub ────────────────────────────────────────────────────────────

struct HubState {
    next_id: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, (EventKind, tokio::sync::mpsc::UnboundedSender<HubEvent>)>,
    connected: bool,
    outbox: Vec<HubCommand>,
    sent: Vec<HubCommand>,
    rejecting: bool,
    fail_subscribe_after: Option<usize>,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            next_id: 1,
            subscriptions: HashMap::new(),
            connected: true,
            outbox: Vec::new(),
            sent: Vec::new(),
            rejecting: false,
            fail_subscribe_after: None,
        }
    }
}

impl HubState {
    fn deliver(&mut self, event: HubEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for (sub_kind, sink) in self.subscriptions.values() {
            if *sub_kind == kind && sink.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[derive(Default)]
pub struct InMemoryHub {
    state: Mutex<HubState>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Transport("hub state poisoned".to_string()))
    }

    /// Push an event to subscribers. Nothing arrives while disconnected.
    /// Returns how many subscribers received it.
    pub fn emit(&self, event: HubEvent) -> usize {
        match self.lock() {
            Ok(mut state) if state.connected => state.deliver(event),
            _ => 0,
        }
    }

    pub fn disconnect(&self, reason: &str) {
        if let Ok(mut state) = self.lock() {
            if !state.connected {
                return;
            }
            state.connected = false;
            state.deliver(HubEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Reconnect and flush the outbound buffer. Returns the flushed commands.
    pub fn reconnect(&self) -> Vec<HubCommand> {
        let Ok(mut state) = self.lock() else {
            return Vec::new();
        };
        if state.connected {
            return Vec::new();
        }
        state.connected = true;
        let flushed: Vec<HubCommand> = state.outbox.drain(..).collect();
        state.sent.extend(flushed.iter().cloned());
        state.deliver(HubEvent::ConnectionRestored);
        flushed
    }

    /// Refuse every outbound command (transport rejects outright)
    pub fn set_rejecting(&self, rejecting: bool) {
        if let Ok(mut state) = self.lock() {
            state.rejecting = rejecting;
        }
    }

    /// Let `n` subscriptions succeed, then fail the rest
    pub fn fail_subscriptions_after(&self, n: usize) {
        if let Ok(mut state) = self.lock() {
            state.fail_subscribe_after = Some(n);
        }
    }

    /// Commands that reached the wire, in order
    pub fn sent(&self) -> Vec<HubCommand> {
        self.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Commands buffered while disconnected
    pub fn outbox(&self) -> Vec<HubCommand> {
        self.lock().map(|s| s.outbox.clone()).unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().map(|s| s.subscriptions.len()).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().map(|s| s.connected).unwrap_or(false)
    }
}

impl RealtimeHub for InMemoryHub {
    fn subscribe(
        &self,
        kind: EventKind,
        sink: tokio::sync::mpsc::UnboundedSender<HubEvent>,
    ) -> Result<SubscriptionId> {
        let mut state = self.lock()?;
        if let Some(limit) = state.fail_subscribe_after {
            if state.subscriptions.len() >= limit {
                return Err(SyncError::Transport(format!("cannot subscribe to {:?}", kind)));
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscriptions.insert(id, (kind, sink));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut state = self.lock()?;
        match state.subscriptions.remove(&id) {
            Some(_) => Ok(()),
            None => Err(SyncError::Transport(format!("unknown subscription {}", id))),
        }
    }

    fn send(&self, command: HubCommand) -> Result<()> {
        let mut state = self.lock()?;
        if state.rejecting {
            return Err(SyncError::Transport("hub rejected command".to_string()));
        }
        if state.connected {
            state.sent.push(command);
        } else {
            state.outbox.push(command);
        }
        Ok(())
    }
}
