/// Socket event router: single subscription point for hub push events
///
/// Subscribes to every event kind on start, unsubscribes all of them on stop
/// (or drop), and hands each routed event to the matching reconciler handler.
use crate::error::Result;
use crate::hub::{EventKind, HubEvent, RealtimeHub, SubscriptionId};
use crate::reconciler::SyncReconciler;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SocketEventRouter {
    hub: Arc<dyn RealtimeHub>,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
}

impl SocketEventRouter {
    pub fn new(hub: Arc<dyn RealtimeHub>) -> Self {
        Self {
            hub,
            subscriptions: Vec::new(),
        }
    }

    /// Subscribe `sink` to the full event set. A failure part-way rolls back
    /// the subscriptions already made.
    pub fn start(&mut self, sink: mpsc::UnboundedSender<HubEvent>) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        for kind in EventKind::ALL {
            match self.hub.subscribe(kind, sink.clone()) {
                Ok(id) => self.subscriptions.push((kind, id)),
                Err(e) => {
                    warn!("Subscribing to {:?} failed: {}", kind, e);
                    self.stop();
                    return Err(e);
                }
            }
        }
        info!("Event router subscribed to {} event kinds", self.subscriptions.len());
        Ok(())
    }

    /// Remove every subscription; returns how many were removed
    pub fn stop(&mut self) -> usize {
        let mut removed = 0;
        for (kind, id) in self.subscriptions.drain(..) {
            match self.hub.unsubscribe(id) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Unsubscribing from {:?} failed: {}", kind, e),
            }
        }
        if removed > 0 {
            debug!("Event router removed {} subscriptions", removed);
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.subscriptions.iter().any(|(k, _)| *k == kind)
    }

    /// Route one event. Events of a kind we are not subscribed to are dropped.
    pub fn dispatch(&self, reconciler: &mut SyncReconciler, event: HubEvent) -> bool {
        let kind = event.kind();
        if !self.is_subscribed(kind) {
            debug!("Dropping {:?} event: not subscribed", kind);
            return false;
        }

        match event {
            HubEvent::MessageReceived { message } => reconciler.on_message_received(message),
            HubEvent::MessageEdited {
                conversation_id,
                message_id,
                content,
            } => reconciler.on_message_edited(&conversation_id, &message_id, &content),
            HubEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => reconciler.on_message_deleted(&conversation_id, &message_id),
            HubEvent::TypingStarted {
                conversation_id,
                user,
            } => reconciler.on_typing_started(&conversation_id, &user),
            HubEvent::TypingStopped {
                conversation_id,
                user,
            } => reconciler.on_typing_stopped(&conversation_id, &user),
            HubEvent::MessagesRead {
                conversation_id,
                reader,
                message_ids,
            } => reconciler.on_messages_read(&conversation_id, &reader, message_ids.as_deref()),
            HubEvent::OnlineList { users } => reconciler.on_online_list(users),
            HubEvent::PresenceChanged { user, online } => {
                reconciler.on_presence_changed(&user, online)
            }
            HubEvent::GroupCreated { conversation } => reconciler.on_group_created(conversation),
            HubEvent::MembershipChanged {
                conversation_id,
                added,
                removed,
            } => reconciler.on_membership_changed(&conversation_id, &added, &removed),
            HubEvent::ConnectionLost { reason } => reconciler.on_connection_lost(&reason),
            HubEvent::ConnectionRestored => reconciler.on_connection_restored(),
        }
        true
    }
}

impl Drop for SocketEventRouter {
    fn drop(&mut self) {
        self.stop();
    }
}
