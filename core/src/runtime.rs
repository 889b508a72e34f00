/// Chat session runtime: the single event loop that owns the reconciler
///
/// Hub events, spawned-call completions and UI commands all funnel into one
/// task and are applied one at a time, so the stores need no locks.
use crate::chat_api::ChatApi;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::hub::{HubEvent, RealtimeHub};
use crate::messenger_types::{Attachment, ConversationId, ConversationKey, EngineUpdate, MessageId, UserId};
use crate::reconciler::{Completion, EngineSnapshot, SyncReconciler};
use crate::router::SocketEventRouter;
use crate::session::SessionContext;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests from the UI side into a running session
#[derive(Debug)]
pub enum Command {
    Open { id: ConversationId, reply: Reply<()> },
    OpenWithPeer { peer: UserId, reply: Reply<ConversationKey> },
    Close { reply: Reply<()> },
    Send {
        content: Option<String>,
        attachment: Option<Attachment>,
        reply: Reply<MessageId>,
    },
    Keystroke { reply: Reply<()> },
    Edit {
        message_id: String,
        content: String,
        reply: Reply<()>,
    },
    Delete { message_id: String, reply: Reply<()> },
    ClearHistory { conversation_id: ConversationId, reply: Reply<()> },
    LeaveGroup { conversation_id: ConversationId, reply: Reply<()> },
    Block { user: UserId, reply: Reply<()> },
    Refresh { reply: Reply<()> },
    /// Wait until every spawned call has reported back
    Settle { reply: Reply<()> },
    Snapshot { reply: Reply<EngineSnapshot> },
    Logout { reply: Reply<SessionContext> },
}

pub struct ChatSession {
    reconciler: SyncReconciler,
    router: SocketEventRouter,
    events: mpsc::UnboundedReceiver<HubEvent>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl ChatSession {
    /// Wire the engine to its collaborators, subscribe to the hub and start the initial load
    pub fn begin(
        config: Config,
        session: SessionContext,
        api: Arc<dyn ChatApi>,
        hub: Arc<dyn RealtimeHub>,
    ) -> Result<Self> {
        let (mut reconciler, completions) = SyncReconciler::new(config, session, api, hub.clone());
        let (event_tx, events) = mpsc::unbounded_channel();
        let mut router = SocketEventRouter::new(hub);
        router.start(event_tx)?;
        reconciler.start();

        Ok(Self {
            reconciler,
            router,
            events,
            completions,
        })
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut SyncReconciler {
        &mut self.reconciler
    }

    pub fn router(&self) -> &SocketEventRouter {
        &self.router
    }

    /// Apply everything that is already waiting, without blocking.
    /// Returns how many items were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let mut progressed = false;
            while let Ok(event) = self.events.try_recv() {
                self.router.dispatch(&mut self.reconciler, event);
                applied += 1;
                progressed = true;
            }
            while let Ok(done) = self.completions.try_recv() {
                self.reconciler.apply_completion(done);
                applied += 1;
                progressed = true;
            }
            if !progressed {
                return applied;
            }
        }
    }

    /// Wait for spawned calls until at most `remaining` are still outstanding
    pub async fn settle_until(&mut self, remaining: usize) {
        self.pump();
        while self.reconciler.pending_calls() > remaining {
            match self.completions.recv().await {
                Some(done) => self.reconciler.apply_completion(done),
                None => break,
            }
            self.pump();
        }
    }

    pub async fn settle(&mut self) {
        self.settle_until(0).await;
    }

    /// Unsubscribe from the hub and tear the engine down
    pub fn end(self) -> SessionContext {
        let ChatSession {
            reconciler,
            mut router,
            ..
        } = self;
        router.stop();
        reconciler.teardown()
    }

    /// Move the session onto its own task
    pub fn spawn(self) -> SessionHandle {
        let updates = self.reconciler.update_sender();
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(command_rx));
        SessionHandle {
            commands,
            updates,
            task: Arc::new(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Chat session running for {}", self.reconciler.user_id());
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    self.router.dispatch(&mut self.reconciler, event);
                }
                Some(done) = self.completions.recv() => {
                    self.reconciler.apply_completion(done);
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Logout { reply }) => {
                        let _ = reply.send(Ok(self.end()));
                        return;
                    }
                    Some(Command::Settle { reply }) => {
                        self.settle().await;
                        let _ = reply.send(Ok(()));
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        debug!("All session handles dropped");
                        self.end();
                        return;
                    }
                },
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        let rec = &mut self.reconciler;
        match cmd {
            Command::Open { id, reply } => {
                let _ = reply.send(rec.open_conversation(&id));
            }
            Command::OpenWithPeer { peer, reply } => {
                let _ = reply.send(rec.open_with_peer(&peer));
            }
            Command::Close { reply } => {
                rec.close_conversation();
                let _ = reply.send(Ok(()));
            }
            Command::Send {
                content,
                attachment,
                reply,
            } => {
                let _ = reply.send(rec.send_message(content, attachment));
            }
            Command::Keystroke { reply } => {
                let _ = reply.send(rec.note_keystroke());
            }
            Command::Edit {
                message_id,
                content,
                reply,
            } => {
                let _ = reply.send(rec.edit_message(&message_id, &content));
            }
            Command::Delete { message_id, reply } => {
                let _ = reply.send(rec.delete_message(&message_id));
            }
            Command::ClearHistory {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(rec.clear_history(&conversation_id));
            }
            Command::LeaveGroup {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(rec.leave_group(&conversation_id));
            }
            Command::Block { user, reply } => {
                let _ = reply.send(rec.block_contact(&user));
            }
            Command::Refresh { reply } => {
                rec.refresh_conversations();
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(rec.snapshot()));
            }
            // Handled by the loop itself
            Command::Settle { reply } => {
                let _ = reply.send(Ok(()));
            }
            Command::Logout { reply } => {
                let _ = reply.send(Err(SyncError::SessionClosed));
            }
        }
    }
}

/// Cloneable front door to a spawned session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<EngineUpdate>,
    task: Arc<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn open(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Open { id, reply }).await
    }

    pub async fn open_with_peer(&self, peer: &str) -> Result<ConversationKey> {
        let peer = peer.to_string();
        self.request(|reply| Command::OpenWithPeer { peer, reply }).await
    }

    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub async fn send(&self, content: Option<String>, attachment: Option<Attachment>) -> Result<MessageId> {
        self.request(|reply| Command::Send {
            content,
            attachment,
            reply,
        })
        .await
    }

    pub async fn keystroke(&self) -> Result<()> {
        self.request(|reply| Command::Keystroke { reply }).await
    }

    pub async fn edit(&self, message_id: &str, content: &str) -> Result<()> {
        let (message_id, content) = (message_id.to_string(), content.to_string());
        self.request(|reply| Command::Edit {
            message_id,
            content,
            reply,
        })
        .await
    }

    pub async fn delete(&self, message_id: &str) -> Result<()> {
        let message_id = message_id.to_string();
        self.request(|reply| Command::Delete { message_id, reply }).await
    }

    pub async fn clear_history(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| Command::ClearHistory {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn leave_group(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| Command::LeaveGroup {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn block(&self, user: &str) -> Result<()> {
        let user = user.to_string();
        self.request(|reply| Command::Block { user, reply }).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    pub async fn settle(&self) -> Result<()> {
        self.request(|reply| Command::Settle { reply }).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// End the session; returns the context with its token dropped
    pub async fn logout(self) -> Result<SessionContext> {
        let session = self.request(|reply| Command::Logout { reply }).await?;
        Ok(session)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
