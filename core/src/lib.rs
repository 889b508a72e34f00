/// chatsync - real-time conversation synchronization engine
///
/// Keeps a user's conversation list and message threads consistent while
/// local optimistic actions apply immediately and a push-event stream delivers
/// authoritative updates out of order and at least once.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod chat_api;
pub mod hub;
pub mod conversation_store;
pub mod message_store;
pub mod presence;
pub mod unread;
pub mod typing;
pub mod session;
pub mod reconciler;
pub mod router;
pub mod runtime;
pub mod memory;
pub mod replay;

pub use error::{Result, SyncError};
pub use config::{Config, ReconcileMode};
pub use messenger_types::{
    Attachment, Conversation, ConversationKey, EngineUpdate, Message, MessageId, MessageKind,
    ReadState,
};
pub use reconciler::{Completion, EngineSnapshot, SyncReconciler};
pub use router::SocketEventRouter;
pub use runtime::{ChatSession, SessionHandle};
pub use session::SessionContext;
