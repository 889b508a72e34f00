/// Error types for the conversation sync engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Push connection lost or the hub refused an outbound command
    #[error("Transport error: {0}")]
    Transport(String),

    /// A Chat API call failed; the stores are left untouched
    #[error("Request error: {0}")]
    Request(String),

    /// An event referenced local state we do not have
    #[error("Data integrity anomaly: {0}")]
    Integrity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No conversation is open")]
    NoActiveConversation,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
