/// Session context: who is logged in and what survives between sessions
///
/// Created at login (`begin`) and ended at logout (`end`). The last active
/// conversation and theme persist to `session.json` in the data directory;
/// the auth token never touches disk.
use crate::error::{Result, SyncError};
use crate::messenger_types::{ConversationId, UserId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFileV1 {
    version: u8,
    user_id: UserId,
    last_active: Option<ConversationId>,
    theme: Theme,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: UserId,
    pub auth_token: Option<String>,
    pub last_active: Option<ConversationId>,
    pub theme: Theme,
}

fn session_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SESSION_FILE)
}

impl SessionContext {
    /// Login
    pub fn begin(user_id: impl Into<UserId>, auth_token: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_token,
            last_active: None,
            theme: Theme::default(),
        }
    }

    /// Pick up persisted preferences. A missing file, or one written for a
    /// different user, leaves the context as it is.
    pub fn restore(mut self, data_dir: &Path) -> Result<Self> {
        let path = session_path(data_dir);
        if !path.exists() {
            return Ok(self);
        }
        let raw = fs::read_to_string(&path)?;
        let parsed: SessionFileV1 = serde_json::from_str(&raw)?;
        if parsed.version != 1 {
            return Err(SyncError::Config(format!(
                "Unsupported session file version: {}",
                parsed.version
            )));
        }
        if parsed.user_id != self.user_id {
            debug!("Session file belongs to another user, ignoring");
            return Ok(self);
        }
        self.last_active = parsed.last_active;
        self.theme = parsed.theme;
        Ok(self)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let file = SessionFileV1 {
            version: 1,
            user_id: self.user_id.clone(),
            last_active: self.last_active.clone(),
            theme: self.theme,
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(session_path(data_dir), json)?;
        Ok(())
    }

    /// Logout
    pub fn end(&mut self) {
        self.auth_token = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_token.is_some()
    }
}
