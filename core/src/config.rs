/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TYPING_QUIET_MS: u64 = 3_000;
const DEFAULT_DEDUP_CAPACITY: usize = 2_048;
const DEFAULT_UPDATE_BUFFER: usize = 256;

/// How a confirmed message clears outstanding placeholders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Match placeholders by the echoed client correlation id
    #[default]
    Correlated,
    /// Discard every placeholder of the thread on the first confirmation
    Legacy,
}

impl std::str::FromStr for ReconcileMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "correlated" => Ok(Self::Correlated),
            "legacy" => Ok(Self::Legacy),
            other => Err(SyncError::Config(format!(
                "Unknown reconcile mode '{}' (expected 'correlated' or 'legacy')",
                other
            ))),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Quiet window after the last keystroke before "typing stopped" is emitted
    pub typing_quiet_window: Duration,

    /// How many recently applied message ids the delivery ledger remembers
    pub dedup_capacity: usize,

    /// Placeholder reconciliation strategy
    pub reconcile_mode: ReconcileMode,

    /// Capacity of the engine update broadcast channel
    pub update_buffer: usize,

    /// Where the session context (last active conversation, theme) is persisted
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            typing_quiet_window: Duration::from_millis(DEFAULT_TYPING_QUIET_MS),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            reconcile_mode: ReconcileMode::Correlated,
            update_buffer: DEFAULT_UPDATE_BUFFER,
            data_dir: None,
        }
    }
}

impl Config {
    /// Build config from command line flags (program name and positionals already stripped)
    pub fn from_flags(flags: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 0;
        while i < flags.len() {
            match flags[i].as_str() {
                "--typing-quiet-ms" => {
                    let v = flag_value(flags, i, "--typing-quiet-ms")?;
                    config.typing_quiet_window = Duration::from_millis(parse_number(v, "--typing-quiet-ms")?);
                    i += 2;
                }
                "--dedup-capacity" => {
                    let v = flag_value(flags, i, "--dedup-capacity")?;
                    config.dedup_capacity = parse_number(v, "--dedup-capacity")?;
                    i += 2;
                }
                "--update-buffer" => {
                    let v = flag_value(flags, i, "--update-buffer")?;
                    config.update_buffer = parse_number(v, "--update-buffer")?;
                    i += 2;
                }
                "--data-dir" => {
                    let v = flag_value(flags, i, "--data-dir")?;
                    config.data_dir = Some(PathBuf::from(v));
                    i += 2;
                }
                "--legacy-reconcile" => {
                    config.reconcile_mode = ReconcileMode::Legacy;
                    i += 1;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown flag: {}", other)));
                }
            }
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CHATSYNC_TYPING_QUIET_MS") {
            self.typing_quiet_window =
                Duration::from_millis(parse_number(&v, "CHATSYNC_TYPING_QUIET_MS")?);
        }
        if let Ok(v) = std::env::var("CHATSYNC_DEDUP_CAPACITY") {
            self.dedup_capacity = parse_number(&v, "CHATSYNC_DEDUP_CAPACITY")?;
        }
        if let Ok(v) = std::env::var("CHATSYNC_RECONCILE_MODE") {
            self.reconcile_mode = v.parse()?;
        }
        if let Ok(v) = std::env::var("CHATSYNC_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.typing_quiet_window.is_zero() {
            return Err(SyncError::Config(
                "Typing quiet window must be greater than zero".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(SyncError::Config("Dedup capacity must be at least 1".to_string()));
        }
        if self.update_buffer == 0 {
            return Err(SyncError::Config("Update buffer must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn flag_value<'a>(flags: &'a [String], i: usize, name: &str) -> Result<&'a str> {
    flags
        .get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", name)))
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid non-negative number", name)))
}
