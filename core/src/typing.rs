/// Outbound typing-signal debounce
///
/// One registry entry per conversation being composed in. A keystroke either
/// opens a burst (caller emits "typing started") or extends it; extending
/// cancels the pending quiet timer and arms a new one. When a timer fires it
/// posts `Completion::TypingQuiet` back to the event loop, which then emits
/// "typing stopped" exactly once for that burst.
use crate::messenger_types::ConversationKey;
use crate::reconciler::Completion;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

struct Burst {
    id: u64,
    timer: JoinHandle<()>,
}

pub struct TypingDebouncer {
    quiet: Duration,
    bursts: HashMap<ConversationKey, Burst>,
    next_burst: u64,
    notify: mpsc::UnboundedSender<Completion>,
}

impl TypingDebouncer {
    pub fn new(quiet: Duration, notify: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            quiet,
            bursts: HashMap::new(),
            next_burst: 1,
            notify,
        }
    }

    /// Returns true when this keystroke opens a new burst
    pub fn keystroke(&mut self, key: &ConversationKey) -> bool {
        if let Some(burst) = self.bursts.get_mut(key) {
            // Every re-arm gets its own id so a timer that fired before abort() cannot end the burst
            burst.timer.abort();
            burst.id = self.next_burst;
            self.next_burst += 1;
            burst.timer = arm(self.quiet, self.notify.clone(), key.clone(), burst.id);
            return false;
        }

        let id = self.next_burst;
        self.next_burst += 1;
        let timer = arm(self.quiet, self.notify.clone(), key.clone(), id);
        self.bursts.insert(key.clone(), Burst { id, timer });
        debug!(%key, burst = id, "typing burst started");
        true
    }

    /// Timer fired. True if `burst` is still the live one and must be stopped now.
    pub fn quiet_elapsed(&mut self, key: &ConversationKey, burst: u64) -> bool {
        match self.bursts.get(key) {
            Some(current) if current.id == burst => {
                self.bursts.remove(key);
                true
            }
            _ => false,
        }
    }

    /// End a burst early (message sent, conversation switched). True if one was live.
    pub fn finish(&mut self, key: &ConversationKey) -> bool {
        match self.bursts.remove(key) {
            Some(burst) => {
                burst.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_composing(&self, key: &ConversationKey) -> bool {
        self.bursts.contains_key(key)
    }

    pub fn cancel_all(&mut self) {
        for (_, burst) in self.bursts.drain() {
            burst.timer.abort();
        }
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn arm(
    quiet: Duration,
    notify: mpsc::UnboundedSender<Completion>,
    key: ConversationKey,
    burst: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(quiet).await;
        let _ = notify.send(Completion::TypingQuiet { key, burst });
    })
}
