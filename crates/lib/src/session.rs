//! Session persistence: snapshot of the conversation saved to a key/value store.
//!
//! Snapshots carry their own timestamp; expiry is enforced when loading, not by the storage.
//! Anything unreadable or expired is deleted and reported as "no session".

use crate::config::SessionConfig;
use crate::conversation::{ContextInfo, ConversationContext, Message};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Storage key under which the snapshot is kept.
pub const SESSION_KEY: &str = "wakechat_session";

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Persisted form of a conversation (seed greeting excluded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context_info: ContextInfo,
}

impl SessionSnapshot {
    pub fn capture(conversation: &ConversationContext) -> Self {
        Self::capture_at(conversation, Utc::now())
    }

    pub fn capture_at(conversation: &ConversationContext, timestamp: DateTime<Utc>) -> Self {
        Self {
            messages: conversation.conversation().cloned().collect(),
            timestamp,
            context_info: conversation.context_info(),
        }
    }

    /// Hours elapsed between the snapshot and `now`.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_milliseconds() as f64 / MS_PER_HOUR
    }
}

pub struct SessionStore {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    expiry_hours: f64,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, config: &SessionConfig) -> Self {
        Self {
            storage,
            key: SESSION_KEY.to_string(),
            expiry_hours: config.expiry_hours,
        }
    }

    pub fn save(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.storage.set(&self.key, &json)?;
        log::debug!(
            "session: saved {} messages",
            snapshot.messages.len()
        );
        Ok(())
    }

    pub fn load(&self) -> Option<SessionSnapshot> {
        self.load_at(Utc::now())
    }

    /// Load the snapshot as of `now`. Expired, unreadable or unparsable snapshots are deleted.
    pub fn load_at(&self, now: DateTime<Utc>) -> Option<SessionSnapshot> {
        let raw = match self.storage.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("session: read failed, starting fresh: {:#}", e);
                self.clear();
                return None;
            }
        };
        let snapshot: SessionSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("session: stored snapshot is invalid, discarding: {}", e);
                self.clear();
                return None;
            }
        };
        let age = snapshot.age_hours(now);
        if age > self.expiry_hours {
            log::info!("session: expired ({:.2}h old), discarding", age);
            self.clear();
            return None;
        }
        log::debug!("session: restored {} messages", snapshot.messages.len());
        Some(snapshot)
    }

    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(&self.key) {
            log::warn!("session: failed to clear stored snapshot: {:#}", e);
        }
    }
}

/// A cancellable delayed task. Arming replaces (and aborts) any pending one.
pub struct DebouncedSave {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedSave {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Run `task` after the debounce delay unless re-armed or disarmed first.
    pub fn arm<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = pending.replace(handle) {
            old.abort();
        }
    }

    pub fn disarm(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = pending.take() {
            old.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for DebouncedSave {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::conversation::{MessageStatus, Sender};
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> (Arc<MemoryStorage>, SessionStore) {
        let storage = Arc::new(MemoryStorage::new());
        let sessions = SessionStore::new(storage.clone(), &SessionConfig::default());
        (storage, sessions)
    }

    fn conversation() -> ConversationContext {
        let mut c = ConversationContext::new("hi", &ContextConfig::default());
        c.push(Sender::User, "question", MessageStatus::Delivered, false, None);
        c.push(Sender::Bot, "answer", MessageStatus::Delivered, false, None);
        c.window_for_send();
        c
    }

    #[test]
    fn save_then_load_excludes_seed_and_keeps_timestamps() {
        let (_, sessions) = store();
        let c = conversation();
        let snapshot = SessionSnapshot::capture(&c);
        sessions.save(&snapshot).unwrap();
        let loaded = sessions.load().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert!(loaded.messages.iter().all(|m| !m.is_seed()));
        assert_eq!(loaded.messages, snapshot.messages);
        assert_eq!(loaded.context_info.messages_in_context, 2);
    }

    #[test]
    fn expired_snapshot_is_deleted() {
        let (storage, sessions) = store();
        let t = Utc::now();
        sessions
            .save(&SessionSnapshot::capture_at(&conversation(), t))
            .unwrap();
        let just_expired = t + chrono::Duration::hours(1) + chrono::Duration::milliseconds(1);
        assert!(sessions.load_at(just_expired).is_none());
        assert_eq!(storage.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn snapshot_at_the_expiry_boundary_is_kept() {
        let (_, sessions) = store();
        let t = Utc::now();
        sessions
            .save(&SessionSnapshot::capture_at(&conversation(), t))
            .unwrap();
        assert!(sessions.load_at(t + chrono::Duration::hours(1)).is_some());
    }

    #[test]
    fn garbage_is_treated_as_no_session() {
        let (storage, sessions) = store();
        storage.set(SESSION_KEY, "{not json").unwrap();
        assert!(sessions.load().is_none());
        assert_eq!(storage.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn clear_removes_snapshot() {
        let (_, sessions) = store();
        sessions.save(&SessionSnapshot::capture(&conversation())).unwrap();
        sessions.clear();
        assert!(sessions.load().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_the_pending_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let debounce = DebouncedSave::new(Duration::from_secs(2));
        for _ in 0..3 {
            let fired = fired.clone();
            debounce.arm(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(debounce.is_armed());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debounce.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_the_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let debounce = DebouncedSave::new(Duration::from_secs(2));
        let f = fired.clone();
        debounce.arm(async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        debounce.disarm();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
