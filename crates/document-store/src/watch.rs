//! Per-document change subscriptions.
//!
//! Notifications are best-effort and may be redundant: a watcher woken by
//! [`DocumentWatch::changed`] re-reads the document and decides for itself
//! whether anything it cares about changed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

struct Watched {
    sender: Arc<watch::Sender<u64>>,
    subscribers: usize,
    /// Last version seen by the poller, `None` until the first poll. A change
    /// between subscribing and the first poll has no baseline to compare
    /// against, so the first poll always wakes watchers.
    known_version: Option<i64>,
}

/// Registry of watched document keys, shared by a backend and its watches.
#[derive(Clone, Default)]
pub struct WatchHub {
    keys: Arc<Mutex<HashMap<String, Watched>>>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Watched>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to changes of `key`. Dropping the watch unsubscribes.
    pub fn subscribe(&self, key: &str) -> DocumentWatch {
        let mut keys = self.lock();
        let watched = keys.entry(key.to_string()).or_insert_with(|| Watched {
            sender: Arc::new(watch::channel(0).0),
            subscribers: 0,
            known_version: None,
        });
        watched.subscribers += 1;
        let sender = watched.sender.clone();
        let receiver = sender.subscribe();

        DocumentWatch {
            key: key.to_string(),
            receiver,
            _sender: sender,
            hub: self.clone(),
        }
    }

    /// Wakes every watcher of `key`.
    pub fn notify(&self, key: &str) {
        if let Some(watched) = self.lock().get(key) {
            watched.sender.send_modify(|n| *n = n.wrapping_add(1));
        }
    }

    /// Wakes every watcher; used after notifications may have been lost.
    pub fn notify_all(&self) {
        for watched in self.lock().values() {
            watched.sender.send_modify(|n| *n = n.wrapping_add(1));
        }
    }

    /// Returns the currently watched keys.
    pub fn watched_keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Records the version of a watched key seen by a poll, waking its
    /// watchers if it differs from the previous poll or is the first one.
    pub fn observe_version(&self, key: &str, version: i64) {
        let mut keys = self.lock();
        let Some(watched) = keys.get_mut(key) else {
            return;
        };
        let changed = watched.known_version != Some(version);
        watched.known_version = Some(version);
        if changed {
            tracing::debug!(key, version, "poll detected document change");
            watched.sender.send_modify(|n| *n = n.wrapping_add(1));
        }
    }

    /// Number of distinct watched keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn unsubscribe(&self, key: &str) {
        let mut keys = self.lock();
        if let Some(watched) = keys.get_mut(key) {
            watched.subscribers = watched.subscribers.saturating_sub(1);
            if watched.subscribers == 0 {
                keys.remove(key);
            }
        }
    }
}

/// Subscription to one document's changes.
pub struct DocumentWatch {
    key: String,
    receiver: watch::Receiver<u64>,
    // Keeps the channel open for as long as the watch lives.
    _sender: Arc<watch::Sender<u64>>,
    hub: WatchHub,
}

impl DocumentWatch {
    /// The watched document key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Completes on the next change notification after the previous call
    /// (or after subscribing). Cancel-safe.
    pub async fn changed(&mut self) {
        // The sender is owned by this watch, so the channel cannot close.
        let _ = self.receiver.changed().await;
    }
}

impl Drop for DocumentWatch {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.key);
    }
}

impl std::fmt::Debug for DocumentWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentWatch").field("key", &self.key).finish()
    }
}
