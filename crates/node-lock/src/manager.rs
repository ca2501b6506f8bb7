use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::NodeId;
use document_store::{DocumentFolder, DocumentStoreVersion};

use crate::{LockConfig, Result};

/// What to do when the lock is held by another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait until the holder releases it.
    Wait,
    /// Give up immediately.
    NoWait,
}

/// Result of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LockOutcome {
    Locked,
    /// Held by another node (only returned for [`LockMode::NoWait`]).
    CannotLock,
}

enum Attempt {
    Acquired,
    HeldBy(String),
    /// Lost a race with another writer; re-read and try again.
    Contended,
}

/// Takes and releases named locks on behalf of one node.
///
/// Re-locking a lock whose document already names this node succeeds
/// immediately, so a restarted node with a stable [`NodeId`] gets back the
/// locks it held before crashing.
pub struct NodeLockManager {
    folder: DocumentFolder,
    node_id: NodeId,
    config: LockConfig,
    held: Mutex<BTreeSet<String>>,
}

impl NodeLockManager {
    pub fn new(folder: DocumentFolder, node_id: NodeId) -> Self {
        Self::with_config(folder, node_id, LockConfig::default())
    }

    pub fn with_config(folder: DocumentFolder, node_id: NodeId, config: LockConfig) -> Self {
        Self {
            folder,
            node_id,
            config,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks currently held through this manager.
    pub fn held_locks(&self) -> Vec<String> {
        self.held().iter().cloned().collect()
    }

    /// Acquires the lock `name`.
    ///
    /// With [`LockMode::Wait`] this suspends until the lock is free, woken
    /// by the lock document's change watch and re-checking at least every
    /// poll interval. Dropping the future abandons the wait.
    #[tracing::instrument(skip(self), fields(node = %self.node_id))]
    pub async fn lock(&self, name: &str, mode: LockMode) -> Result<LockOutcome> {
        // Subscribe before the first read so a release in between is not missed.
        let mut watch = match mode {
            LockMode::Wait => Some(self.folder.watch_changes(name)?),
            LockMode::NoWait => None,
        };

        loop {
            match self.try_acquire(name).await? {
                Attempt::Acquired => {
                    self.held().insert(name.to_string());
                    metrics::counter!("node_lock_acquired_total").increment(1);
                    tracing::debug!("lock acquired");
                    return Ok(LockOutcome::Locked);
                }
                Attempt::Contended => continue,
                Attempt::HeldBy(holder) => {
                    let Some(watch) = watch.as_mut() else {
                        tracing::debug!(%holder, "lock held elsewhere");
                        return Ok(LockOutcome::CannotLock);
                    };
                    tracing::debug!(%holder, "waiting for lock");
                    let _ = tokio::time::timeout(self.config.poll_interval, watch.changed()).await;
                }
            }
        }
    }

    async fn try_acquire(&self, name: &str) -> Result<Attempt> {
        let expected = match self.folder.get_document(name).await? {
            None => DocumentStoreVersion::New,
            Some(doc) if doc.content.is_empty() => DocumentStoreVersion::At(doc.version),
            Some(doc) if doc.content == self.node_id.as_str() => return Ok(Attempt::Acquired),
            Some(doc) => return Ok(Attempt::HeldBy(doc.content)),
        };

        match self
            .folder
            .save_document(name, self.node_id.as_str(), expected, &[])
            .await
        {
            Ok(_) => Ok(Attempt::Acquired),
            Err(e) if e.is_concurrency_conflict() => Ok(Attempt::Contended),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lock `name` by clearing its document.
    ///
    /// The write is unconditional: it does not check that this node is the
    /// current holder, so it also frees a lock that has since been taken
    /// over by another node.
    #[tracing::instrument(skip(self), fields(node = %self.node_id))]
    pub async fn unlock(&self, name: &str) -> Result<()> {
        self.folder
            .save_document(name, "", DocumentStoreVersion::Any, &[])
            .await?;
        self.held().remove(name);
        Ok(())
    }

    /// Releases every lock held through this manager. Failures are logged.
    pub async fn dispose(&self) {
        for name in self.held_locks() {
            if let Err(e) = self.unlock(&name).await {
                tracing::warn!(lock = %name, error = %e, "failed to release lock on dispose");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use document_store::InMemoryDocumentStore;

    use super::*;

    fn manager(folder: &DocumentFolder, node: &str) -> NodeLockManager {
        NodeLockManager::with_config(
            folder.clone(),
            NodeId::from_string(node),
            LockConfig {
                poll_interval: Duration::from_millis(50),
            },
        )
    }

    fn locks_folder() -> DocumentFolder {
        InMemoryDocumentStore::new()
            .folder()
            .sub_folder("locks")
            .unwrap()
    }

    #[tokio::test]
    async fn free_lock_is_acquired_and_recorded() {
        let folder = locks_folder();
        let a = manager(&folder, "node-a");

        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
        let doc = folder.get_document("X").await.unwrap().unwrap();
        assert_eq!(doc.content, "node-a");
        assert_eq!(a.held_locks(), vec!["X".to_string()]);

        // Re-entrant for the same node
        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
    }

    #[tokio::test]
    async fn other_node_cannot_lock_without_waiting() {
        let folder = locks_folder();
        let a = manager(&folder, "node-a");
        let b = manager(&folder, "node-b");

        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
        assert_eq!(b.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::CannotLock);
        assert!(b.held_locks().is_empty());
    }

    #[tokio::test]
    async fn waiter_acquires_after_unlock() {
        let folder = locks_folder();
        let a = manager(&folder, "node-a");
        let b = Arc::new(manager(&folder, "node-b"));

        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.lock("X", LockMode::Wait).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.unlock("X").await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, LockOutcome::Locked);
        assert_eq!(
            folder.get_document("X").await.unwrap().unwrap().content,
            "node-b"
        );
    }

    #[tokio::test]
    async fn concurrent_lockers_have_one_winner() {
        let folder = locks_folder();

        let mut handles = Vec::new();
        for i in 0..6 {
            let m = manager(&folder, &format!("node-{i}"));
            handles.push(tokio::spawn(async move { m.lock("X", LockMode::NoWait).await }));
        }

        let mut locked = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == LockOutcome::Locked {
                locked += 1;
            }
        }
        assert_eq!(locked, 1);
    }

    #[tokio::test]
    async fn restarted_node_reacquires_its_lock() {
        let folder = locks_folder();
        let before = manager(&folder, "node-a");
        assert_eq!(before.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
        drop(before);

        let after = manager(&folder, "node-a");
        assert_eq!(after.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
    }

    #[tokio::test]
    async fn unlock_does_not_check_ownership() {
        let folder = locks_folder();
        let a = manager(&folder, "node-a");
        let b = manager(&folder, "node-b");

        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
        b.unlock("X").await.unwrap();
        assert_eq!(folder.get_document("X").await.unwrap().unwrap().content, "");
    }

    #[tokio::test]
    async fn dispose_releases_held_locks() {
        let folder = locks_folder();
        let a = manager(&folder, "node-a");
        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);
        assert_eq!(a.lock("Y", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);

        a.dispose().await;
        assert!(a.held_locks().is_empty());
        for name in ["X", "Y"] {
            assert_eq!(folder.get_document(name).await.unwrap().unwrap().content, "");
        }
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_lock_untouched() {
        let folder = locks_folder();
        let a = manager(&folder, "node-a");
        let b = manager(&folder, "node-b");
        assert_eq!(a.lock("X", LockMode::NoWait).await.unwrap(), LockOutcome::Locked);

        let result =
            tokio::time::timeout(Duration::from_millis(120), b.lock("X", LockMode::Wait)).await;
        assert!(result.is_err());
        assert!(b.held_locks().is_empty());
        assert_eq!(
            folder.get_document("X").await.unwrap().unwrap().content,
            "node-a"
        );
    }
}
