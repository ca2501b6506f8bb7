//! Instance metadata and cursor tokens of one logical projection.
//!
//! Every instance of a projection is listed in a single `metadata` document
//! under `<root>/<projection>`, so multi-instance transitions such as a
//! cutover are one conditional write. Each instance's cursor lives in its
//! own document under `<root>/<projection>/tokens`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{AbortOnDrop, NodeId};
use document_store::{DocumentFolder, DocumentStoreVersion, DocumentWatch, NewerDocument};
use event_store::EventStoreToken;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ProjectionError, Result};

const METADATA_DOCUMENT: &str = "metadata";
const TOKENS_FOLDER: &str = "tokens";
const MAX_WRITE_ATTEMPTS: usize = 10;
const CHANGE_CAPACITY: usize = 64;
const RELOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle state of a projection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionStatus {
    /// Being built; not yet complete.
    NewBuild,
    /// A build that was abandoned before completing.
    CancelledBuild,
    /// The instance serving traffic.
    Running,
    /// The previous running instance, kept for readers still bound to it.
    Legacy,
    Discontinued,
    Inactive,
}

impl ProjectionStatus {
    /// Whether the instance holds complete data (`Running` or `Legacy`).
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Legacy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewBuild => "NewBuild",
            Self::CancelledBuild => "CancelledBuild",
            Self::Running => "Running",
            Self::Legacy => "Legacy",
            Self::Discontinued => "Discontinued",
            Self::Inactive => "Inactive",
        }
    }
}

impl std::fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical instance of a logical projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionInstanceMetadata {
    /// Unique instance name, also the name of its storage folder.
    pub name: String,

    /// Logical projection name.
    pub projection: String,

    /// Code version that built the instance.
    pub version: String,

    /// Oldest reader version that can use the instance's data.
    pub minimal_reader_version: String,

    /// Node that created the instance.
    pub current_node: NodeId,

    pub status: ProjectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct MetadataDocument {
    #[serde(default)]
    instances: Vec<ProjectionInstanceMetadata>,
}

#[derive(Serialize)]
struct MetadataDocumentRef<'a> {
    instances: &'a [ProjectionInstanceMetadata],
}

/// A change to a projection's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataChange {
    /// An instance was created, or its status or version changed.
    Instance {
        instance: String,
        status: ProjectionStatus,
        version: String,
    },
    /// Changes were missed; re-read the full instance list.
    Resync,
}

impl MetadataChange {
    fn concerns(&self, name: &str) -> bool {
        match self {
            Self::Instance { instance, .. } => instance == name,
            Self::Resync => true,
        }
    }
}

/// Subscription returned by [`ProjectionMetadataManager::register_for_changes`].
pub struct MetadataChanges {
    receiver: broadcast::Receiver<MetadataChange>,
    instance: Option<String>,
}

impl MetadataChanges {
    /// Waits for the next change relevant to this subscription.
    ///
    /// Returns `None` once the manager is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<MetadataChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => {
                    if self
                        .instance
                        .as_deref()
                        .is_none_or(|name| change.concerns(name))
                    {
                        return Some(change);
                    }
                }
                Err(RecvError::Lagged(_)) => return Some(MetadataChange::Resync),
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Default)]
struct Cached {
    version: i64,
    instances: Vec<ProjectionInstanceMetadata>,
}

struct Inner {
    projection: String,
    folder: DocumentFolder,
    tokens: DocumentFolder,
    state: Mutex<Cached>,
    changes: broadcast::Sender<MetadataChange>,
}

impl Inner {
    /// Re-reads the metadata document. The state lock is not held while
    /// storage is queried.
    async fn reload(&self) -> Result<()> {
        let known = self.state.lock().await.version;
        let doc = match self.folder.get_newer_document(METADATA_DOCUMENT, known).await? {
            NewerDocument::Found(doc) => doc,
            NewerDocument::Unchanged | NewerDocument::Missing => return Ok(()),
        };
        let parsed: MetadataDocument = serde_json::from_str(&doc.content)?;

        let mut state = self.state.lock().await;
        self.install(&mut state, doc.version, parsed.instances);
        Ok(())
    }

    /// Replaces the cached list unless it already holds `version` or newer,
    /// broadcasting every instance whose status or version changed.
    fn install(&self, state: &mut Cached, version: i64, instances: Vec<ProjectionInstanceMetadata>) {
        if version <= state.version {
            return;
        }
        for instance in &instances {
            let changed = state
                .instances
                .iter()
                .find(|old| old.name == instance.name)
                .is_none_or(|old| old.status != instance.status || old.version != instance.version);
            if changed {
                tracing::debug!(
                    projection = %self.projection,
                    instance = %instance.name,
                    status = %instance.status,
                    "projection metadata changed"
                );
                let _ = self.changes.send(MetadataChange::Instance {
                    instance: instance.name.clone(),
                    status: instance.status,
                    version: instance.version.clone(),
                });
            }
        }
        state.version = version;
        state.instances = instances;
    }
}

/// Keeps the cached instance list in step with writes made by other nodes.
async fn watch_metadata(inner: Weak<Inner>, mut watch: DocumentWatch) {
    loop {
        watch.changed().await;
        loop {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match inner.reload().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(projection = %inner.projection, error = %e, "failed to reload projection metadata");
                }
            }
            drop(inner);
            tokio::time::sleep(RELOAD_RETRY_DELAY).await;
        }
    }
}

/// Reads and changes the instances of one logical projection.
///
/// Cloning is cheap; clones share the cached instance list and the change
/// broadcast. The background watch stops when the last clone is dropped.
#[derive(Clone)]
pub struct ProjectionMetadataManager {
    inner: Arc<Inner>,
    _watch: Arc<AbortOnDrop>,
}

impl ProjectionMetadataManager {
    /// Opens the metadata of `projection` stored under `root`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(root: &DocumentFolder, projection: &str) -> Result<Self> {
        let folder = root.sub_folder(projection)?;
        let tokens = folder.sub_folder(TOKENS_FOLDER)?;
        // Subscribe before the first load so no remote write is missed.
        let watch = folder.watch_changes(METADATA_DOCUMENT)?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        let inner = Arc::new(Inner {
            projection: projection.to_string(),
            folder,
            tokens,
            state: Mutex::new(Cached::default()),
            changes,
        });
        inner.reload().await?;

        let task = tokio::spawn(watch_metadata(Arc::downgrade(&inner), watch));
        Ok(Self {
            inner,
            _watch: Arc::new(AbortOnDrop::new(task)),
        })
    }

    /// Logical projection name.
    pub fn projection(&self) -> &str {
        &self.inner.projection
    }

    /// Subscribes to metadata changes, optionally only those of one instance.
    pub fn register_for_changes(&self, instance: Option<&str>) -> MetadataChanges {
        MetadataChanges {
            receiver: self.inner.changes.subscribe(),
            instance: instance.map(str::to_string),
        }
    }

    pub async fn get_all_metadata(&self) -> Vec<ProjectionInstanceMetadata> {
        self.inner.state.lock().await.instances.clone()
    }

    pub async fn get_instance(&self, instance: &str) -> Option<ProjectionInstanceMetadata> {
        self.inner
            .state
            .lock()
            .await
            .instances
            .iter()
            .find(|i| i.name == instance)
            .cloned()
    }

    /// Re-reads the metadata document.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.reload().await
    }

    /// Creates a `NewBuild` instance and cancels every other build in progress.
    #[tracing::instrument(skip(self), fields(projection = %self.inner.projection))]
    pub async fn build_new_instance(
        &self,
        node: &NodeId,
        version: &str,
        minimal_reader_version: &str,
    ) -> Result<ProjectionInstanceMetadata> {
        let name = format!("{}_{}", self.inner.projection, Uuid::new_v4().simple());
        let instance = self
            .modify(|instances| {
                let now = Utc::now();
                for other in instances
                    .iter_mut()
                    .filter(|i| i.status == ProjectionStatus::NewBuild)
                {
                    other.status = ProjectionStatus::CancelledBuild;
                    other.updated_at = now;
                }

                let instance = ProjectionInstanceMetadata {
                    name: name.clone(),
                    projection: self.inner.projection.clone(),
                    version: version.to_string(),
                    minimal_reader_version: minimal_reader_version.to_string(),
                    current_node: node.clone(),
                    status: ProjectionStatus::NewBuild,
                    created_at: now,
                    updated_at: now,
                };
                instances.push(instance.clone());
                Ok(instance)
            })
            .await?;

        tracing::info!(instance = %instance.name, "started new projection build");
        Ok(instance)
    }

    #[tracing::instrument(skip(self), fields(projection = %self.inner.projection))]
    pub async fn update_status(&self, instance: &str, status: ProjectionStatus) -> Result<()> {
        self.modify(|instances| {
            let target = find_mut(instances, instance)?;
            if target.status != status {
                target.status = status;
                target.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    /// Cuts over to `instance`: it becomes `Running`, the previous running
    /// instance becomes `Legacy` and any older legacy instance is
    /// discontinued.
    ///
    /// Only a `NewBuild` instance can be upgraded; upgrading the running
    /// instance is a no-op.
    #[tracing::instrument(skip(self), fields(projection = %self.inner.projection))]
    pub async fn upgrade(&self, instance: &str) -> Result<()> {
        self.modify(|instances| {
            match find_mut(instances, instance)?.status {
                ProjectionStatus::NewBuild => {}
                ProjectionStatus::Running => return Ok(()),
                status => {
                    return Err(ProjectionError::InvalidTransition {
                        instance: instance.to_string(),
                        status,
                    });
                }
            }

            let now = Utc::now();
            for i in instances.iter_mut() {
                let next = if i.name == instance {
                    ProjectionStatus::Running
                } else {
                    match i.status {
                        ProjectionStatus::Running => ProjectionStatus::Legacy,
                        ProjectionStatus::Legacy => ProjectionStatus::Discontinued,
                        other => other,
                    }
                };
                if next != i.status {
                    i.status = next;
                    i.updated_at = now;
                }
            }
            Ok(())
        })
        .await?;

        tracing::info!(%instance, "projection instance is now running");
        Ok(())
    }

    /// The instance's persisted cursor, initial if it never checkpointed.
    pub async fn get_token(&self, instance: &str) -> Result<EventStoreToken> {
        match self.inner.tokens.get_document(instance).await? {
            Some(doc) => Ok(doc.content.parse()?),
            None => Ok(EventStoreToken::initial()),
        }
    }

    pub async fn set_token(&self, instance: &str, token: EventStoreToken) -> Result<()> {
        self.inner
            .tokens
            .save_document(instance, &token.to_string(), DocumentStoreVersion::Any, &[])
            .await?;
        Ok(())
    }

    /// Applies `change` to a snapshot of the instance list and writes it back
    /// conditionally, re-loading and re-applying on conflict.
    ///
    /// The state lock is only held to take the snapshot and to install the
    /// result, so readers never wait on storage.
    async fn modify<T, F>(&self, mut change: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut Vec<ProjectionInstanceMetadata>) -> Result<T> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (known, current) = {
                let state = self.inner.state.lock().await;
                (state.version, state.instances.clone())
            };
            let mut instances = current.clone();
            let result = change(&mut instances)?;
            if instances == current {
                return Ok(result);
            }

            let content = serde_json::to_string(&MetadataDocumentRef {
                instances: &instances,
            })?;
            let expected = match known {
                0 => DocumentStoreVersion::New,
                version => DocumentStoreVersion::At(version),
            };

            match self
                .inner
                .folder
                .save_document(METADATA_DOCUMENT, &content, expected, &[])
                .await
            {
                Ok(version) => {
                    // The watch task may have installed this version already.
                    let mut state = self.inner.state.lock().await;
                    self.inner.install(&mut state, version, instances);
                    return Ok(result);
                }
                Err(e) if e.is_concurrency_conflict() => {
                    tracing::debug!(attempt, "metadata write conflicted, reloading");
                    self.inner.reload().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProjectionError::MetadataContention {
            projection: self.inner.projection.clone(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }
}

fn find_mut<'a>(
    instances: &'a mut [ProjectionInstanceMetadata],
    name: &str,
) -> Result<&'a mut ProjectionInstanceMetadata> {
    instances
        .iter_mut()
        .find(|i| i.name == name)
        .ok_or_else(|| ProjectionError::InstanceNotFound(name.to_string()))
}
