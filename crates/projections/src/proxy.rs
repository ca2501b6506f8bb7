//! Routes reads to the best available projection instance.
//!
//! A [`ProjectionProxy`] owns several reader implementations, typically one
//! per supported storage layout, and keeps exactly one of them attached to
//! one instance. When the metadata changes (a rebuild completes, an instance
//! is retired) it re-picks the reader/instance pair and switches under a
//! write lock, so readers never see two attached readers or none during a
//! cutover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use common::AbortOnDrop;
use document_store::DocumentFolder;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

use crate::{
    MetadataChanges, ProjectionError, ProjectionInstanceMetadata, ProjectionMetadataManager,
    ProjectionStatus, Result,
};

/// A reader able to serve queries from some range of stored versions.
pub trait ProjectionReader: Send + Sync {
    /// Version of this reader, compared against an instance's
    /// `minimal_reader_version`.
    fn reader_version(&self) -> &str;

    /// Oldest instance version this reader can read.
    fn minimal_stored_version(&self) -> &str;

    /// Binds the reader to `instance`, whose data lives in `storage`.
    fn attach(&mut self, instance: &ProjectionInstanceMetadata, storage: DocumentFolder);

    /// Detaches the reader from its instance.
    fn reset(&mut self);
}

/// A chosen reader/instance pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Index into the proxy's readers.
    pub reader: usize,
    /// Instance name.
    pub instance: String,
}

fn is_candidate(instance: &ProjectionInstanceMetadata) -> bool {
    instance.status.is_alive() || instance.status == ProjectionStatus::NewBuild
}

/// Instances with complete data first, then newer versions.
fn instance_rank(instance: &ProjectionInstanceMetadata) -> (bool, &str, bool, &str) {
    (
        instance.status.is_alive(),
        instance.version.as_str(),
        instance.status == ProjectionStatus::Running,
        instance.name.as_str(),
    )
}

fn can_read<R: ProjectionReader>(reader: &R, instance: &ProjectionInstanceMetadata) -> bool {
    instance.version.as_str() >= reader.minimal_stored_version()
}

fn is_functional<R: ProjectionReader>(reader: &R, instance: &ProjectionInstanceMetadata) -> bool {
    reader.reader_version() >= instance.minimal_reader_version.as_str()
}

fn readable<'a, R: ProjectionReader>(
    reader: &'a R,
    instances: &'a [ProjectionInstanceMetadata],
) -> impl Iterator<Item = &'a ProjectionInstanceMetadata> + 'a {
    instances
        .iter()
        .filter(move |i| is_candidate(i) && can_read(reader, i))
}

fn best_instance<'a>(
    candidates: impl Iterator<Item = &'a ProjectionInstanceMetadata>,
) -> Option<&'a ProjectionInstanceMetadata> {
    candidates.max_by(|a, b| instance_rank(a).cmp(&instance_rank(b)))
}

/// Picks the reader/instance pair the proxy should serve from.
///
/// Each reader takes the best instance it reads functionally, falling back
/// to the best one it can read at all. The pairs are then ranked by
/// instance (alive before `NewBuild`, then version, then `Running` before
/// `Legacy`, then name), then by whether the read is functional, then by
/// reader version.
pub fn select_reader<R: ProjectionReader>(
    readers: &[R],
    instances: &[ProjectionInstanceMetadata],
) -> Option<Selection> {
    let mut best = None;

    for (index, reader) in readers.iter().enumerate() {
        let Some(instance) = best_instance(
            readable(reader, instances).filter(|i| is_functional(reader, i)),
        )
        .or_else(|| best_instance(readable(reader, instances))) else {
            continue;
        };

        let rank = (
            instance_rank(instance),
            is_functional(reader, instance),
            reader.reader_version(),
        );
        if best.as_ref().is_none_or(|(current, _, _)| rank > *current) {
            best = Some((rank, index, instance));
        }
    }

    best.map(|(_, reader, instance)| Selection {
        reader,
        instance: instance.name.clone(),
    })
}

struct ProxyState<R> {
    readers: Vec<R>,
    active: Option<Selection>,
}

/// Serves reads of one logical projection through whichever reader fits
/// the current instances best.
pub struct ProjectionProxy<R: ProjectionReader> {
    metadata: ProjectionMetadataManager,
    storage_root: DocumentFolder,
    state: RwLock<ProxyState<R>>,
    dirty: AtomicBool,
    evaluating: Mutex<()>,
    watcher: OnceLock<AbortOnDrop>,
}

impl<R: ProjectionReader + 'static> ProjectionProxy<R> {
    /// Creates the proxy, attaches the best reader and starts following
    /// metadata changes.
    ///
    /// Instance storage is looked up under `storage_root`, as laid out by
    /// the projection worker.
    pub async fn open(
        metadata: ProjectionMetadataManager,
        storage_root: DocumentFolder,
        readers: Vec<R>,
    ) -> Result<Arc<Self>> {
        let changes = metadata.register_for_changes(None);
        let proxy = Arc::new(Self {
            metadata,
            storage_root,
            state: RwLock::new(ProxyState {
                readers,
                active: None,
            }),
            dirty: AtomicBool::new(false),
            evaluating: Mutex::new(()),
            watcher: OnceLock::new(),
        });
        proxy.reevaluate().await?;

        let task = tokio::spawn(follow_changes(Arc::downgrade(&proxy), changes));
        let _ = proxy.watcher.set(AbortOnDrop::new(task));
        Ok(proxy)
    }

    /// The attached reader. Holding the guard delays any switch.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, R>> {
        let state = self.state.read().await;
        let Some(index) = state.active.as_ref().map(|active| active.reader) else {
            return Err(ProjectionError::NoInstanceAvailable(
                self.metadata.projection().to_string(),
            ));
        };
        Ok(RwLockReadGuard::map(state, |state| &state.readers[index]))
    }

    /// The currently attached reader/instance pair.
    pub async fn active(&self) -> Option<Selection> {
        self.state.read().await.active.clone()
    }

    /// Re-picks the reader/instance pair.
    ///
    /// Calls made while an evaluation is running are absorbed by it: the
    /// running evaluation goes around once more instead.
    pub async fn reevaluate(&self) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = self.evaluating.try_lock() else {
                return Ok(());
            };
            while self.dirty.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.evaluate().await {
                    self.dirty.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
            drop(guard);
            // A trigger may have arrived between the last check and the unlock.
            if !self.dirty.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn evaluate(&self) -> Result<()> {
        let instances = self.metadata.get_all_metadata().await;

        let mut state = self.state.write().await;
        let selection = select_reader(&state.readers, &instances);
        if selection == state.active {
            return Ok(());
        }

        let target = match &selection {
            Some(selection) => {
                let instance = instances
                    .iter()
                    .find(|i| i.name == selection.instance)
                    .ok_or_else(|| ProjectionError::InstanceNotFound(selection.instance.clone()))?;
                Some((instance, self.storage_root.sub_folder(&instance.name)?))
            }
            None => None,
        };

        if let Some(previous) = state.active.take() {
            state.readers[previous.reader].reset();
        }
        if let (Some(selection), Some((instance, storage))) = (&selection, target) {
            state.readers[selection.reader].attach(instance, storage);
        }

        tracing::info!(
            projection = %self.metadata.projection(),
            instance = ?selection.as_ref().map(|s| s.instance.as_str()),
            reader = ?selection.as_ref().map(|s| s.reader),
            "projection reader switched"
        );
        state.active = selection;
        Ok(())
    }
}

async fn follow_changes<R: ProjectionReader + 'static>(
    proxy: Weak<ProjectionProxy<R>>,
    mut changes: MetadataChanges,
) {
    while changes.recv().await.is_some() {
        let Some(proxy) = proxy.upgrade() else {
            break;
        };
        if let Err(e) = proxy.reevaluate().await {
            tracing::warn!(
                projection = %proxy.metadata.projection(),
                error = %e,
                "failed to re-evaluate projection reader"
            );
        }
    }
}
