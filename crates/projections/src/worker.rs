//! Projection worker: builds instances from the log and keeps the running
//! instance up to date.
//!
//! A worker plays one [`WorkerRole`]. The master serves whatever instance is
//! `Running`, building the first one itself when none exists. A rebuilder
//! builds the instance for a newer code version next to it, cuts over and
//! exits. Both checkpoint their cursor into the projection metadata every
//! [`WorkerConfig::checkpoint_interval`] events.

use std::sync::Arc;

use common::NodeId;
use document_store::DocumentFolder;
use event_store::{EventStore, EventStoreToken, StoredEvent};
use event_streaming::{EventStreamer, StreamingMode};
use node_lock::{LockMode, LockOutcome, NodeLockManager};
use tokio::sync::watch;

use crate::rebuild::running_instance;
use crate::{
    MetadataChange, ProjectionDefinition, ProjectionError, ProjectionInstanceMetadata,
    ProjectionMetadataManager, ProjectionStatus, RebuildType, Result, WorkerConfig, WorkerRole,
    detect_rebuild_type, projection::Projection,
};

/// Why [`ProjectionWorker::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The shutdown signal was received.
    Shutdown,
    /// The rebuilder completed this instance and cut over to it.
    Built(String),
    /// The rebuilder's instance was cancelled by another party.
    Cancelled(String),
    /// The rebuilder found nothing to build, or another node is rebuilding.
    NothingToDo,
}

#[derive(Debug, PartialEq, Eq)]
enum BuildOutcome {
    Completed,
    Cancelled,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum ServeOutcome {
    Superseded,
    Shutdown,
}

/// One projection instance being fed from the log.
struct Run<S: EventStore + ?Sized> {
    instance: String,
    projection: Box<dyn Projection>,
    streamer: EventStreamer<S>,
    saved: EventStoreToken,
    since_checkpoint: usize,
}

/// Runs one logical projection on behalf of one node.
pub struct ProjectionWorker<S: EventStore + ?Sized> {
    store: Arc<S>,
    definition: Arc<dyn ProjectionDefinition>,
    metadata: ProjectionMetadataManager,
    storage_root: DocumentFolder,
    node_id: NodeId,
    role: WorkerRole,
    config: WorkerConfig,
    locks: Option<Arc<NodeLockManager>>,
}

impl<S: EventStore + ?Sized + 'static> ProjectionWorker<S> {
    /// Creates a worker. Each instance stores its data in the sub-folder of
    /// `storage_root` named after the instance.
    pub fn new(
        store: Arc<S>,
        definition: Arc<dyn ProjectionDefinition>,
        metadata: ProjectionMetadataManager,
        storage_root: DocumentFolder,
        node_id: NodeId,
        role: WorkerRole,
    ) -> Self {
        Self {
            store,
            definition,
            metadata,
            storage_root,
            node_id,
            role,
            config: WorkerConfig::default(),
            locks: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Serializes builds across nodes through the `rebuild.<projection>` lock.
    pub fn with_lock_manager(mut self, locks: Arc<NodeLockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Runs until shut down or, for a rebuilder, until its build ends.
    ///
    /// Setting the `shutdown` channel to `true` (or dropping its sender)
    /// stops the worker after a final checkpoint.
    #[tracing::instrument(skip_all, fields(projection = %self.definition.name(), role = ?self.role))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerExit> {
        match self.role {
            WorkerRole::Master => self.run_master(&mut shutdown).await,
            WorkerRole::Rebuilder => self.run_rebuilder(&mut shutdown).await,
        }
    }

    async fn detect(&self) -> Result<(Vec<ProjectionInstanceMetadata>, RebuildType)> {
        self.metadata.refresh().await?;
        let instances = self.metadata.get_all_metadata().await;
        let detected = detect_rebuild_type(&instances, self.definition.version());
        Ok((instances, detected))
    }

    async fn run_master(&self, shutdown: &mut watch::Receiver<bool>) -> Result<WorkerExit> {
        let mut locked = false;

        let exit = loop {
            if *shutdown.borrow() {
                break WorkerExit::Shutdown;
            }
            let (instances, detected) = self.detect().await?;

            let building = matches!(
                detected,
                RebuildType::Initial | RebuildType::ContinueInitial(_)
            );
            if building && !locked && let Some(locks) = self.lock_manager() {
                let lock_name = self.rebuild_lock_name();
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break WorkerExit::Shutdown,
                    outcome = locks.lock(&lock_name, LockMode::Wait) => {
                        locked = outcome? == LockOutcome::Locked;
                    }
                }
                // Another node may have built the instance while we waited.
                continue;
            }
            if !building && locked {
                self.unlock_rebuild().await?;
                locked = false;
            }

            let outcome = match detected {
                RebuildType::Initial => {
                    let instance = self.start_build().await?;
                    self.build(&instance, true, shutdown).await?
                }
                RebuildType::ContinueInitial(build) => self.build(&build, false, shutdown).await?,
                RebuildType::NoRebuild(_)
                | RebuildType::NewRebuild(_)
                | RebuildType::ContinueRebuild(_) => {
                    let Some(running) = running_instance(&instances).cloned() else {
                        continue;
                    };
                    match self.serve(&running, shutdown).await? {
                        ServeOutcome::Superseded => continue,
                        ServeOutcome::Shutdown => break WorkerExit::Shutdown,
                    }
                }
            };
            if outcome == BuildOutcome::Shutdown {
                break WorkerExit::Shutdown;
            }
        };

        if locked {
            self.unlock_rebuild().await?;
        }
        Ok(exit)
    }

    async fn run_rebuilder(&self, shutdown: &mut watch::Receiver<bool>) -> Result<WorkerExit> {
        let (_, detected) = self.detect().await?;
        if !matches!(
            detected,
            RebuildType::NewRebuild(_) | RebuildType::ContinueRebuild(_)
        ) {
            tracing::info!("no rebuild needed");
            return Ok(WorkerExit::NothingToDo);
        }

        let Some(locks) = self.lock_manager() else {
            return self.rebuild(shutdown).await;
        };
        if locks.lock(&self.rebuild_lock_name(), LockMode::NoWait).await? == LockOutcome::CannotLock {
            tracing::info!("another node is rebuilding");
            return Ok(WorkerExit::NothingToDo);
        }

        let result = self.rebuild(shutdown).await;
        if let Err(e) = self.unlock_rebuild().await {
            tracing::warn!(error = %e, "failed to release rebuild lock");
        }
        result
    }

    async fn rebuild(&self, shutdown: &mut watch::Receiver<bool>) -> Result<WorkerExit> {
        // Detect again: the picture may have changed while taking the lock.
        let (instance, fresh) = match self.detect().await?.1 {
            RebuildType::NewRebuild(_) => (self.start_build().await?, true),
            RebuildType::ContinueRebuild(build) => (build, false),
            _ => return Ok(WorkerExit::NothingToDo),
        };

        Ok(match self.build(&instance, fresh, shutdown).await? {
            BuildOutcome::Completed => WorkerExit::Built(instance.name),
            BuildOutcome::Cancelled => WorkerExit::Cancelled(instance.name),
            BuildOutcome::Shutdown => WorkerExit::Shutdown,
        })
    }

    async fn start_build(&self) -> Result<ProjectionInstanceMetadata> {
        self.metadata
            .build_new_instance(
                &self.node_id,
                self.definition.version(),
                self.definition.minimal_reader_version(),
            )
            .await
    }

    /// Feeds `instance` from its cursor to the tail of the log, then cuts over.
    #[tracing::instrument(skip_all, fields(instance = %instance.name, fresh = fresh))]
    async fn build(
        &self,
        instance: &ProjectionInstanceMetadata,
        fresh: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<BuildOutcome> {
        let mut changes = self.metadata.register_for_changes(Some(&instance.name));
        let storage = self.storage_root.sub_folder(&instance.name)?;

        let start = if fresh {
            storage.delete_all().await?;
            EventStoreToken::initial()
        } else {
            self.metadata.get_token(&instance.name).await?
        };

        let status = self.metadata.get_instance(&instance.name).await.map(|i| i.status);
        if !is_building(status) {
            self.tear_down(&storage).await;
            return Ok(BuildOutcome::Cancelled);
        }
        tracing::info!(%start, "building projection instance");

        let mut run = self.open_run(instance, storage.clone(), start, StreamingMode::Rebuild);
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.checkpoint(&mut run).await?;
                    return Ok(BuildOutcome::Shutdown);
                }
                Some(change) = changes.recv() => {
                    if !is_building(self.status_after(&instance.name, change).await) {
                        tracing::info!("build cancelled, tearing down");
                        drop(run);
                        self.tear_down(&storage).await;
                        return Ok(BuildOutcome::Cancelled);
                    }
                    continue;
                }
                next = run.streamer.next_event(false) => next?,
            };

            match next {
                Some(event) => {
                    self.apply(&mut run, &event).await;
                    if run.since_checkpoint >= self.config.checkpoint_interval {
                        self.checkpoint(&mut run).await?;
                    }
                }
                None => {
                    // Reached the tail: commit, then cut over.
                    self.checkpoint(&mut run).await?;
                    return match self.metadata.upgrade(&instance.name).await {
                        Ok(()) => Ok(BuildOutcome::Completed),
                        Err(ProjectionError::InvalidTransition { status, .. }) => {
                            tracing::info!(%status, "build cancelled before cutover, tearing down");
                            drop(run);
                            self.tear_down(&storage).await;
                            Ok(BuildOutcome::Cancelled)
                        }
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    /// Keeps the running `instance` up to date until it is replaced or the
    /// worker shuts down.
    #[tracing::instrument(skip_all, fields(instance = %instance.name))]
    async fn serve(
        &self,
        instance: &ProjectionInstanceMetadata,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ServeOutcome> {
        let mut changes = self.metadata.register_for_changes(Some(&instance.name));
        let storage = self.storage_root.sub_folder(&instance.name)?;
        let start = self.metadata.get_token(&instance.name).await?;

        let status = self.metadata.get_instance(&instance.name).await.map(|i| i.status);
        if status != Some(ProjectionStatus::Running) {
            return Ok(ServeOutcome::Superseded);
        }
        tracing::info!(%start, "serving projection instance");

        let mut run = self.open_run(instance, storage, start, StreamingMode::Live);
        let mut idle = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.checkpoint(&mut run).await?;
                    return Ok(ServeOutcome::Shutdown);
                }
                Some(change) = changes.recv() => {
                    let status = self.status_after(&instance.name, change).await;
                    if status != Some(ProjectionStatus::Running) {
                        tracing::info!(status = ?status, "instance no longer running");
                        self.checkpoint(&mut run).await?;
                        return Ok(ServeOutcome::Superseded);
                    }
                    continue;
                }
                next = run.streamer.next_event(!idle) => next?,
            };

            match next {
                Some(event) => {
                    idle = false;
                    self.apply(&mut run, &event).await;
                    if run.since_checkpoint >= self.config.checkpoint_interval {
                        self.checkpoint(&mut run).await?;
                    }
                }
                None => {
                    // Caught up: checkpoint, then block for new events.
                    self.checkpoint(&mut run).await?;
                    idle = true;
                }
            }
        }
    }

    fn open_run(
        &self,
        instance: &ProjectionInstanceMetadata,
        storage: DocumentFolder,
        start: EventStoreToken,
        mode: StreamingMode,
    ) -> Run<S> {
        let streamer = EventStreamer::new(self.store.clone(), &self.definition.event_filter(), start)
            .mode(mode)
            .batch_size(self.config.batch_size);
        Run {
            instance: instance.name.clone(),
            projection: self.definition.create(storage),
            streamer,
            saved: start,
            since_checkpoint: 0,
        }
    }

    async fn apply(&self, run: &mut Run<S>, event: &StoredEvent) {
        match run.projection.handle(event).await {
            Ok(()) => metrics::counter!("projection_events_processed_total").increment(1),
            Err(e) => {
                metrics::counter!("projection_handler_failures_total").increment(1);
                tracing::error!(
                    token = %event.token,
                    stream = %event.stream_name,
                    event_type = %event.event_type,
                    error = %e,
                    "projection handler failed, skipping event"
                );
            }
        }
        run.since_checkpoint += 1;
    }

    /// Flushes the projection and persists the cursor if it moved.
    async fn checkpoint(&self, run: &mut Run<S>) -> Result<()> {
        run.projection.flush().await?;
        let token = run.streamer.token();
        if token != run.saved {
            self.metadata.set_token(&run.instance, token).await?;
            run.saved = token;
            metrics::counter!("projection_checkpoints_total").increment(1);
            tracing::debug!(%token, "checkpoint");
        }
        run.since_checkpoint = 0;
        Ok(())
    }

    async fn status_after(&self, instance: &str, change: MetadataChange) -> Option<ProjectionStatus> {
        match change {
            MetadataChange::Instance { status, .. } => Some(status),
            MetadataChange::Resync => self.metadata.get_instance(instance).await.map(|i| i.status),
        }
    }

    async fn tear_down(&self, storage: &DocumentFolder) {
        if let Err(e) = storage.delete_all().await {
            tracing::warn!(folder = %storage.path(), error = %e, "failed to tear down instance storage");
        }
    }

    fn lock_manager(&self) -> Option<&NodeLockManager> {
        self.locks
            .as_deref()
            .filter(|_| self.config.rebuild_lock)
    }

    fn rebuild_lock_name(&self) -> String {
        format!("rebuild.{}", self.definition.name())
    }

    async fn unlock_rebuild(&self) -> Result<()> {
        if let Some(locks) = self.lock_manager() {
            locks.unlock(&self.rebuild_lock_name()).await?;
        }
        Ok(())
    }
}

fn is_building(status: Option<ProjectionStatus>) -> bool {
    matches!(
        status,
        Some(ProjectionStatus::NewBuild | ProjectionStatus::Running)
    )
}
