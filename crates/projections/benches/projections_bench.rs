use std::sync::Arc;

use async_trait::async_trait;
use common::NodeId;
use criterion::{Criterion, criterion_group, criterion_main};
use document_store::{DocumentFolder, DocumentStoreVersion, InMemoryDocumentStore};
use event_store::{EventStoreExt, EventStoreVersion, InMemoryEventStore, NewEvent, StoredEvent};
use event_streaming::EventFilter;
use projections::{
    EventRouter, Projection, ProjectionDefinition, ProjectionMetadataManager, ProjectionWorker,
    Result, WorkerConfig, WorkerExit, WorkerRole,
};
use tokio::sync::watch;

#[derive(Default)]
struct Counts {
    added: u64,
    removed: u64,
}

fn on_added(counts: &mut Counts, _event: &StoredEvent) -> Result<()> {
    counts.added += 1;
    Ok(())
}

fn on_removed(counts: &mut Counts, _event: &StoredEvent) -> Result<()> {
    counts.removed += 1;
    Ok(())
}

fn router() -> EventRouter<Counts> {
    EventRouter::new()
        .on("ToolAdded", on_added)
        .on("ToolRemoved", on_removed)
}

struct ToolCounts {
    storage: DocumentFolder,
    counts: Counts,
    router: EventRouter<Counts>,
}

#[async_trait]
impl Projection for ToolCounts {
    async fn handle(&mut self, event: &StoredEvent) -> Result<()> {
        self.router.dispatch(&mut self.counts, event).map(|_| ())
    }

    async fn flush(&mut self) -> Result<()> {
        let live = self.counts.added.saturating_sub(self.counts.removed);
        self.storage
            .save_document("live", &live.to_string(), DocumentStoreVersion::Any, &[])
            .await?;
        Ok(())
    }
}

struct ToolCountsDefinition {
    version: &'static str,
}

impl ProjectionDefinition for ToolCountsDefinition {
    fn name(&self) -> &str {
        "tool-counts"
    }

    fn version(&self) -> &str {
        self.version
    }

    fn event_filter(&self) -> EventFilter {
        router().filter()
    }

    fn create(&self, storage: DocumentFolder) -> Box<dyn Projection> {
        Box::new(ToolCounts {
            storage,
            counts: Counts::default(),
            router: router(),
        })
    }
}

fn populated_store(rt: &tokio::runtime::Runtime, tools: usize) -> Arc<InMemoryEventStore> {
    let store = Arc::new(InMemoryEventStore::new());
    rt.block_on(async {
        for t in 0..tools {
            let stream = format!("tool-{t}");
            store
                .append_event(&stream, NewEvent::new("ToolAdded", "{}"), EventStoreVersion::Any)
                .await
                .unwrap();
            store
                .append_event(&stream, NewEvent::new("ToolMoved", "{}"), EventStoreVersion::Any)
                .await
                .unwrap();
            if t % 3 == 0 {
                store
                    .append_event(&stream, NewEvent::new("ToolRemoved", "{}"), EventStoreVersion::Any)
                    .await
                    .unwrap();
            }
        }
    });
    store
}

/// Rebuilds a new version next to a running one and cuts over.
async fn rebuild_once(store: Arc<InMemoryEventStore>, config: WorkerConfig) {
    let documents = InMemoryDocumentStore::new().folder();
    let metadata =
        ProjectionMetadataManager::open(&documents.sub_folder("projections").unwrap(), "tool-counts")
            .await
            .unwrap();
    let node = NodeId::from_string("bench");
    let running = metadata.build_new_instance(&node, "1", "1").await.unwrap();
    metadata.upgrade(&running.name).await.unwrap();

    let worker = ProjectionWorker::new(
        store,
        Arc::new(ToolCountsDefinition { version: "2" }),
        metadata,
        documents.sub_folder("storage").unwrap(),
        node,
        WorkerRole::Rebuilder,
    )
    .with_config(config);
    let (_shutdown, rx) = watch::channel(false);
    let exit = worker.run(rx).await.unwrap();
    assert!(matches!(exit, WorkerExit::Built(_)));
}

fn bench_rebuild_300_tools(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = populated_store(&rt, 300);

    c.bench_function("projections/rebuild_700_events", |b| {
        b.iter(|| rt.block_on(rebuild_once(store.clone(), WorkerConfig::default())));
    });
}

fn bench_rebuild_checkpoint_every_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = populated_store(&rt, 300);
    let config = WorkerConfig {
        checkpoint_interval: 10,
        ..WorkerConfig::default()
    };

    c.bench_function("projections/rebuild_700_events_checkpoint_10", |b| {
        b.iter(|| rt.block_on(rebuild_once(store.clone(), config.clone())));
    });
}

fn bench_router_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = populated_store(&rt, 1);
    let events = rt.block_on(store.read_all("tool-0")).unwrap().events;
    let router = router();

    c.bench_function("projections/router_dispatch", |b| {
        b.iter(|| {
            let mut counts = Counts::default();
            for event in &events {
                router.dispatch(&mut counts, event).unwrap();
            }
            counts
        });
    });
}

criterion_group!(
    benches,
    bench_rebuild_300_tools,
    bench_rebuild_checkpoint_every_10,
    bench_router_dispatch,
);
criterion_main!(benches);
