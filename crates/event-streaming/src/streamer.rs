use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use event_store::{EventStore, EventStoreToken, GlobalQuery, GlobalSlice, Result, StoredEvent};
use futures_core::Stream;
use futures_util::future::{join_all, select_all};

use crate::{EventFilter, StreamingMode};

/// Events fetched per sub-streamer read.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Type alias for a boxed stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StoredEvent>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    /// Not loaded yet.
    Idle,
    /// Has buffered events.
    Ready,
    /// Caught up with the log as of its last read.
    Waiting,
}

struct SubStreamer {
    stream_prefix: Option<String>,
    event_type: Option<String>,
    /// Everything up to here has been read into the buffer.
    token: EventStoreToken,
    buffer: VecDeque<StoredEvent>,
    state: SubState,
}

impl SubStreamer {
    fn query(&self, batch_size: usize, load_body: bool) -> GlobalQuery {
        let mut query = GlobalQuery::after(self.token).max_count(batch_size);
        query.stream_prefix = self.stream_prefix.clone();
        query.event_type = self.event_type.clone();
        query.load_body = load_body;
        query
    }

    fn apply(&mut self, slice: GlobalSlice) {
        self.token = self.token.max(slice.next_token);
        self.buffer.extend(slice.events);
        self.state = if !self.buffer.is_empty() {
            SubState::Ready
        } else if slice.has_more {
            // The source is still catching up; read again before trusting the tail.
            SubState::Idle
        } else {
            SubState::Waiting
        };
    }

    /// Position up to which this sub-streamer has nothing left to deliver.
    fn settled(&self) -> EventStoreToken {
        match self.buffer.front() {
            Some(event) => EventStoreToken::from_id(event.token.id() - 1),
            None => self.token,
        }
    }
}

/// Merges several filtered reads of the global log into one sequence in
/// token order.
///
/// Each sub-streamer pulls batches for one `(prefix, type)` pair. An event
/// is only returned once every sub-streamer has either buffered data or
/// confirmed it is caught up, so no source with an earlier token can be
/// skipped over. Events matched by more than one sub-streamer are returned
/// once.
pub struct EventStreamer<S: EventStore + ?Sized> {
    store: Arc<S>,
    subs: Vec<SubStreamer>,
    mode: StreamingMode,
    batch_size: usize,
    load_body: bool,
    /// Token of the last event returned.
    last: EventStoreToken,
}

impl<S: EventStore + ?Sized + 'static> EventStreamer<S> {
    /// Creates a live streamer delivering events after `start`.
    pub fn new(store: Arc<S>, filter: &EventFilter, start: EventStoreToken) -> Self {
        let subs = filter
            .combinations()
            .into_iter()
            .map(|(stream_prefix, event_type)| SubStreamer {
                stream_prefix,
                event_type,
                token: start,
                buffer: VecDeque::new(),
                state: SubState::Idle,
            })
            .collect();

        Self {
            store,
            subs,
            mode: StreamingMode::Live,
            batch_size: DEFAULT_BATCH_SIZE,
            load_body: true,
            last: start,
        }
    }

    pub fn mode(mut self, mode: StreamingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Delivers headers only; bodies can be loaded with `EventStore::load_bodies`.
    pub fn headers_only(mut self) -> Self {
        self.load_body = false;
        self
    }

    /// Resumable checkpoint: every matching event up to this token has been
    /// returned.
    pub fn token(&self) -> EventStoreToken {
        self.subs
            .iter()
            .map(SubStreamer::settled)
            .min()
            .unwrap_or(self.last)
            .max(self.last)
    }

    /// Returns the next matching event in token order.
    ///
    /// `Ok(None)` means the streamer is caught up: returned when `nowait` is
    /// set or in [`StreamingMode::Rebuild`]. Otherwise a caught-up streamer
    /// waits for new events. Cancel-safe: dropping the future loses no
    /// events.
    pub async fn next_event(&mut self, nowait: bool) -> Result<Option<StoredEvent>> {
        loop {
            self.load_empty().await?;

            if let Some(event) = self.pop_lowest() {
                return Ok(Some(event));
            }
            if self.subs.iter().any(|s| s.state != SubState::Waiting) {
                // Some source ran dry or fell behind; reload before deciding.
                continue;
            }
            if nowait || self.mode == StreamingMode::Rebuild {
                return Ok(None);
            }

            self.wait_any().await?;
        }
    }

    /// Non-blocking read for every sub-streamer with an empty buffer.
    /// Results are applied only once all reads finished.
    async fn load_empty(&mut self) -> Result<()> {
        let loads = self
            .subs
            .iter()
            .enumerate()
            .filter(|(_, sub)| sub.buffer.is_empty())
            .map(|(i, sub)| {
                let store = self.store.clone();
                let query = sub.query(self.batch_size, self.load_body);
                async move { (i, store.read_global(query).await) }
            })
            .collect::<Vec<_>>();
        if loads.is_empty() {
            return Ok(());
        }

        let mut failure = None;
        for (i, result) in join_all(loads).await {
            match result {
                Ok(slice) => self.subs[i].apply(slice),
                Err(e) => {
                    tracing::warn!(error = %e, "sub-streamer read failed");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pops the lowest buffered event, skipping ones already returned.
    ///
    /// Returns `None` when a sub-streamer must be reloaded first: one ran
    /// dry while skipping duplicates, or a caught-up one has not read as
    /// far as the candidate event.
    fn pop_lowest(&mut self) -> Option<StoredEvent> {
        loop {
            let (index, token) = self
                .subs
                .iter()
                .enumerate()
                .filter_map(|(i, sub)| sub.buffer.front().map(|e| (i, e.token)))
                .min_by_key(|(_, token)| *token)?;

            if token <= self.last {
                let sub = &mut self.subs[index];
                sub.buffer.pop_front();
                if sub.buffer.is_empty() {
                    sub.state = SubState::Idle;
                    return None;
                }
                continue;
            }

            let mut behind = false;
            for sub in self
                .subs
                .iter_mut()
                .filter(|sub| sub.buffer.is_empty() && sub.token < token)
            {
                sub.state = SubState::Idle;
                behind = true;
            }
            if behind {
                return None;
            }

            let sub = &mut self.subs[index];
            let event = sub.buffer.pop_front()?;
            if sub.buffer.is_empty() {
                sub.state = SubState::Idle;
            }
            self.last = event.token;
            return Some(event);
        }
    }

    /// Blocks until any sub-streamer receives new events.
    async fn wait_any(&mut self) -> Result<()> {
        let waits = self
            .subs
            .iter()
            .enumerate()
            .map(|(i, sub)| {
                let store = self.store.clone();
                let query = sub.query(self.batch_size, self.load_body);
                Box::pin(async move { (i, store.wait_for_global(query).await) })
            })
            .collect::<Vec<_>>();

        // The remaining waits are dropped, which cancels them.
        let ((index, result), _, _) = select_all(waits).await;
        self.subs[index].apply(result?);
        Ok(())
    }

    /// Adapts the streamer into a `Stream`. In rebuild mode the stream ends
    /// when the log's tail is reached.
    pub fn into_stream(self) -> EventStream {
        Box::pin(futures_util::stream::unfold(self, |mut streamer| async move {
            match streamer.next_event(false).await {
                Ok(Some(event)) => Some((Ok(event), streamer)),
                Ok(None) => None,
                Err(e) => Some((Err(e), streamer)),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use event_store::{
        AppendResult, EventStoreExt, EventStoreVersion, InMemoryEventStore, NewEvent, StreamSlice,
        Version,
    };
    use futures_util::StreamExt;

    use super::*;

    async fn append(store: &InMemoryEventStore, stream: &str, event_type: &str) -> EventStoreToken {
        store
            .append_event(stream, NewEvent::new(event_type, "{}"), EventStoreVersion::Any)
            .await
            .unwrap()
            .tokens[0]
    }

    async fn drain(streamer: &mut EventStreamer<InMemoryEventStore>) -> Vec<StoredEvent> {
        let mut events = Vec::new();
        while let Some(event) = streamer.next_event(true).await.unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn merges_filtered_sources_in_token_order() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, "tool-1", "Created").await;
        append(&store, "tool-1", "Moved").await;
        append(&store, "tool-2", "Created").await;
        append(&store, "tool-1", "Deleted").await;
        append(&store, "tool-2", "Deleted").await;

        let filter = EventFilter::all().event_types(["Deleted", "Created"]);
        let mut streamer =
            EventStreamer::new(store.clone(), &filter, EventStoreToken::initial()).batch_size(1);

        let events = drain(&mut streamer).await;
        let tokens: Vec<i64> = events.iter().map(|e| e.token.id()).collect();
        assert_eq!(tokens, vec![1, 3, 4, 5]);
        assert!(events.iter().all(|e| e.event_type != "Moved"));
    }

    #[tokio::test]
    async fn overlapping_prefixes_deliver_once() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, "tool-1", "Created").await;
        append(&store, "tool-2", "Created").await;
        append(&store, "tool-1", "Moved").await;

        let filter = EventFilter::all().stream_prefixes(["tool-", "tool-1"]);
        let mut streamer = EventStreamer::new(store.clone(), &filter, EventStoreToken::initial());

        let tokens: Vec<i64> = drain(&mut streamer)
            .await
            .iter()
            .map(|e| e.token.id())
            .collect();
        assert_eq!(tokens, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rebuild_mode_reports_tail() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, "tool-1", "Created").await;
        append(&store, "repair-1", "Opened").await;
        let head = append(&store, "repair-1", "Closed").await;

        let filter = EventFilter::all().stream_prefixes(["tool-"]);
        let mut streamer = EventStreamer::new(store.clone(), &filter, EventStoreToken::initial())
            .mode(StreamingMode::Rebuild);

        let first = streamer.next_event(false).await.unwrap().unwrap();
        assert_eq!(first.stream_name, "tool-1");
        assert!(streamer.next_event(false).await.unwrap().is_none());
        // Nothing else matches up to the head, so the checkpoint can skip ahead.
        assert_eq!(streamer.token(), head);
    }

    /// Answers the first few global reads as a cache that has not caught up yet.
    struct Lagging {
        inner: InMemoryEventStore,
        lagging_reads: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for Lagging {
        async fn append_to_stream(
            &self,
            stream: &str,
            events: Vec<NewEvent>,
            expected: EventStoreVersion,
        ) -> Result<AppendResult> {
            self.inner.append_to_stream(stream, events, expected).await
        }

        async fn read_stream(
            &self,
            stream: &str,
            min_version: Version,
            max_count: usize,
            load_body: bool,
        ) -> Result<StreamSlice> {
            self.inner
                .read_stream(stream, min_version, max_count, load_body)
                .await
        }

        async fn read_global(&self, query: GlobalQuery) -> Result<GlobalSlice> {
            let lagging = self
                .lagging_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lagging {
                return Ok(GlobalSlice {
                    events: Vec::new(),
                    next_token: query.token,
                    has_more: true,
                });
            }
            self.inner.read_global(query).await
        }

        async fn wait_for_global(&self, query: GlobalQuery) -> Result<GlobalSlice> {
            self.inner.wait_for_global(query).await
        }

        async fn load_bodies(&self, events: &mut [StoredEvent]) -> Result<()> {
            self.inner.load_bodies(events).await
        }

        async fn head_token(&self) -> Result<EventStoreToken> {
            self.inner.head_token().await
        }
    }

    #[tokio::test]
    async fn rebuild_mode_does_not_stop_while_source_is_behind() {
        let inner = InMemoryEventStore::new();
        append(&inner, "tool-1", "Created").await;
        append(&inner, "tool-2", "Created").await;
        let store = Arc::new(Lagging {
            inner,
            lagging_reads: AtomicUsize::new(2),
        });

        let mut streamer = EventStreamer::new(store, &EventFilter::all(), EventStoreToken::initial())
            .mode(StreamingMode::Rebuild);
        let first = streamer.next_event(false).await.unwrap().unwrap();
        assert_eq!(first.stream_name, "tool-1");
        let second = streamer.next_event(false).await.unwrap().unwrap();
        assert_eq!(second.stream_name, "tool-2");
        assert!(streamer.next_event(false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_mode_waits_for_new_events() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, "tool-1", "Created").await;

        let filter = EventFilter::all().event_types(["Deleted"]);
        let mut streamer = EventStreamer::new(store.clone(), &filter, EventStoreToken::initial());
        assert!(streamer.next_event(true).await.unwrap().is_none());

        let waiter = tokio::spawn(async move {
            let event = streamer.next_event(false).await;
            (event, streamer)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        append(&store, "tool-1", "Moved").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        let deleted = append(&store, "tool-1", "Deleted").await;

        let (event, streamer) = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(event.unwrap().unwrap().token, deleted);
        assert_eq!(streamer.token(), deleted);
    }

    #[tokio::test]
    async fn cancelled_wait_loses_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut streamer =
            EventStreamer::new(store.clone(), &EventFilter::all(), EventStoreToken::initial());

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), streamer.next_event(false)).await;
        assert!(cancelled.is_err());

        let token = append(&store, "tool-1", "Created").await;
        let event = streamer.next_event(true).await.unwrap().unwrap();
        assert_eq!(event.token, token);
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_token() {
        let store = Arc::new(InMemoryEventStore::new());
        for i in 0..5 {
            append(&store, &format!("tool-{i}"), "Created").await;
        }

        let mut first = EventStreamer::new(store.clone(), &EventFilter::all(), EventStoreToken::initial())
            .batch_size(2);
        first.next_event(true).await.unwrap().unwrap();
        first.next_event(true).await.unwrap().unwrap();
        let checkpoint = first.token();
        assert_eq!(checkpoint, EventStoreToken::from_id(2));

        let mut resumed = EventStreamer::new(store.clone(), &EventFilter::all(), checkpoint);
        let tokens: Vec<i64> = drain(&mut resumed)
            .await
            .iter()
            .map(|e| e.token.id())
            .collect();
        assert_eq!(tokens, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn stream_adapter_ends_at_tail_in_rebuild_mode() {
        let store = Arc::new(InMemoryEventStore::new());
        for i in 0..3 {
            append(&store, &format!("tool-{i}"), "Created").await;
        }

        let events: Vec<_> = EventStreamer::new(store.clone(), &EventFilter::all(), EventStoreToken::initial())
            .mode(StreamingMode::Rebuild)
            .headers_only()
            .into_stream()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.as_ref().is_ok_and(|e| !e.has_body())));
    }
}
