use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};

use crate::{
    AppendResult, EventStoreError, EventStoreToken, EventStoreVersion, GlobalQuery, GlobalSlice,
    NewEvent, Result, StoredEvent, StreamSlice, Version,
    store::{EventStore, validate_append},
};

#[derive(Default)]
struct Log {
    /// Event with token `n` lives at index `n - 1`.
    events: Vec<StoredEvent>,
    /// Per stream, indexes into `events` in version order.
    streams: HashMap<String, Vec<usize>>,
}

impl Log {
    fn head(&self) -> EventStoreToken {
        self.events
            .last()
            .map(|e| e.token)
            .unwrap_or_else(EventStoreToken::initial)
    }

    fn after(&self, token: EventStoreToken) -> &[StoredEvent] {
        let start = usize::try_from(token.id())
            .unwrap_or(0)
            .min(self.events.len());
        &self.events[start..]
    }
}

/// In-memory event store implementation for testing.
///
/// This implementation stores all events in memory and provides
/// the same interface as the PostgreSQL implementation.
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    head: Arc<watch::Sender<EventStoreToken>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        let (head, _) = watch::channel(EventStoreToken::initial());
        Self {
            log: Arc::new(RwLock::new(Log::default())),
            head: Arc::new(head),
        }
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append_to_stream(
        &self,
        stream: &str,
        events: Vec<NewEvent>,
        expected: EventStoreVersion,
    ) -> Result<AppendResult> {
        validate_append(stream, &events)?;

        let mut log = self.log.write().await;

        let current = log
            .streams
            .get(stream)
            .map(|indexes| Version::new(indexes.len() as i64))
            .unwrap_or_else(Version::initial);

        if !expected.matches(current) {
            metrics::counter!("eventstore_concurrency_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }

        let mut version = current;
        let mut tokens = Vec::with_capacity(events.len());
        let mut indexes = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let index = log.events.len();
            let token = EventStoreToken::from_id(index as i64 + 1);
            log.events.push(StoredEvent {
                token,
                stream_name: stream.to_string(),
                stream_version: version,
                event_type: event.event_type,
                format: event.format,
                contents: Some(event.contents),
            });
            indexes.push(index);
            tokens.push(token);
        }
        log.streams
            .entry(stream.to_string())
            .or_default()
            .extend(indexes);

        let head = log.head();
        drop(log);
        self.head.send_replace(head);

        metrics::counter!("eventstore_events_appended_total").increment(tokens.len() as u64);
        Ok(AppendResult { version, tokens })
    }

    async fn read_stream(
        &self,
        stream: &str,
        min_version: Version,
        max_count: usize,
        load_body: bool,
    ) -> Result<StreamSlice> {
        let log = self.log.read().await;
        let Some(indexes) = log.streams.get(stream) else {
            return Ok(StreamSlice::default());
        };

        let skip = usize::try_from(min_version.as_i64() - 1).unwrap_or(0);
        let events = indexes
            .iter()
            .skip(skip)
            .take(max_count)
            .map(|&i| {
                let event = &log.events[i];
                if load_body {
                    event.clone()
                } else {
                    event.header()
                }
            })
            .collect();

        Ok(StreamSlice {
            events,
            current_version: Version::new(indexes.len() as i64),
        })
    }

    async fn read_global(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        let log = self.log.read().await;
        Ok(query.slice_from(log.after(query.token), log.head()))
    }

    async fn wait_for_global(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        let mut changes = self.head.subscribe();
        let mut query = query;
        loop {
            let slice = self.read_global(query.clone()).await?;
            if !slice.events.is_empty() {
                return Ok(slice);
            }
            query.token = slice.next_token;
            if changes.changed().await.is_err() {
                return Ok(slice);
            }
        }
    }

    async fn load_bodies(&self, events: &mut [StoredEvent]) -> Result<()> {
        let log = self.log.read().await;
        for event in events.iter_mut().filter(|e| !e.has_body()) {
            let stored = usize::try_from(event.token.id() - 1)
                .ok()
                .and_then(|i| log.events.get(i))
                .ok_or_else(|| {
                    EventStoreError::Invariant(format!("event {} does not exist", event.token))
                })?;
            event.contents = stored.contents.clone();
        }
        Ok(())
    }

    async fn head_token(&self) -> Result<EventStoreToken> {
        Ok(self.log.read().await.head())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::EventStoreExt;

    fn create_test_event(event_type: &str, n: u32) -> NewEvent {
        NewEvent::new(event_type, format!("{{\"n\":{n}}}"))
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();

        let result = store
            .append_to_stream(
                "tool-1",
                vec![create_test_event("ToolCreated", 1)],
                EventStoreVersion::EmptyStream,
            )
            .await
            .unwrap();
        assert_eq!(result.version, Version::first());
        assert_eq!(result.tokens, vec![EventStoreToken::from_id(1)]);

        let slice = store.read_all("tool-1").await.unwrap();
        assert_eq!(slice.events.len(), 1);
        assert_eq!(slice.current_version, Version::first());
    }

    #[tokio::test]
    async fn append_three_then_stale_append_conflicts() {
        let store = InMemoryEventStore::new();

        let events = vec![
            create_test_event("ToolCreated", 1),
            create_test_event("ToolRenamed", 2),
            create_test_event("ToolMoved", 3),
        ];
        let result = store
            .append_to_stream("tool-1", events, EventStoreVersion::EmptyStream)
            .await
            .unwrap();
        assert_eq!(result.version, Version::new(3));
        let tokens: Vec<String> = result.tokens.iter().map(|t| t.to_string()).collect();
        assert_eq!(tokens, vec!["1", "2", "3"]);

        let err = store
            .append_to_stream(
                "tool-1",
                vec![create_test_event("ToolDeleted", 4)],
                EventStoreVersion::EmptyStream,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { actual, .. } if actual == Version::new(3)
        ));

        assert_eq!(store.stream_version("tool-1").await.unwrap(), Version::new(3));
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn append_with_matching_expected_version() {
        let store = InMemoryEventStore::new();
        store
            .append_event(
                "tool-1",
                create_test_event("ToolCreated", 1),
                EventStoreVersion::EmptyStream,
            )
            .await
            .unwrap();

        let result = store
            .append_event(
                "tool-1",
                create_test_event("ToolRenamed", 2),
                EventStoreVersion::Number(1),
            )
            .await;
        assert!(result.is_ok());

        let wrong = store
            .append_event(
                "tool-1",
                create_test_event("ToolRenamed", 3),
                EventStoreVersion::Number(1),
            )
            .await;
        assert!(wrong.unwrap_err().is_concurrency_conflict());
    }

    #[tokio::test]
    async fn read_stream_round_trip_from_version() {
        let store = InMemoryEventStore::new();
        let events: Vec<_> = (1..=5).map(|n| create_test_event("Counted", n)).collect();
        store
            .append_to_stream("counter", events.clone(), EventStoreVersion::Any)
            .await
            .unwrap();

        let all = store.read_all("counter").await.unwrap();
        let bodies: Vec<_> = all.events.iter().map(|e| e.contents.clone().unwrap()).collect();
        let expected: Vec<_> = events.iter().map(|e| e.contents.clone()).collect();
        assert_eq!(bodies, expected);

        let from_v3 = store
            .read_stream("counter", Version::new(3), 2, false)
            .await
            .unwrap();
        assert_eq!(from_v3.events.len(), 2);
        assert_eq!(from_v3.events[0].stream_version, Version::new(3));
        assert!(!from_v3.events[0].has_body());
        assert_eq!(from_v3.current_version, Version::new(5));
    }

    #[tokio::test]
    async fn read_missing_stream_is_empty() {
        let store = InMemoryEventStore::new();
        let slice = store.read_all("nope").await.unwrap();
        assert!(slice.events.is_empty());
        assert_eq!(slice.current_version, Version::initial());
    }

    #[tokio::test]
    async fn tokens_increase_across_streams() {
        let store = InMemoryEventStore::new();
        let a = store
            .append_event("tool-1", create_test_event("A", 1), EventStoreVersion::Any)
            .await
            .unwrap();
        let b = store
            .append_event("repair-1", create_test_event("B", 1), EventStoreVersion::Any)
            .await
            .unwrap();
        let c = store
            .append_event("tool-1", create_test_event("A", 2), EventStoreVersion::Any)
            .await
            .unwrap();
        assert!(a.tokens[0] < b.tokens[0]);
        assert!(b.tokens[0] < c.tokens[0]);
        assert_eq!(store.head_token().await.unwrap(), c.tokens[0]);
    }

    #[tokio::test]
    async fn read_global_with_filters() {
        let store = InMemoryEventStore::new();
        store
            .append_event("tool-1", create_test_event("ToolCreated", 1), EventStoreVersion::Any)
            .await
            .unwrap();
        store
            .append_event("repair-1", create_test_event("RepairOpened", 1), EventStoreVersion::Any)
            .await
            .unwrap();
        store
            .append_event("tool-2", create_test_event("ToolCreated", 2), EventStoreVersion::Any)
            .await
            .unwrap();

        let tools = store
            .read_global(GlobalQuery::from_start().stream_prefix("tool-"))
            .await
            .unwrap();
        assert_eq!(tools.events.len(), 2);
        assert_eq!(tools.next_token, EventStoreToken::from_id(3));

        let repairs = store
            .read_global(GlobalQuery::from_start().event_type("RepairOpened"))
            .await
            .unwrap();
        assert_eq!(repairs.events.len(), 1);
        assert_eq!(repairs.events[0].stream_name, "repair-1");
        assert!(!repairs.has_more);
    }

    #[tokio::test]
    async fn wait_for_global_wakes_on_matching_append() {
        let store = InMemoryEventStore::new();
        store
            .append_event("tool-1", create_test_event("Noise", 1), EventStoreVersion::Any)
            .await
            .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait_for_global(GlobalQuery::from_start().event_type("Signal"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .append_event("tool-2", create_test_event("Noise", 2), EventStoreVersion::Any)
            .await
            .unwrap();
        store
            .append_event("tool-3", create_test_event("Signal", 3), EventStoreVersion::Any)
            .await
            .unwrap();

        let slice = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .unwrap()
            .unwrap();
        assert_eq!(slice.events.len(), 1);
        assert_eq!(slice.events[0].token, EventStoreToken::from_id(3));
    }

    #[tokio::test]
    async fn cancelled_wait_does_not_block_appends() {
        let store = InMemoryEventStore::new();
        let wait = store.wait_for_global(GlobalQuery::from_start());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), wait).await;
        assert!(timed_out.is_err());

        store
            .append_event("tool-1", create_test_event("A", 1), EventStoreVersion::Any)
            .await
            .unwrap();
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn load_bodies_hydrates_headers() {
        let store = InMemoryEventStore::new();
        store
            .append_event("tool-1", create_test_event("A", 7), EventStoreVersion::Any)
            .await
            .unwrap();

        let mut slice = store
            .read_global(GlobalQuery::from_start().headers_only())
            .await
            .unwrap();
        assert!(!slice.events[0].has_body());

        store.load_bodies(&mut slice.events).await.unwrap();
        let body: serde_json::Value = slice.events[0].deserialize_body().unwrap();
        assert_eq!(body, serde_json::json!({"n": 7}));
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_stream_keep_versions_contiguous() {
        let store = InMemoryEventStore::new();
        let mut handles = Vec::new();
        for n in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_event("shared", create_test_event("Tick", n), EventStoreVersion::Any)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let slice = store.read_all("shared").await.unwrap();
        let versions: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.stream_version.as_i64())
            .collect();
        assert_eq!(versions, (1..=10).collect::<Vec<_>>());
        assert!(slice.events.windows(2).all(|w| w[0].token < w[1].token));
    }
}
