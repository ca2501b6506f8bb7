use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AbortOnDrop, ListenEvent, spawn_listener};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    AppendResult, EventStoreConfig, EventStoreError, EventStoreToken, EventStoreVersion,
    GlobalQuery, GlobalSlice, NewEvent, Result, StoredEvent, StreamSlice, Version,
    cache::{EventLoader, ReadAheadCache},
    store::{EventStore, validate_append},
};

/// Notification channel carrying the last appended id.
pub const NOTIFY_CHANNEL: &str = "eventstore";

const SELECT_EVENT: &str = "SELECT id, streamname, version, eventtype, format, \
     CASE WHEN $1 THEN contents END AS contents FROM eventstore_events";

fn limit_of(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Converts a version for the `INTEGER` version column.
fn version_column(stream: &str, version: Version) -> Result<i32> {
    i32::try_from(version.as_i64()).map_err(|_| EventStoreError::VersionOverflow {
        stream: stream.to_string(),
        version,
    })
}

fn row_to_event(row: PgRow) -> Result<StoredEvent> {
    Ok(StoredEvent {
        token: EventStoreToken::from_id(row.try_get("id")?),
        stream_name: row.try_get("streamname")?,
        stream_version: Version::new(row.try_get::<i32, _>("version")?.into()),
        event_type: row.try_get("eventtype")?,
        format: row.try_get("format")?,
        contents: row.try_get("contents")?,
    })
}

/// Direct, uncached access to the event tables.
struct PostgresLoader {
    pool: PgPool,
}

impl PostgresLoader {
    async fn fetch_head(&self) -> Result<EventStoreToken> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM eventstore_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(EventStoreToken::from_id(id))
    }

    async fn fetch_global(&self, query: &GlobalQuery) -> Result<GlobalSlice> {
        // Bound the scan by the head read first so next_token never skips rows.
        let head = self.fetch_head().await?;
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} \
             WHERE id > $2 AND id <= $3 \
               AND ($4::text IS NULL OR starts_with(streamname, $4)) \
               AND ($5::text IS NULL OR eventtype = $5) \
             ORDER BY id LIMIT $6"
        ))
        .bind(query.load_body)
        .bind(query.token.id())
        .bind(head.id())
        .bind(query.stream_prefix.as_deref())
        .bind(query.event_type.as_deref())
        .bind(limit_of(query.max_count).saturating_add(1))
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>>>()?;
        Ok(query.slice_from(&events, head))
    }
}

#[async_trait]
impl EventLoader for PostgresLoader {
    async fn load_after(&self, after: EventStoreToken, limit: usize) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!("{SELECT_EVENT} WHERE id > $2 ORDER BY id LIMIT $3"))
            .bind(true)
            .bind(after.id())
            .bind(limit_of(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    async fn query(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        self.fetch_global(&query).await
    }

    async fn head(&self) -> Result<EventStoreToken> {
        self.fetch_head().await
    }
}

/// PostgreSQL-backed event store implementation.
///
/// Appends to one stream are serialized by a row lock on the stream's
/// version row; appends to different streams run concurrently. Every
/// commit publishes a `NOTIFY` on [`NOTIFY_CHANNEL`] so that waiting
/// readers in any process wake up.
///
/// With the read-ahead cache enabled, global reads from tailing readers
/// are served from memory; see [`ReadAheadCache`].
#[derive(Clone)]
pub struct PostgresEventStore {
    loader: Arc<PostgresLoader>,
    cache: Option<ReadAheadCache>,
    config: EventStoreConfig,
    _listener: Option<Arc<AbortOnDrop>>,
}

impl PostgresEventStore {
    /// Creates a store without the read-ahead cache.
    ///
    /// Waiting reads poll storage every `poll_interval`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            loader: Arc::new(PostgresLoader { pool }),
            cache: None,
            config: EventStoreConfig {
                cache_size: 0,
                ..EventStoreConfig::default()
            },
            _listener: None,
        }
    }

    /// Creates a store with the given tuning, starting the read-ahead cache
    /// and its notification listener when the cache is enabled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(pool: PgPool, config: EventStoreConfig) -> Self {
        let loader = Arc::new(PostgresLoader { pool: pool.clone() });
        if !config.cache_enabled() {
            return Self {
                loader,
                cache: None,
                config,
                _listener: None,
            };
        }

        let cache = ReadAheadCache::spawn(
            loader.clone(),
            config.cache_size,
            config.batch_size,
            config.poll_interval,
        );
        let notified = cache.clone();
        let listener = spawn_listener(
            pool,
            NOTIFY_CHANNEL,
            config.reconnect_delay,
            move |event| {
                if let ListenEvent::Gap = event {
                    tracing::debug!("event notifications interrupted, refreshing cache");
                }
                notified.notify_changed();
            },
        );

        Self {
            loader,
            cache: Some(cache),
            config,
            _listener: Some(Arc::new(AbortOnDrop::new(listener))),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.loader.pool
    }

    /// Returns the configuration in effect.
    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(self.pool()).await
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append_to_stream(
        &self,
        stream: &str,
        events: Vec<NewEvent>,
        expected: EventStoreVersion,
    ) -> Result<AppendResult> {
        validate_append(stream, &events)?;

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO eventstore_streams (streamname, version) VALUES ($1, 0) \
             ON CONFLICT (streamname) DO NOTHING",
        )
        .bind(stream)
        .execute(&mut *tx)
        .await?;

        let current: i32 = sqlx::query_scalar(
            "SELECT version FROM eventstore_streams WHERE streamname = $1 FOR UPDATE",
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await?;
        let current = Version::new(current.into());

        if !expected.matches(current) {
            metrics::counter!("eventstore_concurrency_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }

        if current == Version::initial() {
            let orphaned: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM eventstore_events WHERE streamname = $1)",
            )
            .bind(stream)
            .fetch_one(&mut *tx)
            .await?;
            if orphaned {
                return Err(EventStoreError::Invariant(format!(
                    "stream {stream} has events but its version row is 0"
                )));
            }
        }

        let mut version = current;
        let mut tokens = Vec::with_capacity(events.len());
        for event in &events {
            version = version.next();
            let column = version_column(stream, version)?;
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO eventstore_events (streamname, version, eventtype, format, contents) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(stream)
            .bind(column)
            .bind(&event.event_type)
            .bind(&event.format)
            .bind(&event.contents)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("eventstore_events_stream_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        stream: stream.to_string(),
                        expected,
                        actual: version,
                    };
                }
                EventStoreError::Database(e)
            })?;
            tokens.push(EventStoreToken::from_id(id));
        }

        sqlx::query("UPDATE eventstore_streams SET version = $2 WHERE streamname = $1")
            .bind(stream)
            .bind(version_column(stream, version)?)
            .execute(&mut *tx)
            .await?;

        if let Some(last) = tokens.last() {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(NOTIFY_CHANNEL)
                .bind(last.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if let Some(cache) = &self.cache {
            cache.notify_changed();
        }
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
        let current: Option<i32> =
            sqlx::query_scalar("SELECT version FROM eventstore_streams WHERE streamname = $1")
                .bind(stream)
                .fetch_optional(self.pool())
                .await?;
        let current_version = Version::new(current.map(i64::from).unwrap_or(0));

        if max_count == 0 || current_version == Version::initial() {
            return Ok(StreamSlice {
                events: Vec::new(),
                current_version,
            });
        }

        // Bounded by the version read above so the slice and version agree.
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE streamname = $2 AND version >= $3 AND version <= $4 \
             ORDER BY version LIMIT $5"
        ))
        .bind(load_body)
        .bind(stream)
        .bind(i32::try_from(min_version.as_i64().max(1)).unwrap_or(i32::MAX))
        .bind(version_column(stream, current_version)?)
        .bind(limit_of(max_count))
        .fetch_all(self.pool())
        .await?;

        Ok(StreamSlice {
            events: rows
                .into_iter()
                .map(row_to_event)
                .collect::<Result<Vec<_>>>()?,
            current_version,
        })
    }

    async fn read_global(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        match &self.cache {
            Some(cache) => cache.read(query).await,
            None => self.loader.fetch_global(&query).await,
        }
    }

    async fn wait_for_global(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        if let Some(cache) = &self.cache {
            return cache.wait(query).await;
        }

        let mut query = query;
        loop {
            let slice = self.loader.fetch_global(&query).await?;
            if !slice.events.is_empty() {
                return Ok(slice);
            }
            query.token = slice.next_token;
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn load_bodies(&self, events: &mut [StoredEvent]) -> Result<()> {
        let ids: Vec<i64> = events
            .iter()
            .filter(|e| !e.has_body())
            .map(|e| e.token.id())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let rows = sqlx::query("SELECT id, contents FROM eventstore_events WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(self.pool())
            .await?;
        let mut bodies = HashMap::with_capacity(rows.len());
        for row in rows {
            bodies.insert(row.try_get::<i64, _>("id")?, row.try_get::<String, _>("contents")?);
        }

        for event in events.iter_mut().filter(|e| !e.has_body()) {
            let body = bodies.get(&event.token.id()).ok_or_else(|| {
                EventStoreError::Invariant(format!("event {} does not exist", event.token))
            })?;
            event.contents = Some(body.clone());
        }
        Ok(())
    }

    async fn head_token(&self) -> Result<EventStoreToken> {
        self.loader.fetch_head().await
    }
}
