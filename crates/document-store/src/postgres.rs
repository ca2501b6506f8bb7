use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{AbortOnDrop, ListenEvent, spawn_listener};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    Document, DocumentBackend, DocumentFolder, DocumentStoreConfig, DocumentStoreError,
    DocumentStoreVersion, DocumentWatch, IndexEntry, NewerDocument, Result, WatchHub,
};

/// Notification channel carrying the saved document's key.
pub const NOTIFY_CHANNEL: &str = "documents";

fn row_to_document(row: PgRow) -> Result<Document> {
    Ok(Document {
        name: row.try_get("key")?,
        version: row.try_get::<i32, _>("version")?.into(),
        content: row.try_get("contents")?,
    })
}

/// PostgreSQL-backed document store implementation.
///
/// Saves to one key are serialized with a transaction-scoped advisory lock
/// on the key's hash. Watchers are woken by `NOTIFY` on
/// [`NOTIFY_CHANNEL`] and, as a fallback for lost notifications, by a poll
/// comparing the versions of watched keys.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    hub: WatchHub,
    _tasks: Arc<[AbortOnDrop; 2]>,
}

impl PostgresDocumentStore {
    /// Creates a store with default configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, DocumentStoreConfig::default())
    }

    /// Creates a store, starting its notification listener and poll task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(pool: PgPool, config: DocumentStoreConfig) -> Self {
        let hub = WatchHub::new();

        let notified = hub.clone();
        let listener = spawn_listener(
            pool.clone(),
            NOTIFY_CHANNEL,
            config.reconnect_delay,
            move |event| match event {
                ListenEvent::Notification(key) => notified.notify(key),
                ListenEvent::Gap => notified.notify_all(),
            },
        );
        let poller = tokio::spawn(poll_watched(
            pool.clone(),
            hub.clone(),
            config.poll_interval,
        ));

        Self {
            pool,
            hub,
            _tasks: Arc::new([AbortOnDrop::new(listener), AbortOnDrop::new(poller)]),
        }
    }

    /// Root folder backed by this store.
    pub fn folder(&self) -> DocumentFolder {
        DocumentFolder::root(Arc::new(self.clone()))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

/// Re-checks watched keys so watchers are woken even if a `NOTIFY` was lost.
async fn poll_watched(pool: PgPool, hub: WatchHub, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if pool.is_closed() {
            break;
        }
        let keys = hub.watched_keys();
        if keys.is_empty() {
            continue;
        }

        let rows = sqlx::query("SELECT key, version FROM documents WHERE key = ANY($1)")
            .bind(&keys)
            .fetch_all(&pool)
            .await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "document watch poll failed");
                continue;
            }
        };

        let mut versions = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            if let (Ok(key), Ok(version)) = (
                row.try_get::<String, _>("key"),
                row.try_get::<i32, _>("version"),
            ) {
                versions.insert(key, i64::from(version));
            }
        }
        for key in &keys {
            hub.observe_version(key, versions.get(key).copied().unwrap_or(0));
        }
    }
}

/// Converts a version for the `INTEGER` version column.
fn version_column(key: &str, version: i64) -> Result<i32> {
    i32::try_from(version).map_err(|_| DocumentStoreError::VersionOverflow {
        key: key.to_string(),
        version,
    })
}

#[async_trait]
impl DocumentBackend for PostgresDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT key, version, contents FROM documents WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_document).transpose()
    }

    async fn get_newer(&self, key: &str, known_version: i64) -> Result<NewerDocument> {
        let row = sqlx::query(
            "SELECT key, version, CASE WHEN version <> $2 THEN contents END AS contents \
             FROM documents WHERE key = $1",
        )
        .bind(key)
        .bind(known_version)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(NewerDocument::Missing);
        };
        let contents: Option<String> = row.try_get("contents")?;
        Ok(match contents {
            None => NewerDocument::Unchanged,
            Some(content) => NewerDocument::Found(Document {
                name: row.try_get("key")?,
                version: row.try_get::<i32, _>("version")?.into(),
                content,
            }),
        })
    }

    #[tracing::instrument(skip(self, content, index))]
    async fn save(
        &self,
        key: &str,
        content: &str,
        expected: DocumentStoreVersion,
        index: &[IndexEntry],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let current: Option<i32> =
            sqlx::query_scalar("SELECT version FROM documents WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.map(i64::from).unwrap_or(0);

        if !expected.matches(current) {
            metrics::counter!("documentstore_conflicts_total").increment(1);
            return Err(DocumentStoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected,
                actual: current,
            });
        }

        let version = current + 1;
        let column = version_column(key, version)?;
        sqlx::query(
            "INSERT INTO documents (key, version, contents) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET version = EXCLUDED.version, contents = EXCLUDED.contents",
        )
        .bind(key)
        .bind(column)
        .bind(content)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents_index WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let (names, values): (Vec<&str>, Vec<&str>) = index
            .iter()
            .flat_map(|entry| entry.values.iter().map(|v| (entry.name.as_str(), v.as_str())))
            .unzip();
        if !names.is_empty() {
            sqlx::query(
                "INSERT INTO documents_index (key, indexname, value) \
                 SELECT $1, n, v FROM UNNEST($2::text[], $3::text[]) AS t(n, v) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(key)
            .bind(&names)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::counter!("documentstore_saves_total").increment(1);
        self.hub.notify(key);
        Ok(version)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let keys: Vec<String> =
            sqlx::query_scalar("DELETE FROM documents WHERE starts_with(key, $1) RETURNING key")
                .bind(prefix)
                .fetch_all(&mut *tx)
                .await?;

        if !keys.is_empty() {
            sqlx::query("SELECT pg_notify($1, k) FROM UNNEST($2::text[]) AS k")
                .bind(NOTIFY_CHANNEL)
                .bind(&keys)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        for key in &keys {
            self.hub.notify(key);
        }
        Ok(keys.len() as u64)
    }

    async fn find(
        &self,
        prefix: &str,
        index: &str,
        start: &str,
        end: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT d.key, d.version, d.contents \
             FROM documents d JOIN documents_index i ON i.key = d.key \
             WHERE i.indexname = $2 AND i.value >= $3 AND i.value <= $4 \
               AND starts_with(d.key, $1) \
               AND strpos(substr(d.key, char_length($1) + 1), '/') = 0 \
             GROUP BY d.key, d.version, d.contents \
             ORDER BY MIN(i.value), d.key \
             OFFSET $5 LIMIT $6",
        )
        .bind(prefix)
        .bind(index)
        .bind(start)
        .bind(end)
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_document).collect()
    }

    fn watch(&self, key: &str) -> DocumentWatch {
        self.hub.subscribe(key)
    }
}
