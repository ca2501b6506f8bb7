//! Read-ahead cache for tailing readers of the global log.
//!
//! A single actor task owns a sliding window of the most recent events and
//! an explicit queue of pending requests. Every request that arrives while
//! a load is in flight is answered from the same load, so N readers tailing
//! the log cost one storage query per refresh instead of N.
//!
//! The window is refreshed when the store signals a change and on a
//! periodic poll, since change notifications may be lost. Requests starting
//! before the window are answered straight from storage ("independent"
//! requests) so that slow readers never force the window to grow.
//!
//! A storage failure during refresh invalidates the window and fails every
//! request that depended on it; callers retry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::AbortOnDrop;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{EventStoreError, EventStoreToken, GlobalQuery, GlobalSlice, Result, StoredEvent};

/// Storage access needed by the cache.
#[async_trait]
pub trait EventLoader: Send + Sync + 'static {
    /// Loads up to `limit` events after `after`, bodies included, in token order.
    async fn load_after(&self, after: EventStoreToken, limit: usize) -> Result<Vec<StoredEvent>>;

    /// Answers a query directly from storage.
    async fn query(&self, query: GlobalQuery) -> Result<GlobalSlice>;

    /// Returns the newest token in storage.
    async fn head(&self) -> Result<EventStoreToken>;
}

struct CacheRequest {
    query: GlobalQuery,
    wait: bool,
    reply: oneshot::Sender<Result<GlobalSlice>>,
}

/// Handle to the cache actor. Clones share the same actor.
#[derive(Clone)]
pub struct ReadAheadCache {
    requests: mpsc::UnboundedSender<CacheRequest>,
    changed: Arc<Notify>,
    _task: Arc<AbortOnDrop>,
}

impl ReadAheadCache {
    /// Starts the cache actor. Must be called from within a Tokio runtime.
    pub fn spawn<L: EventLoader>(
        loader: Arc<L>,
        capacity: usize,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        let (requests, receiver) = mpsc::unbounded_channel();
        let changed = Arc::new(Notify::new());

        let state = CacheState {
            loader,
            capacity: capacity.max(1),
            batch_size: batch_size.max(1),
            window: VecDeque::new(),
            start: EventStoreToken::initial(),
            head: EventStoreToken::initial(),
            initialized: false,
            stale: false,
            pending: Vec::new(),
            waiting: Vec::new(),
            requeue: requests.downgrade(),
        };
        let task = tokio::spawn(state.run(receiver, changed.clone(), poll_interval));

        Self {
            requests,
            changed,
            _task: Arc::new(AbortOnDrop::new(task)),
        }
    }

    /// Answers a global read, from the window when possible.
    pub async fn read(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        self.submit(query, false).await
    }

    /// Answers a global read once at least one matching event exists.
    pub async fn wait(&self, query: GlobalQuery) -> Result<GlobalSlice> {
        self.submit(query, true).await
    }

    /// Marks the window stale; the next request or waiter triggers a refresh.
    pub fn notify_changed(&self) {
        self.changed.notify_one();
    }

    async fn submit(&self, query: GlobalQuery, wait: bool) -> Result<GlobalSlice> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(CacheRequest { query, wait, reply })
            .map_err(|_| EventStoreError::Storage("read-ahead cache stopped".to_string()))?;
        response
            .await
            .map_err(|_| EventStoreError::Storage("read-ahead cache dropped request".to_string()))?
    }
}

struct CacheState<L> {
    loader: Arc<L>,
    capacity: usize,
    batch_size: usize,
    /// Events with tokens in `(start, head]`, in token order.
    window: VecDeque<StoredEvent>,
    start: EventStoreToken,
    head: EventStoreToken,
    initialized: bool,
    stale: bool,
    /// Requests accepted since the last refresh.
    pending: Vec<CacheRequest>,
    /// Blocking requests with nothing to return yet.
    waiting: Vec<CacheRequest>,
    requeue: mpsc::WeakUnboundedSender<CacheRequest>,
}

impl<L: EventLoader> CacheState<L> {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<CacheRequest>,
        changed: Arc<Notify>,
        poll_interval: Duration,
    ) {
        let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.accept(request),
                    None => break,
                },
                _ = changed.notified() => self.stale = true,
                _ = poll.tick() => self.stale = true,
            }
            while let Ok(request) = requests.try_recv() {
                self.accept(request);
            }
            self.waiting.retain(|r| !r.reply.is_closed());

            let needs_answer = !self.pending.is_empty() || (self.stale && !self.waiting.is_empty());
            if !needs_answer {
                continue;
            }

            if !self.initialized || self.stale {
                match self.refresh().await {
                    Ok(caught_up) => {
                        self.stale = !caught_up;
                        if !caught_up {
                            // Come back for the rest without waiting for a notification.
                            changed.notify_one();
                        }
                    }
                    Err(e) => {
                        self.fail_all(e);
                        continue;
                    }
                }
            }
            self.serve();
        }
        tracing::debug!("read-ahead cache stopped");
    }

    fn accept(&mut self, request: CacheRequest) {
        if request.reply.is_closed() {
            return;
        }
        if self.initialized && request.query.token < self.start {
            self.spawn_independent(request);
        } else {
            self.pending.push(request);
        }
    }

    /// Loads new events into the window. Returns `false` when storage holds
    /// more than one refresh may take.
    async fn refresh(&mut self) -> Result<bool> {
        if !self.initialized {
            let Some(from) = self
                .pending
                .iter()
                .chain(self.waiting.iter())
                .map(|r| r.query.token)
                .min()
            else {
                return Ok(true);
            };
            // Start no further back than one window below the head.
            let head = self.loader.head().await?;
            let floor = EventStoreToken::from_id(head.id() - self.capacity as i64);
            self.start = from.max(floor);
            self.head = self.start;
            self.window.clear();
            self.initialized = true;
            tracing::debug!(start = %self.start, head = %head, "read-ahead window initialized");
        }

        let max_batches = self.capacity / self.batch_size + 1;
        for _ in 0..max_batches {
            let batch = self.loader.load_after(self.head, self.batch_size).await?;
            let loaded = batch.len();
            for event in batch {
                if event.token <= self.head {
                    return Err(EventStoreError::Invariant(format!(
                        "loaded token {} is not after cache head {}",
                        event.token, self.head
                    )));
                }
                self.head = event.token;
                self.window.push_back(event);
            }
            while self.window.len() > self.capacity {
                if let Some(evicted) = self.window.pop_front() {
                    self.start = evicted.token;
                }
            }
            if loaded < self.batch_size {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn serve(&mut self) {
        // The window head is not the storage head while behind.
        let behind = self.stale;
        let requests: Vec<CacheRequest> = self
            .pending
            .drain(..)
            .chain(self.waiting.drain(..))
            .collect();

        for mut request in requests {
            if request.reply.is_closed() {
                continue;
            }
            if request.query.token < self.start {
                self.spawn_independent(request);
                continue;
            }

            let from = self
                .window
                .partition_point(|e| e.token <= request.query.token);
            let mut slice = request
                .query
                .slice_from(self.window.range(from..), self.head);
            slice.has_more |= behind;

            if slice.events.is_empty() && request.wait {
                request.query.token = slice.next_token;
                self.waiting.push(request);
            } else {
                metrics::counter!("eventstore_cache_requests_total", "path" => "window")
                    .increment(1);
                let _ = request.reply.send(Ok(slice));
            }
        }
    }

    fn spawn_independent(&self, request: CacheRequest) {
        metrics::counter!("eventstore_cache_requests_total", "path" => "independent").increment(1);
        tracing::debug!(token = %request.query.token, start = %self.start, "token before window, querying storage");

        let loader = self.loader.clone();
        let requeue = self.requeue.clone();
        tokio::spawn(async move {
            let mut request = request;
            match loader.query(request.query.clone()).await {
                Ok(slice) if slice.events.is_empty() && request.wait => {
                    // Caught up to the head; continue waiting through the window.
                    request.query.token = slice.next_token;
                    if let Some(requests) = requeue.upgrade() {
                        let _ = requests.send(request);
                    }
                }
                result => {
                    let _ = request.reply.send(result);
                }
            }
        });
    }

    fn fail_all(&mut self, error: EventStoreError) {
        let message = error.to_string();
        tracing::warn!(error = %message, "read-ahead cache refresh failed, invalidating window");
        metrics::counter!("eventstore_cache_failures_total").increment(1);

        for request in self.pending.drain(..).chain(self.waiting.drain(..)) {
            let _ = request
                .reply
                .send(Err(EventStoreError::Storage(message.clone())));
        }
        self.window.clear();
        self.initialized = false;
        self.stale = false;
    }
}
