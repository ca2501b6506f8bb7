use crate::{EventStoreToken, StoredEvent, Version};

/// Default batch size for global reads.
pub const DEFAULT_MAX_COUNT: usize = 1000;

/// A read of the global log, starting after `token`.
///
/// Filters are optional: with no prefix and no type every event matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalQuery {
    /// Exclusive start position.
    pub token: EventStoreToken,

    /// Maximum number of events to return.
    pub max_count: usize,

    /// Only events whose stream name starts with this prefix.
    pub stream_prefix: Option<String>,

    /// Only events of this type.
    pub event_type: Option<String>,

    /// Whether to return bodies or headers only.
    pub load_body: bool,
}

impl GlobalQuery {
    /// Reads everything after `token`, bodies included.
    pub fn after(token: EventStoreToken) -> Self {
        Self {
            token,
            max_count: DEFAULT_MAX_COUNT,
            stream_prefix: None,
            event_type: None,
            load_body: true,
        }
    }

    /// Reads from the beginning of the log.
    pub fn from_start() -> Self {
        Self::after(EventStoreToken::initial())
    }

    /// Limits the number of events returned.
    pub fn max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    /// Filters by stream-name prefix.
    pub fn stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = Some(prefix.into());
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Returns headers without bodies.
    pub fn headers_only(mut self) -> Self {
        self.load_body = false;
        self
    }

    /// Returns whether `event` passes the prefix and type filters.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(ref prefix) = self.stream_prefix
            && !event.stream_name.starts_with(prefix.as_str())
        {
            return false;
        }
        if let Some(ref event_type) = self.event_type
            && &event.event_type != event_type
        {
            return false;
        }
        true
    }

    /// Builds the answer to this query from events in token order.
    ///
    /// `head` is the last position the caller has seen in the log; when
    /// fewer than `max_count` events match, the slice's `next_token` jumps
    /// to it so a filtered reader does not rescan the same range.
    pub(crate) fn slice_from<'a>(
        &self,
        events: impl IntoIterator<Item = &'a StoredEvent>,
        head: EventStoreToken,
    ) -> GlobalSlice {
        let mut selected = Vec::new();
        let mut has_more = false;

        for event in events {
            if event.token <= self.token || !self.matches(event) {
                continue;
            }
            if selected.len() >= self.max_count {
                has_more = true;
                break;
            }
            selected.push(if self.load_body {
                event.clone()
            } else {
                event.header()
            });
        }

        let next_token = if has_more {
            selected.last().map(|e| e.token).unwrap_or(self.token)
        } else {
            head.max(self.token)
        };

        GlobalSlice {
            events: selected,
            next_token,
            has_more,
        }
    }
}

impl Default for GlobalQuery {
    fn default() -> Self {
        Self::from_start()
    }
}

/// Result of a stream read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSlice {
    /// Events in version order.
    pub events: Vec<StoredEvent>,

    /// The stream's version at read time (0 if it does not exist).
    pub current_version: Version,
}

/// Result of a global read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSlice {
    /// Matching events in token order.
    pub events: Vec<StoredEvent>,

    /// Where the next read should start.
    pub next_token: EventStoreToken,

    /// Whether more matching events are known to follow.
    pub has_more: bool,
}

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// The stream's version after the append.
    pub version: Version,

    /// Tokens assigned to the appended events, in order.
    pub tokens: Vec<EventStoreToken>,
}
