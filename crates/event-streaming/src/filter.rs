use serde::{Deserialize, Serialize};

/// Which events a streamer delivers.
///
/// An event matches when its type is in `event_types` and its stream name
/// starts with one of `stream_prefixes`. An empty list matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Vec<String>,
    pub stream_prefixes: Vec<String>,
}

impl EventFilter {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn stream_prefixes(mut self, prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stream_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// One `(prefix, type)` pair per sub-streamer; `None` means unfiltered.
    pub(crate) fn combinations(&self) -> Vec<(Option<String>, Option<String>)> {
        let prefixes: Vec<Option<String>> = if self.stream_prefixes.is_empty() {
            vec![None]
        } else {
            self.stream_prefixes.iter().cloned().map(Some).collect()
        };
        let types: Vec<Option<String>> = if self.event_types.is_empty() {
            vec![None]
        } else {
            self.event_types.iter().cloned().map(Some).collect()
        };

        let mut pairs = Vec::with_capacity(prefixes.len() * types.len());
        for prefix in &prefixes {
            for event_type in &types {
                let pair = (prefix.clone(), event_type.clone());
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        pairs
    }
}

/// How a streamer behaves once it has caught up with the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingMode {
    /// Wait for new events.
    #[default]
    Live,
    /// Report the end of data; used when rebuilding a projection.
    Rebuild,
}
