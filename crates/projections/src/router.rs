//! Table-driven event dispatch.

use std::collections::HashMap;

use event_store::StoredEvent;
use event_streaming::EventFilter;

use crate::Result;

/// Handler for one event type.
pub type Handler<T> = fn(&mut T, &StoredEvent) -> Result<()>;

/// Maps event types to handlers on a projection's state.
///
/// The registered types double as the projection's subscription: see
/// [`EventRouter::filter`].
pub struct EventRouter<T> {
    handlers: HashMap<String, Handler<T>>,
}

impl<T> EventRouter<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `event_type`, replacing any earlier one.
    pub fn on(mut self, event_type: impl Into<String>, handler: Handler<T>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// Applies `event` to `target`. Returns `false` if no handler is registered.
    pub fn dispatch(&self, target: &mut T, event: &StoredEvent) -> Result<bool> {
        match self.handlers.get(&event.event_type) {
            Some(handler) => handler(target, event).map(|()| true),
            None => Ok(false),
        }
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Filter selecting exactly the registered event types.
    pub fn filter(&self) -> EventFilter {
        EventFilter::all().event_types(self.event_types())
    }
}

impl<T> Default for EventRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventRouter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("event_types", &self.event_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use event_store::{EventStoreToken, Version};

    use super::*;
    use crate::ProjectionError;

    #[derive(Default)]
    struct Counts {
        added: u32,
        removed: u32,
    }

    fn event(event_type: &str) -> StoredEvent {
        StoredEvent {
            token: EventStoreToken::from_id(1),
            stream_name: "tool-1".to_string(),
            stream_version: Version::first(),
            event_type: event_type.to_string(),
            format: "json".to_string(),
            contents: Some("{}".to_string()),
        }
    }

    fn router() -> EventRouter<Counts> {
        EventRouter::new()
            .on("ToolAdded", |c: &mut Counts, _| {
                c.added += 1;
                Ok(())
            })
            .on("ToolRemoved", |c: &mut Counts, _| {
                c.removed += 1;
                Ok(())
            })
            .on("ToolBroken", |_: &mut Counts, e| {
                Err(ProjectionError::Projection(format!("cannot apply {}", e.event_type)))
            })
    }

    #[test]
    fn dispatches_by_event_type() {
        let router = router();
        let mut counts = Counts::default();

        assert!(router.dispatch(&mut counts, &event("ToolAdded")).unwrap());
        assert!(router.dispatch(&mut counts, &event("ToolAdded")).unwrap());
        assert!(router.dispatch(&mut counts, &event("ToolRemoved")).unwrap());
        assert!(!router.dispatch(&mut counts, &event("ToolPainted")).unwrap());
        assert_eq!((counts.added, counts.removed), (2, 1));

        assert!(router.dispatch(&mut counts, &event("ToolBroken")).is_err());
    }

    #[test]
    fn registered_types_feed_the_filter() {
        let router = router();
        assert_eq!(
            router.event_types(),
            vec!["ToolAdded", "ToolBroken", "ToolRemoved"]
        );
        assert_eq!(
            router.filter(),
            EventFilter::all().event_types(["ToolAdded", "ToolBroken", "ToolRemoved"])
        );
    }
}
