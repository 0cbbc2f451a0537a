//! Sync event notifications: a multi-listener registry keyed by stable name.

use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// Every sync operation ends with this, success paths only.
    FullSyncCompleted { items_involved: usize },
    /// A response touched at least the major-change threshold of items.
    MajorDataChange,
    /// Integrity discordance crossed the limit; recovery required.
    EnterOutOfSync,
    /// Out-of-sync recovery confirmed by a matching integrity check.
    ExitOutOfSync,
    /// Server 401; the loop stops until re-auth.
    InvalidSession,
    /// Transport/server failure for the round.
    SyncError { message: String },
    /// Local database load finished.
    DatabaseLoaded { payload_count: usize },
}

pub trait SyncEventSink: Send + Sync {
    fn handle_event(&self, event: &SyncEvent);
}

/// Listener registry. Registration under an existing name replaces it;
/// removal is by name.
pub struct EventRegistry {
    sinks: Mutex<Vec<(String, Arc<dyn SyncEventSink>)>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, name: &str, sink: Arc<dyn SyncEventSink>) {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain(|(n, _)| n != name);
        sinks.push((name.to_string(), sink));
    }

    pub fn remove(&self, name: &str) {
        self.sinks.lock().unwrap().retain(|(n, _)| n != name);
    }

    pub fn notify(&self, event: &SyncEvent) {
        tracing::debug!(?event, "sync event");
        let snapshot: Vec<Arc<dyn SyncEventSink>> = self
            .sinks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for sink in snapshot {
            sink.handle_event(event);
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects events in memory (tests and diagnostics).
pub struct CollectingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &SyncEvent) -> bool {
        self.events.lock().unwrap().contains(event)
    }

    pub fn count_of(&self, matcher: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matcher(e)).count()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEventSink for CollectingSink {
    fn handle_event(&self, event: &SyncEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_named_and_replaceable() {
        let registry = EventRegistry::new();
        let a = Arc::new(CollectingSink::new());
        let b = Arc::new(CollectingSink::new());
        registry.add("listener", a.clone());
        registry.add("listener", b.clone());

        registry.notify(&SyncEvent::MajorDataChange);
        assert!(a.events().is_empty());
        assert_eq!(b.events().len(), 1);

        registry.remove("listener");
        registry.notify(&SyncEvent::MajorDataChange);
        assert_eq!(b.events().len(), 1);
    }
}
