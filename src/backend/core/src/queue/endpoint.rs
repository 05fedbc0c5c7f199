use dashmap::DashMap;

use super::{QueueEndpoint, QueueId};

/// Resolved endpoints keyed by queue identifier.
///
/// Shared between consumers of one process. `reset` forgets every entry, so
/// the next call re-reads configuration and re-creates on-demand queues.
#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: DashMap<QueueId, QueueEndpoint>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &QueueId) -> Option<QueueEndpoint> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, id: QueueId, endpoint: QueueEndpoint) {
        self.entries.insert(id, endpoint);
    }

    pub fn reset(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_forgets_entries() {
        let cache = EndpointCache::new();
        cache.insert(QueueId::LongPoll, QueueEndpoint::new("docflow-long-poll", "local"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&QueueId::LongPoll).is_some());

        cache.reset();
        assert!(cache.is_empty());
        assert!(cache.get(&QueueId::LongPoll).is_none());
    }
}
