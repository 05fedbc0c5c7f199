use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::{from_ordered_ids, DocumentStore, EntityPriority};
use crate::error::{DocflowError, Result};
use crate::work_items::EntityRanking;

/// Name of the singleton document holding the priority list.
pub const PRIORITIES_DOCUMENT: &str = "entity_priorities";

/// Ranked list of entities, persisted through a [`DocumentStore`].
///
/// Writes from one process are serialized; writes from different processes
/// are last-writer-wins.
pub struct PriorityRegistry {
    store: Arc<dyn DocumentStore>,
    write_lock: Mutex<()>,
    created: OnceCell<()>,
}

impl PriorityRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            created: OnceCell::new(),
        }
    }

    async fn load(&self) -> Result<Vec<EntityPriority>> {
        self.created
            .get_or_try_init(|| async {
                self.store
                    .create_if_absent(PRIORITIES_DOCUMENT, &Value::Array(Vec::new()))
                    .await
            })
            .await?;

        match self.store.load(PRIORITIES_DOCUMENT).await? {
            Some(document) => Ok(serde_json::from_value(document)?),
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self, entries: &[EntityPriority]) -> Result<()> {
        let document = serde_json::to_value(entries)?;
        self.store.save(PRIORITIES_DOCUMENT, &document).await
    }

    /// Full current list in stored order.
    pub async fn entries(&self) -> Result<Vec<EntityPriority>> {
        self.load().await
    }

    /// Replace the whole list.
    pub async fn set_all(&self, entries: Vec<EntityPriority>) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = entries.iter().find(|e| !seen.insert(e.entity_id.as_str())) {
            return Err(DocflowError::validation(format!(
                "Duplicate entity in priority list: {}",
                duplicate.entity_id
            )));
        }

        let _guard = self.write_lock.lock().await;
        self.persist(&entries).await?;
        info!(entities = entries.len(), "Priority list replaced");
        Ok(())
    }

    /// Replace the list from ids ordered most important first.
    pub async fn set_from_ordered_ids(&self, ids: &Value) -> Result<()> {
        let entries = from_ordered_ids(ids).ok_or_else(|| {
            DocflowError::validation("Priority ids must be an array of entity ids")
        })?;
        self.set_all(entries).await
    }

    /// Entity ids by descending priority. Equal priorities keep stored order.
    pub async fn ranked_ids(&self, ignore_consider: bool) -> Result<Vec<String>> {
        let mut entries: Vec<EntityPriority> = self
            .load()
            .await?
            .into_iter()
            .filter(|e| ignore_consider || e.consider)
            .collect();

        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(entries.into_iter().map(|e| e.entity_id).collect())
    }

    /// Append an entity with priority 0.
    pub async fn add(&self, entity_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;

        if entries.iter().any(|e| e.entity_id == entity_id) {
            return Err(DocflowError::duplicate_entity(entity_id));
        }

        entries.push(EntityPriority::new(entity_id, 0));
        self.persist(&entries).await?;
        debug!(entity_id, "Entity added to priority list");
        Ok(())
    }

    /// Set the consideration flag. Returns false when the entity is unknown.
    pub async fn set_consideration(&self, entity_id: &str, consider: bool) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;

        let Some(entry) = entries.iter_mut().find(|e| e.entity_id == entity_id) else {
            return Ok(false);
        };
        entry.consider = consider;

        self.persist(&entries).await?;
        debug!(entity_id, consider, "Entity consideration updated");
        Ok(true)
    }

    pub async fn reconsider(&self, entity_id: &str) -> Result<()> {
        self.set_consideration(entity_id, true).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityRanking for PriorityRegistry {
    async fn ranked_ids(&self) -> Result<Vec<String>> {
        PriorityRegistry::ranked_ids(self, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::priority::InMemoryDocumentStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> PriorityRegistry {
        PriorityRegistry::new(Arc::new(InMemoryDocumentStore::new()))
    }

    #[tokio::test]
    async fn test_list_is_created_lazily() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let registry = PriorityRegistry::new(store.clone());
        assert!(store.load(PRIORITIES_DOCUMENT).await.unwrap().is_none());

        assert!(registry.ranked_ids(false).await.unwrap().is_empty());
        assert_eq!(store.load(PRIORITIES_DOCUMENT).await.unwrap(), Some(json!([])));
    }

    /// Store counting lazy-creation calls.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryDocumentStore,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for CountingStore {
        async fn load(&self, name: &str) -> Result<Option<Value>> {
            self.inner.load(name).await
        }

        async fn save(&self, name: &str, document: &Value) -> Result<()> {
            self.inner.save(name, document).await
        }

        async fn create_if_absent(&self, name: &str, document: &Value) -> Result<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_if_absent(name, document).await
        }
    }

    #[tokio::test]
    async fn test_list_created_once_across_reads() {
        let store = Arc::new(CountingStore::default());
        let registry = PriorityRegistry::new(store.clone());

        for _ in 0..5 {
            registry.ranked_ids(false).await.unwrap();
        }
        registry.add("e1").await.unwrap();

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ranked_ids(false).await.unwrap(), vec!["e1"]);
    }

    #[tokio::test]
    async fn test_set_all_rejects_duplicates() {
        let registry = registry();
        let err = registry
            .set_all(vec![EntityPriority::new("a", 2), EntityPriority::new("a", 1)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(registry.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_from_ordered_ids_validates_shape() {
        let registry = registry();
        let err = registry.set_from_ordered_ids(&Value::Null).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        registry.set_from_ordered_ids(&json!(["x", "y"])).await.unwrap();
        assert_eq!(registry.ranked_ids(true).await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_stable_sort_for_equal_priorities() {
        let registry = registry();
        registry
            .set_all(vec![
                EntityPriority::new("first", 1),
                EntityPriority::new("top", 5),
                EntityPriority::new("second", 1),
                EntityPriority::new("third", 1),
            ])
            .await
            .unwrap();

        assert_eq!(
            registry.ranked_ids(false).await.unwrap(),
            vec!["top", "first", "second", "third"]
        );
    }
}
