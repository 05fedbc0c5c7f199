//! Entity priority registry.
//!
//! An ordered ranking of entity ids that biases which entity's work items
//! are picked first. The ranking is stored as a single configuration
//! document and replaced wholesale or edited entry by entry.

mod registry;
mod store;

pub use registry::{PriorityRegistry, PRIORITIES_DOCUMENT};
pub use store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// One ranked entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPriority {
    pub entity_id: String,
    pub priority: i64,
    pub consider: bool,
}

impl EntityPriority {
    pub fn new(entity_id: impl Into<String>, priority: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            priority,
            consider: true,
        }
    }

    pub fn ignored(mut self) -> Self {
        self.consider = false;
        self
    }
}

/// Derive a priority list from ids ordered most important first.
///
/// Returns `None` when `ids` is not an array. Non-string elements are
/// dropped and repeated ids keep their first position, so the result may be
/// shorter than the input. The first kept id gets the highest priority,
/// equal to the number of kept ids.
pub fn from_ordered_ids(ids: &Value) -> Option<Vec<EntityPriority>> {
    let array = ids.as_array()?;

    let mut seen = HashSet::new();
    let kept: Vec<&str> = array
        .iter()
        .filter_map(Value::as_str)
        .filter(|id| seen.insert(*id))
        .collect();

    let total = kept.len() as i64;
    Some(
        kept.into_iter()
            .enumerate()
            .map(|(index, id)| EntityPriority::new(id, total - index as i64))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_ordered_ids_assigns_decreasing_priorities() {
        let entries = from_ordered_ids(&json!(["a", "b", "c"])).unwrap();
        assert_eq!(
            entries,
            vec![
                EntityPriority::new("a", 3),
                EntityPriority::new("b", 2),
                EntityPriority::new("c", 1),
            ]
        );
        assert!(entries.iter().all(|e| e.consider));
    }

    #[test]
    fn test_from_ordered_ids_rejects_non_arrays() {
        assert!(from_ordered_ids(&Value::Null).is_none());
        assert!(from_ordered_ids(&json!("a,b")).is_none());
        assert!(from_ordered_ids(&json!({"ids": ["a"]})).is_none());
        assert!(from_ordered_ids(&json!(7)).is_none());
    }

    #[test]
    fn test_from_ordered_ids_drops_non_strings() {
        assert_eq!(from_ordered_ids(&json!([{"k": "v"}])).unwrap(), vec![]);

        let entries = from_ordered_ids(&json!([1, "x", null, "y", ["z"]])).unwrap();
        assert_eq!(
            entries,
            vec![EntityPriority::new("x", 2), EntityPriority::new("y", 1)]
        );
    }

    #[test]
    fn test_from_ordered_ids_keeps_first_duplicate() {
        let entries = from_ordered_ids(&json!(["a", "b", "a", "c"])).unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(entries[0].priority, 3);
    }

    #[test]
    fn test_from_ordered_ids_property_over_generated_inputs() {
        for size in 1..40 {
            let ids: Vec<String> = (0..size).map(|i| format!("entity-{}", i)).collect();
            let entries = from_ordered_ids(&json!(ids)).unwrap();

            assert_eq!(entries.len(), size);
            assert_eq!(entries[0].priority, size as i64);
            assert!(entries.windows(2).all(|w| w[0].priority > w[1].priority));
            assert!(entries.iter().all(|e| e.consider));
        }
    }

    #[test]
    fn test_entity_priority_serializes_camel_case() {
        let value = serde_json::to_value(EntityPriority::new("e1", 4).ignored()).unwrap();
        assert_eq!(value, json!({"entityId": "e1", "priority": 4, "consider": false}));
    }
}
