//! Handlers wiring the queue and the watcher to work items.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{DocflowError, Result};
use crate::jobs::TaskHandler;
use crate::queue::{MessageHandler, QueueConsumer, QueueId, QueueMessage};
use crate::work_items::{WorkItem, WorkItemStore};

/// Body of a work-creation event on the long-poll queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemCreated {
    pub entity_id: String,
    pub task_kind: String,
}

/// Creates a received work item for each work-creation event.
pub struct CreateWorkItemHandler {
    store: Arc<dyn WorkItemStore>,
}

impl CreateWorkItemHandler {
    pub fn new(store: Arc<dyn WorkItemStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for CreateWorkItemHandler {
    async fn handle(&self, message: &QueueMessage) -> Result<()> {
        let event: WorkItemCreated = serde_json::from_str(&message.body)?;
        if event.entity_id.trim().is_empty() || event.task_kind.trim().is_empty() {
            return Err(DocflowError::validation(
                "Work-creation event needs an entityId and a taskKind",
            ));
        }

        let item = WorkItem::received(event.entity_id, event.task_kind);
        self.store.insert(&item).await?;
        info!(
            work_item_id = %item.id,
            entity_id = %item.entity_id,
            message_id = %message.message_id,
            "Work item created"
        );
        Ok(())
    }
}

/// Next-task request sent to the workflow queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDispatch {
    pub work_item_id: Uuid,
    pub entity_id: String,
    pub task_kind: String,
    pub attempt: i32,
}

/// Forwards each picked work item's next task to a named queue.
pub struct QueueDispatchHandler {
    consumer: Arc<QueueConsumer>,
    queue: QueueId,
}

impl QueueDispatchHandler {
    pub fn new(consumer: Arc<QueueConsumer>, queue: QueueId) -> Self {
        Self { consumer, queue }
    }
}

#[async_trait]
impl TaskHandler for QueueDispatchHandler {
    async fn handle(&self, item: &WorkItem) -> Result<()> {
        let task = item.next_task.as_ref().ok_or_else(|| {
            DocflowError::handler_failed(format!("Work item {} has no pending task", item.id))
        })?;

        let dispatch = TaskDispatch {
            work_item_id: item.id,
            entity_id: item.entity_id.clone(),
            task_kind: task.kind.clone(),
            attempt: task.retries + 1,
        };
        let payload = serde_json::to_string(&dispatch)?;
        self.consumer.send(&payload, &self.queue).await?;
        Ok(())
    }
}
