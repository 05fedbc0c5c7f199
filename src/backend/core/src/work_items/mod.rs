//! Work items and the record store contract consumed by the task watcher
//! and the status checker.

mod postgres;

pub use postgres::PostgresWorkItemStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{DocflowError, Result};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Received,
    Processing,
    AwaitingInput,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 5] = [
        Self::Received,
        Self::Processing,
        Self::AwaitingInput,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::AwaitingInput => "awaiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DocflowError::validation(format!("Unknown work item status: {}", s)))
    }
}

/// Pending automated action on a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTask {
    pub kind: String,
    pub retries: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl NextTask {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            retries: 0,
            last_retry_at: None,
        }
    }

    /// Whether the task may be attempted at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>, retry_interval_minutes: i32, max_retries: i32) -> bool {
        if self.retries >= max_retries {
            return false;
        }
        match self.last_retry_at {
            None => true,
            Some(last) => last < now - Duration::minutes(i64::from(retry_interval_minutes)),
        }
    }
}

/// A unit of business work owned by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub entity_id: String,
    pub status: WorkItemStatus,
    pub next_task: Option<NextTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A freshly received item with a pending next task.
    pub fn received(entity_id: impl Into<String>, task_kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            status: WorkItemStatus::Received,
            next_task: Some(NextTask::new(task_kind)),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Entity ranking consulted by record stores when picking the next item.
#[async_trait]
pub trait EntityRanking: Send + Sync {
    /// Considered entity ids, most important first.
    async fn ranked_ids(&self) -> Result<Vec<String>>;
}

/// Aggregate counts per tracked status.
pub type StatusCounts = BTreeMap<WorkItemStatus, i64>;

/// Record store for work items.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Next item whose task has `retries < max_retries` and whose last retry
    /// is absent or older than `retry_interval_minutes`. Items of ranked
    /// entities come first, in ranking order, then by age.
    async fn next_waiting_task(
        &self,
        retry_interval_minutes: i32,
        max_retries: i32,
    ) -> Result<Option<WorkItem>>;

    /// Retry bookkeeping: bump the retry counter and stamp the attempt time.
    async fn record_retry(&self, id: Uuid) -> Result<()>;

    /// Counts for each of `statuses`, zero when no item has the status.
    async fn count_by_status(&self, statuses: &[WorkItemStatus]) -> Result<StatusCounts>;

    async fn insert(&self, item: &WorkItem) -> Result<()>;
}

/// Position of `entity_id` in the ranking; unranked entities sort last.
pub(crate) fn rank_position(ranking: &[String], entity_id: &str) -> usize {
    ranking
        .iter()
        .position(|id| id == entity_id)
        .unwrap_or(usize::MAX)
}

/// In-memory work item store for tests and development.
pub struct InMemoryWorkItemStore {
    items: RwLock<HashMap<Uuid, WorkItem>>,
    ranking: Option<Arc<dyn EntityRanking>>,
}

impl InMemoryWorkItemStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            ranking: None,
        }
    }

    pub fn with_ranking(ranking: Arc<dyn EntityRanking>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            ranking: Some(ranking),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<WorkItem> {
        self.items.read().get(&id).cloned()
    }

    /// Overwrite an item, as external workflow steps do.
    pub fn put(&self, item: WorkItem) {
        self.items.write().insert(item.id, item);
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl Default for InMemoryWorkItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn next_waiting_task(
        &self,
        retry_interval_minutes: i32,
        max_retries: i32,
    ) -> Result<Option<WorkItem>> {
        let ranking = match &self.ranking {
            Some(ranking) => ranking.ranked_ids().await?,
            None => Vec::new(),
        };
        let now = Utc::now();

        let items = self.items.read();
        let next = items
            .values()
            .filter(|item| {
                item.next_task
                    .as_ref()
                    .is_some_and(|task| task.is_eligible(now, retry_interval_minutes, max_retries))
            })
            .min_by_key(|item| (rank_position(&ranking, &item.entity_id), item.created_at, item.id))
            .cloned();

        Ok(next)
    }

    async fn record_retry(&self, id: Uuid) -> Result<()> {
        let mut items = self.items.write();
        let item = items
            .get_mut(&id)
            .ok_or_else(|| DocflowError::not_found("work item", id.to_string()))?;
        let now = Utc::now();
        if let Some(task) = item.next_task.as_mut() {
            task.retries += 1;
            task.last_retry_at = Some(now);
        }
        item.updated_at = now;
        Ok(())
    }

    async fn count_by_status(&self, statuses: &[WorkItemStatus]) -> Result<StatusCounts> {
        let mut counts: StatusCounts = statuses.iter().map(|s| (*s, 0)).collect();
        for item in self.items.read().values() {
            if let Some(count) = counts.get_mut(&item.status) {
                *count += 1;
            }
        }
        Ok(counts)
    }

    async fn insert(&self, item: &WorkItem) -> Result<()> {
        let mut items = self.items.write();
        if items.contains_key(&item.id) {
            return Err(DocflowError::validation(format!(
                "Work item already exists: {}",
                item.id
            )));
        }
        items.insert(item.id, item.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRanking(Vec<String>);

    #[async_trait]
    impl EntityRanking for FixedRanking {
        async fn ranked_ids(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn item_at(entity: &str, created_at: DateTime<Utc>) -> WorkItem {
        let mut item = WorkItem::received(entity, "convert");
        item.created_at = created_at;
        item
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in WorkItemStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkItemStatus>().unwrap(), status);
        }
        assert!("archived".parse::<WorkItemStatus>().is_err());
    }

    #[test]
    fn test_next_task_eligibility() {
        let now = Utc::now();
        let mut task = NextTask::new("crop");
        assert!(task.is_eligible(now, 10, 5));

        task.retries = 1;
        task.last_retry_at = Some(now - Duration::minutes(3));
        assert!(!task.is_eligible(now, 10, 5));

        task.last_retry_at = Some(now - Duration::minutes(11));
        assert!(task.is_eligible(now, 10, 5));

        task.retries = 5;
        assert!(!task.is_eligible(now, 10, 5));
    }

    #[tokio::test]
    async fn test_oldest_eligible_item_first() {
        let store = InMemoryWorkItemStore::new();
        let now = Utc::now();
        let older = item_at("e1", now - Duration::minutes(5));
        let newer = item_at("e1", now);
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();

        let next = store.next_waiting_task(10, 5).await.unwrap().unwrap();
        assert_eq!(next.id, older.id);
    }

    #[tokio::test]
    async fn test_ranking_takes_precedence_over_age() {
        let ranking = Arc::new(FixedRanking(vec!["vip".to_string(), "e1".to_string()]));
        let store = InMemoryWorkItemStore::with_ranking(ranking);
        let now = Utc::now();
        let unranked = item_at("walk-in", now - Duration::minutes(30));
        let ranked_low = item_at("e1", now - Duration::minutes(20));
        let ranked_high = item_at("vip", now);
        for item in [&unranked, &ranked_low, &ranked_high] {
            store.insert(item).await.unwrap();
        }

        let next = store.next_waiting_task(10, 5).await.unwrap().unwrap();
        assert_eq!(next.id, ranked_high.id);
    }

    #[tokio::test]
    async fn test_record_retry_makes_item_wait() {
        let store = InMemoryWorkItemStore::new();
        let item = WorkItem::received("e1", "convert");
        store.insert(&item).await.unwrap();

        store.record_retry(item.id).await.unwrap();
        let stored = store.get(item.id).unwrap();
        let task = stored.next_task.unwrap();
        assert_eq!(task.retries, 1);
        assert!(task.last_retry_at.is_some());

        assert!(store.next_waiting_task(10, 5).await.unwrap().is_none());

        let mut backdated = store.get(item.id).unwrap();
        if let Some(task) = backdated.next_task.as_mut() {
            task.last_retry_at = Some(Utc::now() - Duration::minutes(11));
        }
        store.put(backdated);
        assert!(store.next_waiting_task(10, 5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_items_without_next_task_are_skipped() {
        let store = InMemoryWorkItemStore::new();
        let mut done = WorkItem::received("e1", "convert");
        done.next_task = None;
        done.status = WorkItemStatus::Completed;
        store.insert(&done).await.unwrap();

        assert!(store.next_waiting_task(10, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_by_status_reports_zeroes() {
        let store = InMemoryWorkItemStore::new();
        let mut failed = WorkItem::received("e1", "convert");
        failed.status = WorkItemStatus::Failed;
        store.insert(&failed).await.unwrap();
        store.insert(&WorkItem::received("e2", "convert")).await.unwrap();

        let counts = store
            .count_by_status(&[WorkItemStatus::Failed, WorkItemStatus::Completed])
            .await
            .unwrap();
        assert_eq!(counts[&WorkItemStatus::Failed], 1);
        assert_eq!(counts[&WorkItemStatus::Completed], 0);
        assert!(!counts.contains_key(&WorkItemStatus::Received));
    }

    #[tokio::test]
    async fn test_record_retry_unknown_item() {
        let store = InMemoryWorkItemStore::new();
        let err = store.record_retry(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RecordNotFound);
    }
}
