//! PostgreSQL-backed work item store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use super::{EntityRanking, NextTask, StatusCounts, WorkItem, WorkItemStatus, WorkItemStore};
use crate::error::{DocflowError, Result};

/// Work item store over the `work_items` table.
///
/// Selection reads the next eligible row without claiming it; two watchers
/// polling at the same moment can both receive the same item.
#[derive(Clone)]
pub struct PostgresWorkItemStore {
    pool: PgPool,
    ranking: Option<Arc<dyn EntityRanking>>,
}

impl PostgresWorkItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, ranking: None }
    }

    pub fn with_ranking(pool: PgPool, ranking: Arc<dyn EntityRanking>) -> Self {
        Self {
            pool,
            ranking: Some(ranking),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    entity_id: String,
    status: String,
    next_task_kind: Option<String>,
    next_task_retries: i32,
    next_task_last_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = DocflowError;

    fn try_from(row: WorkItemRow) -> Result<Self> {
        Ok(WorkItem {
            id: row.id,
            entity_id: row.entity_id,
            status: row.status.parse()?,
            next_task: row.next_task_kind.map(|kind| NextTask {
                kind,
                retries: row.next_task_retries,
                last_retry_at: row.next_task_last_retry_at,
            }),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl WorkItemStore for PostgresWorkItemStore {
    async fn next_waiting_task(
        &self,
        retry_interval_minutes: i32,
        max_retries: i32,
    ) -> Result<Option<WorkItem>> {
        let ranking = match &self.ranking {
            Some(ranking) => ranking.ranked_ids().await?,
            None => Vec::new(),
        };

        let row = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, entity_id, status, next_task_kind, next_task_retries,
                   next_task_last_retry_at, created_at, updated_at
            FROM work_items
            WHERE next_task_kind IS NOT NULL
              AND next_task_retries < $2
              AND (next_task_last_retry_at IS NULL
                   OR next_task_last_retry_at < NOW() - make_interval(mins => $1))
            ORDER BY COALESCE(array_position($3::text[], entity_id), 2147483647),
                     created_at
            LIMIT 1
            "#,
        )
        .bind(retry_interval_minutes)
        .bind(max_retries)
        .bind(&ranking)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItem::try_from).transpose()
    }

    async fn record_retry(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET next_task_retries = next_task_retries + 1,
                next_task_last_retry_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DocflowError::not_found("work item", id.to_string()));
        }
        Ok(())
    }

    async fn count_by_status(&self, statuses: &[WorkItemStatus]) -> Result<StatusCounts> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM work_items
            WHERE status = ANY($1)
            GROUP BY status
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: StatusCounts = statuses.iter().map(|s| (*s, 0)).collect();
        for (status, count) in rows {
            counts.insert(status.parse()?, count);
        }
        Ok(counts)
    }

    async fn insert(&self, item: &WorkItem) -> Result<()> {
        let (kind, retries, last_retry_at) = match &item.next_task {
            Some(task) => (Some(task.kind.as_str()), task.retries, task.last_retry_at),
            None => (None, 0, None),
        };

        sqlx::query(
            r#"
            INSERT INTO work_items (id, entity_id, status, next_task_kind, next_task_retries,
                                    next_task_last_retry_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(item.id)
        .bind(&item.entity_id)
        .bind(item.status.as_str())
        .bind(kind)
        .bind(retries)
        .bind(last_retry_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_without_task_maps_to_none() {
        let now = Utc::now();
        let row = WorkItemRow {
            id: Uuid::new_v4(),
            entity_id: "e1".to_string(),
            status: "completed".to_string(),
            next_task_kind: None,
            next_task_retries: 2,
            next_task_last_retry_at: Some(now),
            created_at: now,
            updated_at: now,
        };

        let item = WorkItem::try_from(row).unwrap();
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert!(item.next_task.is_none());
    }

    #[test]
    fn test_row_with_unknown_status_is_rejected() {
        let now = Utc::now();
        let row = WorkItemRow {
            id: Uuid::new_v4(),
            entity_id: "e1".to_string(),
            status: "archived".to_string(),
            next_task_kind: Some("crop".to_string()),
            next_task_retries: 0,
            next_task_last_retry_at: None,
            created_at: now,
            updated_at: now,
        };

        assert!(WorkItem::try_from(row).is_err());
    }
}
