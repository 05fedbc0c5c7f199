//! Time-bounded leases for fleet-wide mutual exclusion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{DocflowError, Result};

/// Durable lease rows. A lease is free once `locked_until <= now`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lease row, unlocked, if it does not exist.
    async fn ensure(&self, lease_id: &str) -> Result<()>;

    /// Take the lease for `duration` if it is free. The check and the
    /// advance of `locked_until` are one atomic step.
    async fn try_acquire(&self, lease_id: &str, duration: Duration) -> Result<bool>;
}

/// Lease store over the `leases` table.
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn ensure(&self, lease_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO leases (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_acquire(&self, lease_id: &str, duration: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET locked_until = NOW() + make_interval(secs => $2)
            WHERE id = $1 AND locked_until <= NOW()
            "#,
        )
        .bind(lease_id)
        .bind(duration.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Lease store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked_until(&self, lease_id: &str) -> Option<DateTime<Utc>> {
        self.leases.lock().get(lease_id).copied()
    }

    /// Make the lease free immediately, as if its window had lapsed.
    pub fn expire(&self, lease_id: &str) {
        if let Some(until) = self.leases.lock().get_mut(lease_id) {
            *until = DateTime::<Utc>::MIN_UTC;
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn ensure(&self, lease_id: &str) -> Result<()> {
        self.leases
            .lock()
            .entry(lease_id.to_string())
            .or_insert(DateTime::<Utc>::MIN_UTC);
        Ok(())
    }

    async fn try_acquire(&self, lease_id: &str, duration: Duration) -> Result<bool> {
        let window = chrono::Duration::from_std(duration)
            .map_err(|e| DocflowError::validation(format!("Invalid lease duration: {}", e)))?;

        let mut leases = self.leases.lock();
        let Some(locked_until) = leases.get_mut(lease_id) else {
            return Ok(false);
        };

        let now = Utc::now();
        if *locked_until > now {
            return Ok(false);
        }
        *locked_until = now + window;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expired() {
        let store = InMemoryLeaseStore::new();
        store.ensure("job").await.unwrap();

        assert!(store.try_acquire("job", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_acquire("job", Duration::from_secs(60)).await.unwrap());

        store.expire("job");
        assert!(store.try_acquire("job", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_lease_is_not_acquired() {
        let store = InMemoryLeaseStore::new();
        assert!(!store.try_acquire("missing", Duration::from_secs(1)).await.unwrap());
        assert!(store.locked_until("missing").is_none());
    }

    #[tokio::test]
    async fn test_ensure_does_not_reset_lock() {
        let store = InMemoryLeaseStore::new();
        store.ensure("job").await.unwrap();
        store.try_acquire("job", Duration::from_secs(60)).await.unwrap();
        let held = store.locked_until("job").unwrap();

        store.ensure("job").await.unwrap();
        assert_eq!(store.locked_until("job"), Some(held));
    }
}
