//! Storage for named JSON configuration documents.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::Result;

/// Key/value store of singleton JSON documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Value>>;

    /// Overwrite the document, creating it if needed.
    async fn save(&self, name: &str, document: &Value) -> Result<()>;

    /// Store `document` only when no document named `name` exists yet.
    async fn create_if_absent(&self, name: &str, document: &Value) -> Result<()>;
}

/// In-memory document store for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.documents.read().get(name).cloned())
    }

    async fn save(&self, name: &str, document: &Value) -> Result<()> {
        self.documents
            .write()
            .insert(name.to_string(), document.clone());
        Ok(())
    }

    async fn create_if_absent(&self, name: &str, document: &Value) -> Result<()> {
        self.documents
            .write()
            .entry(name.to_string())
            .or_insert_with(|| document.clone());
        Ok(())
    }
}

/// Document store over the `config_documents` table.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT document FROM config_documents WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(document,)| document))
    }

    async fn save(&self, name: &str, document: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config_documents (name, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
            SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_if_absent(&self, name: &str, document: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config_documents (name, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
