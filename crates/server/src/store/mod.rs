//! Durable document records: PostgreSQL in deployment, in-memory for tests
//! and store-less development.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub content: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum StoreError {
    Query { source: sqlx::Error },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query { source } => write!(f, "document store query failed: {source}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Query { source } => Some(source),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    content: String,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for DocumentRecord {
    fn from(row: DocumentRow) -> Self {
        Self {
            content: row.content,
            version: row.version.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone, Debug)]
pub enum DocumentStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<Uuid, DocumentRecord>>>),
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Create the documents table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS documents (
                        id uuid PRIMARY KEY,
                        content text NOT NULL,
                        version bigint NOT NULL,
                        updated_at timestamptz NOT NULL
                    )
                    "#,
                )
                .execute(pool)
                .await
                .map_err(|source| StoreError::Query { source })?;
                Ok(())
            }
            Self::Memory(_) => Ok(()),
        }
    }

    pub async fn fetch(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, DocumentRow>(
                    "SELECT content, version, updated_at FROM documents WHERE id = $1",
                )
                .bind(doc_id)
                .fetch_optional(pool)
                .await
                .map_err(|source| StoreError::Query { source })?;

                Ok(row.map(DocumentRecord::from))
            }
            Self::Memory(docs) => Ok(docs.read().await.get(&doc_id).cloned()),
        }
    }

    /// Insert a new record at version 0 and return its generated id.
    pub async fn create(&self, content: String) -> Result<Uuid, StoreError> {
        let doc_id = Uuid::new_v4();
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO documents (id, content, version, updated_at) \
                     VALUES ($1, $2, 0, now())",
                )
                .bind(doc_id)
                .bind(&content)
                .execute(pool)
                .await
                .map_err(|source| StoreError::Query { source })?;
            }
            Self::Memory(docs) => {
                docs.write()
                    .await
                    .insert(doc_id, DocumentRecord { content, version: 0, updated_at: Utc::now() });
            }
        }
        Ok(doc_id)
    }

    pub async fn upsert(&self, doc_id: Uuid, content: &str, version: u64) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO documents (id, content, version, updated_at)
                    VALUES ($1, $2, $3, now())
                    ON CONFLICT (id) DO UPDATE SET
                        content = EXCLUDED.content,
                        version = EXCLUDED.version,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(doc_id)
                .bind(content)
                .bind(version as i64)
                .execute(pool)
                .await
                .map_err(|source| StoreError::Query { source })?;
            }
            Self::Memory(docs) => {
                docs.write().await.insert(
                    doc_id,
                    DocumentRecord {
                        content: content.to_string(),
                        version,
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }
}
