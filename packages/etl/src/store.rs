//! Document storage.
//!
//! A document and its chunks are persisted atomically: the upsert either
//! lands the document row plus every chunk with its embedding, or nothing.
//! [`PostgresDocumentStore`] keeps embeddings in pgvector columns; the
//! schema is created on construction so the store is usable against a
//! fresh database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;

/// Metadata describing the document being upserted.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    /// Canonical source URL; the upsert key
    pub source_url: String,
    /// Content type reported at fetch time
    pub content_type: Option<String>,
}

/// A stored document row.
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub source_url: String,
    pub content_type: Option<String>,
    pub content_hash: String,
    pub chunk_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pluggable document persistence.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a document and all of its chunks atomically.
    ///
    /// `chunks` and `vectors` must be the same length; `vectors[i]` is the
    /// embedding of `chunks[i]`. Re-upserting the same `source_url`
    /// replaces the previous chunk set and keeps the document id stable.
    async fn upsert_document(
        &self,
        meta: &DocumentMeta,
        chunks: &[String],
        vectors: &[Vec<f32>],
    ) -> Result<Uuid, StoreError>;
}

/// PostgreSQL-backed document store using pgvector.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    dimension: usize,
}

impl PostgresDocumentStore {
    /// Connect to the given database URL and prepare the schema.
    pub async fn new(database_url: &str, dimension: usize) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::from_pool(pool, dimension).await
    }

    /// Create from an existing connection pool and prepare the schema.
    ///
    /// Use this when the application already has a pool so the store does
    /// not open duplicate connections.
    pub async fn from_pool(pool: PgPool, dimension: usize) -> Result<Self, StoreError> {
        let store = Self { pool, dimension };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Vector dimension this store was created with.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id UUID PRIMARY KEY,
                source_url TEXT NOT NULL UNIQUE,
                content_type TEXT,
                content_hash TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS document_chunks (
                id UUID PRIMARY KEY,
                document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding vector({}),
                UNIQUE (document_id, seq)
            )
            "#,
            self.dimension
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_document_chunks_document_id \
             ON document_chunks (document_id)",
        )
        .execute(&self.pool)
        .await?;

        info!(dimension = self.dimension, "document store ready");
        Ok(())
    }

    /// Look up a document by its source URL.
    pub async fn find_by_url(&self, source_url: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, source_url, content_type, content_hash, chunk_count, created_at, updated_at \
             FROM documents WHERE source_url = $1",
        )
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Number of chunk rows stored for a document.
    pub async fn chunk_count(&self, document_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = $1")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn upsert_document(
        &self,
        meta: &DocumentMeta,
        chunks: &[String],
        vectors: &[Vec<f32>],
    ) -> Result<Uuid, StoreError> {
        if chunks.len() != vectors.len() {
            return Err(StoreError::Mismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        for vector in vectors {
            if vector.len() != self.dimension {
                return Err(StoreError::Dimension {
                    expected: self.dimension,
                    got: vector.len(),
                });
            }
        }

        let content_hash = hash_chunks(chunks);

        let mut tx = self.pool.begin().await?;

        let document_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO documents (id, source_url, content_type, content_hash, chunk_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_url) DO UPDATE SET
                content_type = EXCLUDED.content_type,
                content_hash = EXCLUDED.content_hash,
                chunk_count = EXCLUDED.chunk_count,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&meta.source_url)
        .bind(&meta.content_type)
        .bind(&content_hash)
        .bind(chunks.len() as i32)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (seq, (content, vector)) in chunks.iter().zip(vectors.iter()).enumerate() {
            sqlx::query(
                "INSERT INTO document_chunks (id, document_id, seq, content, embedding) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind(document_id)
            .bind(seq as i32)
            .bind(content)
            .bind(Vector::from(vector.clone()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            document_id = %document_id,
            source_url = %meta.source_url,
            chunks = chunks.len(),
            "document upserted"
        );

        Ok(document_id)
    }
}

fn hash_chunks(chunks: &[String]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
