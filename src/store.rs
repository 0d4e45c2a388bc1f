//! SQLite-backed vector store adapter.
//!
//! Persists chunk text, embedding vectors (little-endian f32 BLOBs), and
//! JSON metadata in a single table, and serves metadata-filtered similarity
//! search by brute-force scan. The distance metric is Euclidean; ranked
//! results carry a `1 / (1 + distance)` similarity score in `(0, 1]`.
//!
//! All writes for one `add` call happen in a single transaction, so a failed
//! ingest never leaves a partial document behind.

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{ChunkMetadata, DocumentSummary, ScoredChunk, StoredChunk};

/// Metadata filter for queries, lookups, and deletions.
///
/// Supports restricting to a single document or to any of several documents
/// (the "is one of" form used when a question is scoped to a document set).
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    document_ids: Option<Vec<String>>,
}

impl ChunkFilter {
    /// Match every chunk.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match chunks belonging to one document.
    pub fn document(id: impl Into<String>) -> Self {
        Self {
            document_ids: Some(vec![id.into()]),
        }
    }

    /// Match chunks belonging to any of the given documents.
    pub fn documents(ids: Vec<String>) -> Self {
        Self {
            document_ids: Some(ids),
        }
    }

    fn where_clause(&self) -> Option<String> {
        let ids = self.document_ids.as_ref()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        Some(format!("document_id IN ({})", placeholders))
    }

    fn bind_values(&self) -> &[String] {
        self.document_ids.as_deref().unwrap_or(&[])
    }
}

/// Handle to the chunk/vector table.
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch of chunks. IDs are generated when not supplied, and
    /// each metadata record is stamped with a timestamp if it lacks one.
    /// The whole batch is written in one transaction.
    pub async fn add(
        &self,
        texts: &[String],
        vectors: &[Vec<f32>],
        metadatas: Vec<ChunkMetadata>,
        ids: Option<Vec<String>>,
    ) -> Result<Vec<String>> {
        if texts.len() != vectors.len() || texts.len() != metadatas.len() {
            bail!(
                "Mismatched batch: {} texts, {} vectors, {} metadatas",
                texts.len(),
                vectors.len(),
                metadatas.len()
            );
        }

        let ids = match ids {
            Some(ids) => {
                if ids.len() != texts.len() {
                    bail!("Mismatched batch: {} texts, {} ids", texts.len(), ids.len());
                }
                ids
            }
            None => (0..texts.len())
                .map(|_| Uuid::new_v4().to_string())
                .collect(),
        };

        let now = chrono::Utc::now();
        let created_at = now.timestamp();

        let mut tx = self.pool.begin().await?;

        for (((id, text), vector), mut metadata) in
            ids.iter().zip(texts).zip(vectors).zip(metadatas)
        {
            if metadata.timestamp.is_none() {
                metadata.timestamp = Some(now.to_rfc3339());
            }
            let metadata_json = serde_json::to_string(&metadata)?;

            sqlx::query(
                "INSERT INTO rag_chunks (id, document_id, text, embedding, metadata_json, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&metadata.document_id)
            .bind(text)
            .bind(vec_to_blob(vector))
            .bind(&metadata_json)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(ids)
    }

    /// Rank stored chunks by Euclidean distance to `query_vector`, closest
    /// first, truncated to `top_k`. Search failures are an explicit error,
    /// never an empty result list.
    pub async fn query(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let mut sql =
            "SELECT id, text, embedding, metadata_json FROM rag_chunks".to_string();
        if let Some(clause) = filter.where_clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }

        let mut query = sqlx::query(&sql);
        for value in filter.bind_values() {
            query = query.bind(value);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("vector store query failed")?;

        let mut scored: Vec<ScoredChunk> = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let distance = euclidean_distance(query_vector, &vector);
            let metadata_json: String = row.get("metadata_json");
            let metadata: ChunkMetadata =
                serde_json::from_str(&metadata_json).context("corrupt chunk metadata")?;

            scored.push(ScoredChunk {
                id: row.get("id"),
                text: row.get("text"),
                metadata,
                distance,
                similarity: 1.0 / (1.0 + distance),
            });
        }

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);

        Ok(scored)
    }

    /// Fetch all chunks matching the filter, in insertion order.
    pub async fn get_by_filter(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>> {
        let mut sql = "SELECT id, text, metadata_json FROM rag_chunks".to_string();
        if let Some(clause) = filter.where_clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        sql.push_str(" ORDER BY rowid");

        let mut query = sqlx::query(&sql);
        for value in filter.bind_values() {
            query = query.bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.get("metadata_json");
            let metadata: ChunkMetadata =
                serde_json::from_str(&metadata_json).context("corrupt chunk metadata")?;
            chunks.push(StoredChunk {
                id: row.get("id"),
                text: row.get("text"),
                metadata,
            });
        }

        Ok(chunks)
    }

    /// Delete all chunks matching the filter, returning how many rows went.
    pub async fn delete_by_filter(&self, filter: &ChunkFilter) -> Result<u64> {
        let mut sql = "DELETE FROM rag_chunks".to_string();
        if let Some(clause) = filter.where_clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }

        let mut query = sqlx::query(&sql);
        for value in filter.bind_values() {
            query = query.bind(value);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Total number of stored chunks.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rag_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Unique documents with per-document chunk counts, derived from chunk
    /// metadata in insertion order.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query("SELECT metadata_json FROM rag_chunks ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        let mut order: Vec<String> = Vec::new();
        let mut summaries: std::collections::HashMap<String, DocumentSummary> =
            std::collections::HashMap::new();

        for row in rows {
            let metadata_json: String = row.get("metadata_json");
            let metadata: ChunkMetadata =
                serde_json::from_str(&metadata_json).context("corrupt chunk metadata")?;
            let doc_id = metadata.document_id.clone();

            match summaries.get_mut(&doc_id) {
                Some(summary) => summary.chunk_count += 1,
                None => {
                    order.push(doc_id.clone());
                    summaries.insert(
                        doc_id.clone(),
                        DocumentSummary {
                            document_id: doc_id,
                            filename: metadata.filename,
                            upload_date: metadata.timestamp.unwrap_or_default(),
                            file_size: metadata.file_size,
                            page_count: metadata.page_count,
                            chunk_count: 1,
                            status: "completed".to_string(),
                        },
                    );
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| summaries.remove(&id))
            .collect())
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return f64::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
