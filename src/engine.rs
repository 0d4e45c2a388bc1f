//! RAG engine: wires extraction, chunking, embedding, the vector store, and
//! the LLM client into the ingest and answer pipelines, and keeps
//! per-conversation message history in memory.
//!
//! Ingest: hash → duplicate scan → extract → clean → chunk → embed (one
//! batch) → store (one transaction). Answer: embed question → similarity
//! query → context assembly → LLM → source citations → history update.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::embedding::EmbeddingService;
use crate::extract::{clean_text, extract_pdf};
use crate::llm::LlmClient;
use crate::models::{
    Answer, ChatMessage, ChunkMetadata, DeleteOutcome, DocumentSummary, EngineStats,
    HealthComponents, HealthReport, IngestOutcome, IngestStatus, ScoredChunk, SourceReference,
};
use crate::observability::round_to;
use crate::store::{ChunkFilter, VectorStore};

/// Fixed answer returned when retrieval comes back empty. No LLM call is
/// made and no request row is logged on this path.
const NO_CONTEXT_ANSWER: &str =
    "I couldn't find any relevant information in the uploaded documents to answer this question.";

/// Conversation history cap: 10 exchanges, oldest dropped first.
const MAX_HISTORY_MESSAGES: usize = 20;

/// How many characters of a chunk survive into a source citation.
const SOURCE_PREVIEW_CHARS: usize = 200;

struct DuplicateMatch {
    document_id: String,
    filename: String,
    match_type: &'static str,
}

/// The orchestrator. Construct once at startup and share via `Arc`.
pub struct RagEngine {
    embedder: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
    llm: Arc<LlmClient>,
    chunk_size: usize,
    chunk_overlap: usize,
    top_k: usize,
    conversations: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl RagEngine {
    pub fn new(
        embedder: Arc<EmbeddingService>,
        store: Arc<VectorStore>,
        llm: Arc<LlmClient>,
        chunk_size: usize,
        chunk_overlap: usize,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            llm,
            chunk_size,
            chunk_overlap,
            top_k,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full ingest pipeline over one uploaded file. Failures after
    /// the duplicate check come back as a `failed` outcome rather than an
    /// error; the atomic store write guarantees no partial document is left
    /// indexed.
    pub async fn process_document(
        &self,
        bytes: &[u8],
        filename: &str,
        file_size: u64,
    ) -> IngestOutcome {
        let started = Instant::now();
        tracing::info!(filename, file_size, "processing document");

        let content_hash = format!("{:x}", Sha256::digest(bytes));

        match self.check_duplicate(&content_hash, filename).await {
            Ok(Some(existing)) => {
                tracing::warn!(
                    filename,
                    matched = %existing.filename,
                    match_type = existing.match_type,
                    "duplicate document detected"
                );
                return IngestOutcome {
                    document_id: None,
                    filename: filename.to_string(),
                    status: IngestStatus::Duplicate,
                    page_count: None,
                    chunk_count: None,
                    content_hash: Some(content_hash),
                    processing_time: None,
                    message: format!("Document already exists as '{}'", existing.filename),
                    error: Some(format!(
                        "Duplicate detected. This file matches existing document: {}",
                        existing.filename
                    )),
                    existing_document_id: Some(existing.document_id),
                    match_type: Some(existing.match_type.to_string()),
                };
            }
            Ok(None) => {}
            Err(e) => {
                // A failed duplicate scan does not block ingest.
                tracing::warn!(error = %e, "duplicate check failed, continuing");
            }
        }

        let document_id = format!("doc_{}", short_id());

        match self
            .ingest(bytes, filename, file_size, &document_id, &content_hash)
            .await
        {
            Ok((page_count, chunk_count)) => {
                let processing_time = round_to(started.elapsed().as_secs_f64(), 2);
                tracing::info!(
                    document_id = %document_id,
                    chunk_count,
                    processing_time,
                    "document processed"
                );
                IngestOutcome {
                    document_id: Some(document_id),
                    filename: filename.to_string(),
                    status: IngestStatus::Completed,
                    page_count: Some(page_count),
                    chunk_count: Some(chunk_count),
                    content_hash: Some(content_hash),
                    processing_time: Some(processing_time),
                    message: format!("Successfully processed {}", filename),
                    error: None,
                    existing_document_id: None,
                    match_type: None,
                }
            }
            Err(e) => {
                tracing::error!(filename, error = %e, "document processing failed");
                IngestOutcome {
                    document_id: None,
                    filename: filename.to_string(),
                    status: IngestStatus::Failed,
                    page_count: None,
                    chunk_count: None,
                    content_hash: None,
                    processing_time: None,
                    message: format!("Failed to process {}", filename),
                    error: Some(e.to_string()),
                    existing_document_id: None,
                    match_type: None,
                }
            }
        }
    }

    async fn ingest(
        &self,
        bytes: &[u8],
        filename: &str,
        file_size: u64,
        document_id: &str,
        content_hash: &str,
    ) -> Result<(i64, i64)> {
        let extraction = extract_pdf(bytes).map_err(anyhow::Error::from)?;
        let cleaned = clean_text(&extraction.text);
        let chunks = chunk_text(
            &cleaned,
            &extraction.page_texts,
            self.chunk_size,
            self.chunk_overlap,
        );

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let now = chrono::Utc::now().to_rfc3339();
        let metadatas: Vec<ChunkMetadata> = chunks
            .iter()
            .map(|chunk| ChunkMetadata {
                document_id: document_id.to_string(),
                filename: filename.to_string(),
                chunk_index: chunk.index,
                page_number: chunk.page_number,
                file_size: file_size as i64,
                page_count: extraction.page_count as i64,
                chunk_length: chunk.text.chars().count() as i64,
                content_hash: content_hash.to_string(),
                timestamp: Some(now.clone()),
            })
            .collect();

        self.store.add(&texts, &embeddings, metadatas, None).await?;

        Ok((extraction.page_count as i64, chunks.len() as i64))
    }

    /// Scan existing documents for a filename or content-hash match. For
    /// each document the filename is checked first, so a filename match wins
    /// when both would apply.
    async fn check_duplicate(
        &self,
        content_hash: &str,
        filename: &str,
    ) -> Result<Option<DuplicateMatch>> {
        let documents = self.store.list_documents().await?;

        for doc in documents {
            if doc.filename == filename {
                return Ok(Some(DuplicateMatch {
                    document_id: doc.document_id,
                    filename: doc.filename,
                    match_type: "filename",
                }));
            }

            let chunks = self
                .store
                .get_by_filter(&ChunkFilter::document(&doc.document_id))
                .await?;
            if chunks
                .iter()
                .any(|c| c.metadata.content_hash == content_hash)
            {
                return Ok(Some(DuplicateMatch {
                    document_id: doc.document_id,
                    filename: doc.filename,
                    match_type: "content_hash",
                }));
            }
        }

        Ok(None)
    }

    /// Answer a question over the indexed corpus, optionally restricted to a
    /// set of documents and threaded through a conversation.
    pub async fn answer_question(
        &self,
        question: &str,
        document_ids: Option<Vec<String>>,
        conversation_id: Option<String>,
    ) -> Result<Answer> {
        let started = Instant::now();

        let conversation_id =
            conversation_id.unwrap_or_else(|| format!("conv_{}", short_id()));

        let query_embedding = self.embedder.embed(question).await?;

        let filter = match &document_ids {
            Some(ids) if !ids.is_empty() => ChunkFilter::documents(ids.clone()),
            _ => ChunkFilter::any(),
        };
        let retrieved = self
            .store
            .query(&query_embedding, self.top_k, &filter)
            .await?;

        if retrieved.is_empty() {
            return Ok(Answer {
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                conversation_id,
                processing_time: round_to(started.elapsed().as_secs_f64(), 2),
                model_used: self.llm.model_name().to_string(),
                chunks_used: 0,
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                estimated_cost_usd: None,
                llm_latency_ms: None,
                prompt_template_key: None,
                prompt_template_version: None,
            });
        }

        let context = build_context(&retrieved);
        let history = self.conversation_history(&conversation_id).await;

        let request_metadata = serde_json::json!({
            "document_ids": document_ids.clone().unwrap_or_default(),
            "chunks_retrieved": retrieved.len(),
        });

        let generated = self
            .llm
            .generate_answer(
                question,
                &context,
                &history,
                Some(&conversation_id),
                request_metadata,
            )
            .await?;

        let sources = format_sources(&retrieved);
        self.record_exchange(&conversation_id, question, &generated.answer)
            .await;

        Ok(Answer {
            answer: generated.answer,
            sources,
            conversation_id,
            processing_time: round_to(started.elapsed().as_secs_f64(), 2),
            model_used: self.llm.model_name().to_string(),
            chunks_used: retrieved.len(),
            prompt_tokens: Some(generated.prompt_tokens),
            completion_tokens: Some(generated.completion_tokens),
            total_tokens: Some(generated.total_tokens),
            estimated_cost_usd: Some(generated.cost_usd),
            llm_latency_ms: Some(generated.latency_ms),
            prompt_template_key: Some(generated.prompt_template_key),
            prompt_template_version: Some(generated.prompt_template_version),
        })
    }

    /// Delete a document and all of its chunks.
    pub async fn delete_document(&self, document_id: &str) -> Result<DeleteOutcome> {
        let chunks_deleted = self
            .store
            .delete_by_filter(&ChunkFilter::document(document_id))
            .await?;

        if chunks_deleted == 0 {
            return Ok(DeleteOutcome {
                document_id: document_id.to_string(),
                chunks_deleted: 0,
                success: false,
                message: format!("Document {} not found", document_id),
                error: Some(format!("Document {} not found", document_id)),
            });
        }

        tracing::info!(document_id, chunks_deleted, "document deleted");

        Ok(DeleteOutcome {
            document_id: document_id.to_string(),
            chunks_deleted,
            success: true,
            message: format!(
                "Deleted document {} ({} chunks)",
                document_id, chunks_deleted
            ),
            error: None,
        })
    }

    /// Per-document summaries with chunk counts.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        self.store.list_documents().await
    }

    /// Snapshot of one conversation's history (empty if unknown).
    pub async fn conversation_history(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let conversations = self.conversations.lock().await;
        conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Corpus-wide statistics.
    pub async fn stats(&self) -> Result<EngineStats> {
        let documents = self.store.list_documents().await?;
        let total_chunks = self.store.count().await?;
        let total_conversations = self.conversations.lock().await.len();

        Ok(EngineStats {
            total_documents: documents.len(),
            total_chunks,
            total_conversations,
            embedding_model: self.embedder.model_name().to_string(),
            llm_model: self.llm.model_name().to_string(),
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        })
    }

    /// Probe each external dependency, reducing every failure to a status
    /// string. Never returns an error.
    pub async fn health_check(&self) -> HealthReport {
        let llm_ok = self.llm.ping().await;
        let store_ok = self.store.count().await.is_ok();
        let embed_ok = self
            .embedder
            .embed("This is a test sentence for embedding.")
            .await
            .is_ok();

        let healthy = |ok: bool| String::from(if ok { "healthy" } else { "unhealthy" });
        let status = if llm_ok && store_ok && embed_ok {
            "healthy"
        } else {
            "degraded"
        };

        HealthReport {
            status: status.to_string(),
            components: HealthComponents {
                llm_api: healthy(llm_ok),
                vector_store: healthy(store_ok),
                embeddings: healthy(embed_ok),
            },
        }
    }

    /// Append one question/answer exchange to the conversation, trimming to
    /// the most recent [`MAX_HISTORY_MESSAGES`]. The append and trim happen
    /// under one lock acquisition so concurrent answers cannot lose updates.
    async fn record_exchange(&self, conversation_id: &str, question: &str, answer: &str) {
        let mut conversations = self.conversations.lock().await;
        let history = conversations
            .entry(conversation_id.to_string())
            .or_default();

        history.push(ChatMessage::user(question));
        history.push(ChatMessage::assistant(answer));

        if history.len() > MAX_HISTORY_MESSAGES {
            let excess = history.len() - MAX_HISTORY_MESSAGES;
            history.drain(..excess);
        }
    }
}

/// Assemble the retrieved chunks into the context block injected into the
/// system prompt, in the store's rank order.
fn build_context(chunks: &[ScoredChunk]) -> String {
    let mut parts = Vec::with_capacity(chunks.len());

    for (i, chunk) in chunks.iter().enumerate() {
        let mut source_info = format!("[Source {} - {}", i + 1, chunk.metadata.filename);
        if let Some(page) = chunk.metadata.page_number {
            source_info.push_str(&format!(", Page {}", page));
        }
        source_info.push(']');

        parts.push(format!("{}\n{}\n", source_info, chunk.text));
    }

    parts.join("\n")
}

/// Turn retrieved chunks into source citations: preview text truncated to
/// [`SOURCE_PREVIEW_CHARS`] characters and similarity rounded to 4 decimals.
fn format_sources(chunks: &[ScoredChunk]) -> Vec<SourceReference> {
    chunks
        .iter()
        .map(|chunk| {
            let chunk_text = if chunk.text.chars().count() > SOURCE_PREVIEW_CHARS {
                let preview: String = chunk.text.chars().take(SOURCE_PREVIEW_CHARS).collect();
                format!("{}...", preview)
            } else {
                chunk.text.clone()
            };

            SourceReference {
                document_id: chunk.metadata.document_id.clone(),
                document_name: chunk.metadata.filename.clone(),
                page_number: chunk.metadata.page_number,
                chunk_text,
                relevance_score: round_to(chunk.similarity, 4),
            }
        })
        .collect()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn scored(text: &str, filename: &str, page: Option<i64>, similarity: f64) -> ScoredChunk {
        ScoredChunk {
            id: "c1".to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                document_id: "doc_x".to_string(),
                filename: filename.to_string(),
                chunk_index: 0,
                page_number: page,
                file_size: 1,
                page_count: 1,
                chunk_length: text.len() as i64,
                content_hash: "h".to_string(),
                timestamp: None,
            },
            distance: (1.0 / similarity) - 1.0,
            similarity,
        }
    }

    #[test]
    fn context_includes_page_when_known() {
        let chunks = vec![
            scored("first chunk", "a.pdf", Some(2), 0.9),
            scored("second chunk", "b.pdf", None, 0.5),
        ];
        let context = build_context(&chunks);
        assert!(context.contains("[Source 1 - a.pdf, Page 2]\nfirst chunk"));
        assert!(context.contains("[Source 2 - b.pdf]\nsecond chunk"));
    }

    #[test]
    fn sources_truncate_long_chunks() {
        let long = "y".repeat(350);
        let sources = format_sources(&[scored(&long, "a.pdf", None, 0.42)]);
        assert_eq!(sources[0].chunk_text.chars().count(), 203);
        assert!(sources[0].chunk_text.ends_with("..."));
        assert_eq!(sources[0].relevance_score, 0.42);
    }

    #[test]
    fn sources_keep_short_chunks_whole() {
        let sources = format_sources(&[scored("short", "a.pdf", Some(1), 0.123456)]);
        assert_eq!(sources[0].chunk_text, "short");
        assert_eq!(sources[0].relevance_score, 0.1235);
    }

    #[test]
    fn short_ids_have_expected_shape() {
        let id = short_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
