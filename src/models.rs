//! Core data models used throughout docqa.
//!
//! These types represent the chunks, chat messages, source citations, and
//! pipeline outcomes that flow through the ingest and answer pipelines.

use serde::{Deserialize, Serialize};

/// Role of a chat message sent to the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One role-tagged message in a conversation or LLM request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Metadata stored beside each chunk vector. Null-valued fields are omitted
/// when serialized, matching the store's metadata requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub filename: String,
    pub chunk_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    pub file_size: i64,
    pub page_count: i64,
    pub chunk_length: i64,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A chunk row read back from the vector store without a query vector.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// A chunk returned from a similarity query, ranked by distance.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub distance: f64,
    pub similarity: f64,
}

/// Per-document summary derived from stored chunk metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    pub upload_date: String,
    pub file_size: i64,
    pub page_count: i64,
    pub chunk_count: i64,
    pub status: String,
}

/// A source citation attached to a generated answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReference {
    pub document_id: String,
    pub document_name: String,
    pub page_number: Option<i64>,
    pub chunk_text: String,
    pub relevance_score: f64,
}

/// Terminal status of a document ingest attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Completed,
    Duplicate,
    Failed,
}

/// Result of running the ingest pipeline over one uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub filename: String,
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_document_id: Option<String>,
    /// Which criterion matched on a duplicate: `filename` or `content_hash`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
}

/// Result of answering one question, including token and cost accounting.
/// The token/cost/latency fields are absent when retrieval came back empty
/// and no LLM call was made.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceReference>,
    pub conversation_id: String,
    pub processing_time: f64,
    pub model_used: String,
    pub chunks_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template_version: Option<i64>,
}

/// Result of deleting a document and its chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub document_id: String,
    pub chunks_deleted: u64,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Corpus-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_documents: usize,
    pub total_chunks: i64,
    pub total_conversations: usize,
    pub embedding_model: String,
    pub llm_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Per-component health probe results.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub components: HealthComponents,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthComponents {
    pub llm_api: String,
    pub vector_store: String,
    pub embeddings: String,
}
