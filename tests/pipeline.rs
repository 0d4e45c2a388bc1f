//! End-to-end pipeline tests over an in-memory SQLite store, a
//! deterministic stub embedder, and a stub chat backend. PDFs are
//! synthesized with lopdf so the real extraction path runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use docqa::embedding::{EmbeddingProvider, EmbeddingService};
use docqa::engine::RagEngine;
use docqa::llm::{ChatBackend, Completion, LlmClient, RAG_PROMPT_TEMPLATE_KEY};
use docqa::migrate;
use docqa::models::{ChatMessage, IngestStatus};
use docqa::observability::ObservabilityStore;
use docqa::store::VectorStore;

// ============ Test doubles ============

/// Deterministic embedder: one dimension per ASCII letter, counting
/// occurrences. The service layer normalizes, so similar vocabulary means
/// similar vectors.
struct LetterCountProvider;

#[async_trait]
impl EmbeddingProvider for LetterCountProvider {
    fn model_name(&self) -> &str {
        "letter-count-test-model"
    }

    fn dims(&self) -> usize {
        26
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 26];
                for c in text.to_ascii_lowercase().chars() {
                    if c.is_ascii_lowercase() {
                        v[(c as usize) - ('a' as usize)] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

/// Chat backend double with a canned reply, a call counter, and a failure
/// switch.
struct StubBackend {
    reply: String,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl ChatBackend for StubBackend {
    fn model_name(&self) -> &str {
        "stub-chat-model"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("stub backend failure");
        }
        Ok(Completion {
            text: self.reply.clone(),
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
        })
    }
}

struct Harness {
    engine: Arc<RagEngine>,
    observability: Arc<ObservabilityStore>,
    llm_calls: Arc<AtomicUsize>,
    llm: Arc<LlmClient>,
}

async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

async fn harness_with(fail_llm: bool, chunk_size: usize, chunk_overlap: usize) -> Harness {
    let pool = memory_pool().await;

    let observability = Arc::new(ObservabilityStore::new(pool.clone(), 0.00059, 0.00079));
    let llm_calls = Arc::new(AtomicUsize::new(0));
    let backend = StubBackend {
        reply: "According to the documents, the answer is 42.".to_string(),
        calls: llm_calls.clone(),
        fail: fail_llm,
    };

    let embedder = Arc::new(EmbeddingService::new(Box::new(LetterCountProvider)));
    let store = Arc::new(VectorStore::new(pool));
    let llm = Arc::new(LlmClient::new(Box::new(backend), observability.clone()));

    let engine = Arc::new(RagEngine::new(
        embedder,
        store,
        llm.clone(),
        chunk_size,
        chunk_overlap,
        5,
    ));

    Harness {
        engine,
        observability,
        llm_calls,
        llm,
    }
}

async fn harness() -> Harness {
    harness_with(false, 500, 50).await
}

// ============ PDF synthesis ============

/// Build a valid PDF with one page per entry in `pages`, each rendering its
/// text with the built-in Helvetica font.
fn build_pdf(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![100.into(), 600.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

fn three_page_pdf() -> Vec<u8> {
    build_pdf(&[
        "alpha beta gamma delta epsilon theorem lemma",
        "zebra quartz xylophone jazz quiz fuzz buzz zigzag",
        "omega sigma lambda kappa theta iota upsilon",
    ])
}

// ============ Ingest ============

#[tokio::test]
async fn ingest_reports_pages_and_chunks() {
    let h = harness().await;

    let outcome = h
        .engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;

    assert_eq!(outcome.status, IngestStatus::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.page_count, Some(3));
    assert!(outcome.chunk_count.unwrap() >= 1);
    let doc_id = outcome.document_id.unwrap();
    assert!(doc_id.starts_with("doc_"));
    assert_eq!(outcome.content_hash.unwrap().len(), 64);

    let docs = h.engine.list_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].document_id, doc_id);
    assert_eq!(docs[0].filename, "report.pdf");
    assert_eq!(docs[0].page_count, 3);
    assert_eq!(docs[0].chunk_count, outcome.chunk_count.unwrap());
}

#[tokio::test]
async fn ingest_rejects_same_content_under_new_name_as_hash_duplicate() {
    let h = harness().await;
    let pdf = three_page_pdf();

    let first = h.engine.process_document(&pdf, "first.pdf", 4096).await;
    assert_eq!(first.status, IngestStatus::Completed);

    let second = h.engine.process_document(&pdf, "second.pdf", 4096).await;
    assert_eq!(second.status, IngestStatus::Duplicate);
    assert_eq!(second.match_type.as_deref(), Some("content_hash"));
    assert_eq!(second.existing_document_id, first.document_id);
    assert!(second.document_id.is_none());

    // Nothing new was indexed
    assert_eq!(h.engine.list_documents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn ingest_rejects_same_filename_with_new_content_as_filename_duplicate() {
    let h = harness().await;

    let first = h
        .engine
        .process_document(&three_page_pdf(), "same.pdf", 4096)
        .await;
    assert_eq!(first.status, IngestStatus::Completed);

    let other = build_pdf(&["entirely different words on a single page"]);
    let second = h.engine.process_document(&other, "same.pdf", 2048).await;
    assert_eq!(second.status, IngestStatus::Duplicate);
    assert_eq!(second.match_type.as_deref(), Some("filename"));
    assert_eq!(second.existing_document_id, first.document_id);
}

#[tokio::test]
async fn ingest_of_invalid_pdf_fails_without_partial_chunks() {
    let h = harness().await;

    let outcome = h
        .engine
        .process_document(b"definitely not a pdf", "broken.pdf", 20)
        .await;
    assert_eq!(outcome.status, IngestStatus::Failed);
    assert!(outcome.error.is_some());

    assert!(h.engine.list_documents().await.unwrap().is_empty());
}

// ============ Answer ============

#[tokio::test]
async fn empty_store_short_circuits_without_llm_call_or_log() {
    let h = harness().await;

    let answer = h
        .engine
        .answer_question("what does the report say?", None, None)
        .await
        .unwrap();

    assert!(answer.answer.contains("couldn't find any relevant information"));
    assert!(answer.sources.is_empty());
    assert!(answer.conversation_id.starts_with("conv_"));
    assert_eq!(answer.chunks_used, 0);
    assert!(answer.prompt_tokens.is_none());

    assert_eq!(h.llm_calls.load(Ordering::SeqCst), 0);
    assert!(h.observability.recent_logs(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn answer_carries_sources_and_accounting() {
    let h = harness().await;
    h.engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;

    let answer = h
        .engine
        .answer_question("zebra quartz xylophone quiz", None, None)
        .await
        .unwrap();

    assert_eq!(answer.answer, "According to the documents, the answer is 42.");
    assert!(!answer.sources.is_empty());
    // The vocabulary of page 2 dominates the question: its chunk ranks first.
    assert!(
        answer.sources[0].chunk_text.contains("zebra"),
        "top source was {:?}",
        answer.sources[0].chunk_text
    );
    assert_eq!(answer.sources[0].document_name, "report.pdf");
    assert!(answer.sources[0].relevance_score > 0.0);
    assert!(answer.sources[0].relevance_score <= 1.0);

    assert_eq!(answer.model_used, "stub-chat-model");
    assert_eq!(answer.prompt_tokens, Some(100));
    assert_eq!(answer.completion_tokens, Some(50));
    assert_eq!(answer.total_tokens, Some(150));
    let expected_cost = (100.0 / 1000.0) * 0.00059 + (50.0 / 1000.0) * 0.00079;
    assert!((answer.estimated_cost_usd.unwrap() - expected_cost).abs() < 1e-9);
    assert_eq!(
        answer.prompt_template_key.as_deref(),
        Some(RAG_PROMPT_TEMPLATE_KEY)
    );
    assert_eq!(answer.prompt_template_version, Some(1));

    let logs = h.observability.recent_logs(50).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
    assert_eq!(logs[0].request_type, "rag_answer");
    assert_eq!(logs[0].total_tokens, 150);
    assert_eq!(
        logs[0].conversation_id.as_deref(),
        Some(answer.conversation_id.as_str())
    );
}

#[tokio::test]
async fn document_filter_restricts_retrieval() {
    let h = harness().await;

    let zebra_doc = h
        .engine
        .process_document(
            &build_pdf(&["zebra quartz xylophone jazz quiz"]),
            "zebra.pdf",
            1024,
        )
        .await;
    let other_doc = h
        .engine
        .process_document(
            &build_pdf(&["alpha beta gamma delta epsilon"]),
            "greek.pdf",
            1024,
        )
        .await;

    // Restrict to the Greek document while asking a zebra question
    let answer = h
        .engine
        .answer_question(
            "zebra quartz xylophone quiz",
            Some(vec![other_doc.document_id.clone().unwrap()]),
            None,
        )
        .await
        .unwrap();

    assert!(!answer.sources.is_empty());
    for source in &answer.sources {
        assert_eq!(source.document_id, other_doc.document_id.clone().unwrap());
        assert_ne!(source.document_id, zebra_doc.document_id.clone().unwrap());
    }
}

#[tokio::test]
async fn conversation_history_trims_to_twenty_fifo() {
    let h = harness().await;
    h.engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;

    let conversation_id = "conv_fixed000001".to_string();
    for i in 0..12 {
        h.engine
            .answer_question(
                &format!("question number {} about zebra", i),
                None,
                Some(conversation_id.clone()),
            )
            .await
            .unwrap();
    }

    let history = h.engine.conversation_history(&conversation_id).await;
    assert_eq!(history.len(), 20);
    // Oldest exchanges dropped first: the earliest surviving user message is
    // the third question asked.
    assert!(history[0].content.contains("question number 2"));
    assert!(history[18].content.contains("question number 11"));
}

#[tokio::test]
async fn llm_failure_is_logged_then_raised() {
    let h = harness_with(true, 500, 50).await;
    h.engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;

    let result = h
        .engine
        .answer_question("zebra quartz xylophone quiz", None, None)
        .await;
    assert!(result.is_err());

    let logs = h.observability.recent_logs(50).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
    assert_eq!(logs[0].total_tokens, 0);
    assert!(logs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("stub backend failure"));
}

#[tokio::test]
async fn source_previews_truncate_to_200_chars() {
    // Small chunks would never hit the cap; force large ones.
    let h = harness_with(false, 400, 40).await;
    let long_page = "repetition of several plain words to pad out the page text ".repeat(12);
    h.engine
        .process_document(&build_pdf(&[long_page.as_str()]), "long.pdf", 8192)
        .await;

    let answer = h
        .engine
        .answer_question("plain words about repetition", None, None)
        .await
        .unwrap();

    let top = &answer.sources[0];
    assert_eq!(top.chunk_text.chars().count(), 203);
    assert!(top.chunk_text.ends_with("..."));
}

// ============ Delete ============

#[tokio::test]
async fn delete_document_removes_chunks_and_reports_count() {
    let h = harness().await;
    let outcome = h
        .engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;
    let doc_id = outcome.document_id.unwrap();
    let chunk_count = outcome.chunk_count.unwrap() as u64;

    let deleted = h.engine.delete_document(&doc_id).await.unwrap();
    assert!(deleted.success);
    assert_eq!(deleted.chunks_deleted, chunk_count);
    assert!(h.engine.list_documents().await.unwrap().is_empty());

    // Second delete: nothing left to remove
    let again = h.engine.delete_document(&doc_id).await.unwrap();
    assert!(!again.success);
    assert_eq!(again.chunks_deleted, 0);
}

// ============ Stats and summaries ============

#[tokio::test]
async fn stats_reflect_corpus_and_conversations() {
    let h = harness().await;
    h.engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;
    h.engine
        .answer_question("zebra quartz quiz", None, Some("conv_a".to_string()))
        .await
        .unwrap();

    let stats = h.engine.stats().await.unwrap();
    assert_eq!(stats.total_documents, 1);
    assert!(stats.total_chunks >= 1);
    assert_eq!(stats.total_conversations, 1);
    assert_eq!(stats.embedding_model, "letter-count-test-model");
    assert_eq!(stats.llm_model, "stub-chat-model");
    assert_eq!(stats.chunk_size, 500);
    assert_eq!(stats.chunk_overlap, 50);
}

#[tokio::test]
async fn summarize_is_logged_as_its_own_request_type() {
    let h = harness().await;

    let summary = h.llm.summarize("A long document body.", 200).await.unwrap();
    assert!(!summary.is_empty());

    let logs = h.observability.recent_logs(50).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].request_type, "document_summary");
    assert!(logs[0].success);
}

#[tokio::test]
async fn answers_accumulate_in_metrics_summary() {
    let h = harness().await;
    h.engine
        .process_document(&three_page_pdf(), "report.pdf", 4096)
        .await;

    h.engine
        .answer_question("zebra quartz quiz", None, None)
        .await
        .unwrap();
    h.engine
        .answer_question("alpha beta gamma", None, None)
        .await
        .unwrap();

    let metrics = h.observability.metrics_summary(24).await.unwrap();
    assert_eq!(metrics.summary.total_queries, 2);
    assert_eq!(metrics.summary.success_count, 2);
    assert_eq!(metrics.summary.failure_count, 0);
    assert_eq!(metrics.summary.total_tokens, 300);
    assert!(metrics.summary.total_cost_usd > 0.0);
}
