//! # docqa
//!
//! A retrieval-augmented question answering backend for PDF documents.
//!
//! Users upload PDFs; the system extracts and chunks their text, embeds the
//! chunks, stores them in a SQLite-backed vector index, and answers
//! natural-language questions by retrieving relevant chunks and asking an
//! LLM API to synthesize an answer with source citations. Every LLM call is
//! logged with token, cost, and latency accounting, and the system prompt is
//! versioned in a prompt-template table.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────┐
//! │ PDF       │──▶│   Pipeline     │──▶│  SQLite    │
//! │ upload    │   │ Extract+Chunk │   │ vectors +  │
//! └──────────┘   │ +Embed        │   │ request log│
//!                └───────────────┘   └─────┬─────┘
//!                                          │
//!                ┌───────────────┐         ▼
//! question ─────▶│  RAG engine    │──▶ LLM API ──▶ answer + sources
//!                └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF text extraction and cleaning |
//! | [`chunk`] | Overlapping fixed-width chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store adapter |
//! | [`llm`] | Chat-completion client |
//! | [`observability`] | Request logs, prompt versioning, metrics |
//! | [`engine`] | Ingest and answer pipelines |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod observability;
pub mod server;
pub mod store;
