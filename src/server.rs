//! HTTP API server.
//!
//! Exposes the RAG engine and observability store over a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents/upload` | Upload and ingest a PDF (multipart `file`) |
//! | `GET`  | `/documents/list` | List indexed documents with chunk counts |
//! | `GET`  | `/documents/{id}` | Per-document summary |
//! | `DELETE` | `/documents/{id}` | Delete a document and its chunks |
//! | `POST` | `/query/ask` | Ask a question, get an answer with sources |
//! | `GET`  | `/query/conversation/{id}` | Conversation history |
//! | `GET`  | `/observability/metrics` | Aggregated LLM metrics over a window |
//! | `GET`  | `/observability/logs` | Recent LLM request logs |
//! | `GET`  | `/observability/prompts` | Prompt template versions |
//! | `POST` | `/observability/prompts` | Create a new prompt template version |
//! | `GET`  | `/system/health` | Per-component health probes |
//! | `GET`  | `/system/stats` | Corpus statistics |
//! | `GET`  | `/system/info` | Static configuration summary |
//! | `GET`  | `/health` | Liveness check (returns version) |
//!
//! # Error Contract
//!
//! All error responses carry a machine-readable code:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must be 3-500 characters" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `duplicate` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingService};
use crate::engine::RagEngine;
use crate::llm::{GroqBackend, LlmClient};
use crate::migrate;
use crate::models::IngestStatus;
use crate::observability::ObservabilityStore;
use crate::store::VectorStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RagEngine>,
    pub observability: Arc<ObservabilityStore>,
    pub config: Arc<Config>,
}

/// Starts the HTTP server: connects the database, runs migrations,
/// constructs the service graph, and serves until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let observability = Arc::new(ObservabilityStore::new(
        pool.clone(),
        config.llm.prompt_token_cost_per_1k,
        config.llm.completion_token_cost_per_1k,
    ));

    let embedder = Arc::new(EmbeddingService::new(create_provider(&config.embedding)?));
    let store = Arc::new(VectorStore::new(pool));
    let llm = Arc::new(LlmClient::new(
        Box::new(GroqBackend::new(&config.llm)?),
        observability.clone(),
    ));

    let engine = Arc::new(RagEngine::new(
        embedder,
        store,
        llm,
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
        config.retrieval.top_k,
    ));

    let state = AppState {
        engine,
        observability,
        config: Arc::new(config.clone()),
    };

    let bind_addr = config.server.bind.clone();
    let app = build_router(state, config.upload.max_file_size_bytes());

    tracing::info!(bind = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router over an already-constructed state. Split out so the
/// route table can be exercised without binding a socket.
pub fn build_router(state: AppState, max_upload_bytes: u64) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents/upload", post(handle_upload))
        .route("/documents/list", get(handle_list_documents))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/query/ask", post(handle_ask))
        .route("/query/conversation/{id}", get(handle_conversation))
        .route("/observability/metrics", get(handle_metrics))
        .route("/observability/logs", get(handle_logs))
        .route(
            "/observability/prompts",
            get(handle_list_prompts).post(handle_create_prompt),
        )
        .route("/system/health", get(handle_system_health))
        .route("/system/stats", get(handle_stats))
        .route("/system/info", get(handle_info))
        .route("/health", get(handle_health))
        // Leave headroom above the document size limit for multipart framing.
        .layer(DefaultBodyLimit::max(max_upload_bytes as usize + 64 * 1024))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "duplicate".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /documents/upload ============

/// Handler for `POST /documents/upload`.
///
/// Accepts a multipart form with a `file` part. Validation (PDF extension,
/// non-empty, within the configured size limit) happens before any pipeline
/// work begins.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() == Some("file") || field.file_name().is_some() {
            filename = field.file_name().map(|f| f.to_string());
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
            file_bytes = Some(bytes.to_vec());
            break;
        }
    }

    let bytes = file_bytes.ok_or_else(|| bad_request("missing 'file' field"))?;
    let filename = filename.ok_or_else(|| bad_request("upload has no filename"))?;

    let extension = std::path::Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if extension != "pdf" {
        return Err(bad_request(format!(
            "File type .{} not allowed. Only PDF files are supported.",
            extension
        )));
    }

    if bytes.is_empty() {
        return Err(bad_request("File is empty"));
    }

    let max_bytes = state.config.upload.max_file_size_bytes();
    if bytes.len() as u64 > max_bytes {
        return Err(bad_request(format!(
            "File too large. Maximum size is {}MB",
            state.config.upload.max_file_size_mb
        )));
    }

    let file_size = bytes.len() as u64;
    let outcome = state
        .engine
        .process_document(&bytes, &filename, file_size)
        .await;

    match outcome.status {
        IngestStatus::Completed => Ok(Json(
            serde_json::to_value(&outcome).map_err(|e| internal(e.to_string()))?,
        )),
        IngestStatus::Duplicate => Err(conflict(
            outcome
                .error
                .unwrap_or_else(|| "Duplicate document detected".to_string()),
        )),
        IngestStatus::Failed => Err(internal(
            outcome
                .error
                .unwrap_or_else(|| "Document processing failed".to_string()),
        )),
    }
}

// ============ GET /documents/list ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<crate::models::DocumentSummary>,
    total_count: usize,
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state
        .engine
        .list_documents()
        .await
        .map_err(|e| internal(format!("Failed to list documents: {}", e)))?;

    let total_count = documents.len();
    Ok(Json(DocumentListResponse {
        documents,
        total_count,
    }))
}

// ============ GET /documents/{id} ============

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::DocumentSummary>, AppError> {
    let documents = state
        .engine
        .list_documents()
        .await
        .map_err(|e| internal(format!("Failed to get document info: {}", e)))?;

    documents
        .into_iter()
        .find(|d| d.document_id == id)
        .map(Json)
        .ok_or_else(|| not_found(format!("Document {} not found", id)))
}

// ============ DELETE /documents/{id} ============

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::DeleteOutcome>, AppError> {
    let outcome = state
        .engine
        .delete_document(&id)
        .await
        .map_err(|e| internal(format!("Failed to delete document: {}", e)))?;

    if !outcome.success {
        return Err(not_found(
            outcome
                .error
                .unwrap_or_else(|| "Document not found".to_string()),
        ));
    }

    Ok(Json(outcome))
}

// ============ POST /query/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    document_ids: Option<Vec<String>>,
    #[serde(default)]
    conversation_id: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<crate::models::Answer>, AppError> {
    let question = request.question.trim().to_string();
    if question.chars().count() < 3 || question.chars().count() > 500 {
        return Err(bad_request("question must be 3-500 characters"));
    }

    let answer = state
        .engine
        .answer_question(&question, request.document_ids, request.conversation_id)
        .await
        .map_err(|e| internal(format!("Failed to answer question: {}", e)))?;

    Ok(Json(answer))
}

// ============ GET /query/conversation/{id} ============

#[derive(Serialize)]
struct ConversationResponse {
    conversation_id: String,
    messages: Vec<crate::models::ChatMessage>,
    message_count: usize,
}

async fn handle_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ConversationResponse> {
    let messages = state.engine.conversation_history(&id).await;
    let message_count = messages.len();

    Json(ConversationResponse {
        conversation_id: id,
        messages,
        message_count,
    })
}

// ============ GET /observability/metrics ============

#[derive(Deserialize)]
struct MetricsParams {
    #[serde(default = "default_window_hours")]
    window_hours: i64,
}

fn default_window_hours() -> i64 {
    24
}

async fn handle_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<crate::observability::MetricsSummary>, AppError> {
    if !(1..=720).contains(&params.window_hours) {
        return Err(bad_request("window_hours must be between 1 and 720"));
    }

    let summary = state
        .observability
        .metrics_summary(params.window_hours)
        .await
        .map_err(|e| internal(format!("Failed to aggregate metrics: {}", e)))?;

    Ok(Json(summary))
}

// ============ GET /observability/logs ============

#[derive(Deserialize)]
struct LogsParams {
    #[serde(default = "default_logs_limit")]
    limit: i64,
}

fn default_logs_limit() -> i64 {
    50
}

async fn handle_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<crate::observability::LlmRequestLog>>, AppError> {
    if !(1..=500).contains(&params.limit) {
        return Err(bad_request("limit must be between 1 and 500"));
    }

    let logs = state
        .observability
        .recent_logs(params.limit)
        .await
        .map_err(|e| internal(format!("Failed to fetch logs: {}", e)))?;

    Ok(Json(logs))
}

// ============ GET /observability/prompts ============

#[derive(Deserialize)]
struct PromptsParams {
    #[serde(default)]
    template_key: Option<String>,
}

async fn handle_list_prompts(
    State(state): State<AppState>,
    Query(params): Query<PromptsParams>,
) -> Result<Json<Vec<crate::observability::PromptTemplate>>, AppError> {
    let templates = state
        .observability
        .list_templates(params.template_key.as_deref())
        .await
        .map_err(|e| internal(format!("Failed to list prompt templates: {}", e)))?;

    Ok(Json(templates))
}

// ============ POST /observability/prompts ============

#[derive(Deserialize)]
struct PromptCreateRequest {
    template_key: String,
    template_text: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_activate")]
    activate: bool,
}

fn default_activate() -> bool {
    true
}

async fn handle_create_prompt(
    State(state): State<AppState>,
    Json(request): Json<PromptCreateRequest>,
) -> Result<Json<crate::observability::PromptTemplate>, AppError> {
    if request.template_key.trim().is_empty() {
        return Err(bad_request("template_key must not be empty"));
    }
    if request.template_text.trim().is_empty() {
        return Err(bad_request("template_text must not be empty"));
    }

    let created = state
        .observability
        .create_version(
            &request.template_key,
            &request.template_text,
            request.description.as_deref(),
            request.activate,
        )
        .await
        .map_err(|e| internal(format!("Failed to create prompt version: {}", e)))?;

    Ok(Json(created))
}

// ============ System routes ============

async fn handle_system_health(
    State(state): State<AppState>,
) -> Json<crate::models::HealthReport> {
    Json(state.engine.health_check().await)
}

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::models::EngineStats>, AppError> {
    let stats = state
        .engine
        .stats()
        .await
        .map_err(|e| internal(format!("Failed to get stats: {}", e)))?;

    Ok(Json(stats))
}

#[derive(Serialize)]
struct InfoResponse {
    app_name: String,
    version: String,
    llm_model: String,
    embedding_provider: String,
    chunk_size: usize,
    chunk_overlap: usize,
    top_k: usize,
    max_file_size_mb: u64,
    allowed_file_types: Vec<String>,
}

async fn handle_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let config = &state.config;
    Json(InfoResponse {
        app_name: "docqa".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        llm_model: config.llm.model.clone(),
        embedding_provider: config.embedding.provider.clone(),
        chunk_size: config.chunking.chunk_size,
        chunk_overlap: config.chunking.chunk_overlap,
        top_k: config.retrieval.top_k,
        max_file_size_mb: config.upload.max_file_size_mb,
        allowed_file_types: vec![".pdf".to_string()],
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Liveness check used by load balancers; the deep per-component probe
/// lives at `/system/health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
