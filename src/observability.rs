//! LLM observability: request logging, prompt-template versioning, and
//! dashboard metric aggregation.
//!
//! Every LLM call, successful or not, lands as one immutable row in
//! `llm_request_logs`. Prompt templates are versioned per key with at most
//! one active version at a time; activation of a new version deactivates the
//! old one inside a single transaction.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// One version of a prompt template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub template_key: String,
    pub version: i64,
    pub template_text: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

/// One immutable LLM request log row, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequestLog {
    pub id: i64,
    pub request_type: String,
    pub conversation_id: Option<String>,
    pub model: String,
    pub question: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: i64,
}

/// Parameters for one log insert.
#[derive(Debug, Clone, Default)]
pub struct LogEntry {
    pub request_type: String,
    pub conversation_id: Option<String>,
    pub model: String,
    pub question: Option<String>,
    pub prompt_input: String,
    pub prompt_template_key: Option<String>,
    pub prompt_template_version: Option<i64>,
    pub response_text: Option<String>,
    pub request_metadata: Option<serde_json::Value>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub latency_ms: f64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Headline metrics over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub window_hours: i64,
    pub summary: MetricsTotals,
    pub trends: Vec<DailyTrend>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsTotals {
    pub total_queries: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub average_latency_ms: f64,
    pub success_count: i64,
    pub failure_count: i64,
}

/// Per-calendar-day aggregate, ascending by date.
#[derive(Debug, Clone, Serialize)]
pub struct DailyTrend {
    pub date: String,
    pub queries: i64,
    pub tokens: i64,
    pub cost_usd: f64,
    pub average_latency_ms: f64,
}

/// Handle to the observability tables plus the configured token rates.
pub struct ObservabilityStore {
    pool: SqlitePool,
    prompt_token_cost_per_1k: f64,
    completion_token_cost_per_1k: f64,
}

impl ObservabilityStore {
    pub fn new(
        pool: SqlitePool,
        prompt_token_cost_per_1k: f64,
        completion_token_cost_per_1k: f64,
    ) -> Self {
        Self {
            pool,
            prompt_token_cost_per_1k,
            completion_token_cost_per_1k,
        }
    }

    /// Estimate request cost in USD from per-1K token rates, rounded to 8
    /// decimal places.
    pub fn calculate_cost_usd(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        let prompt_cost = (prompt_tokens as f64 / 1000.0) * self.prompt_token_cost_per_1k;
        let completion_cost =
            (completion_tokens as f64 / 1000.0) * self.completion_token_cost_per_1k;
        round_to(prompt_cost + completion_cost, 8)
    }

    /// Return the highest version for `key` if one exists, otherwise insert
    /// version 1 marked active and return it.
    pub async fn ensure_template(
        &self,
        template_key: &str,
        template_text: &str,
        description: Option<&str>,
    ) -> Result<PromptTemplate> {
        if let Some(existing) = self.latest_template(template_key).await? {
            return Ok(existing);
        }

        let created_at = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO prompt_templates (template_key, version, template_text, description, is_active, created_at) \
             VALUES (?, 1, ?, ?, 1, ?)",
        )
        .bind(template_key)
        .bind(template_text)
        .bind(description)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(template_key, "created prompt template v1");

        Ok(PromptTemplate {
            id: result.last_insert_rowid(),
            template_key: template_key.to_string(),
            version: 1,
            template_text: template_text.to_string(),
            description: description.map(|d| d.to_string()),
            is_active: true,
            created_at,
        })
    }

    /// Fetch the highest-versioned active template for a key, or none.
    pub async fn get_active_template(&self, template_key: &str) -> Result<Option<PromptTemplate>> {
        let row = sqlx::query(
            "SELECT id, template_key, version, template_text, description, is_active, created_at \
             FROM prompt_templates WHERE template_key = ? AND is_active = 1 \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(template_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(template_from_row))
    }

    /// Create a new version for `key`. When `activate` is set, every
    /// currently-active version for the key is deactivated in the same
    /// transaction as the insert.
    pub async fn create_version(
        &self,
        template_key: &str,
        template_text: &str,
        description: Option<&str>,
        activate: bool,
    ) -> Result<PromptTemplate> {
        let mut tx = self.pool.begin().await?;

        let latest_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM prompt_templates WHERE template_key = ?")
                .bind(template_key)
                .fetch_one(&mut *tx)
                .await?;
        let version = latest_version.unwrap_or(0) + 1;

        if activate {
            sqlx::query(
                "UPDATE prompt_templates SET is_active = 0 WHERE template_key = ? AND is_active = 1",
            )
            .bind(template_key)
            .execute(&mut *tx)
            .await?;
        }

        let created_at = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO prompt_templates (template_key, version, template_text, description, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(template_key)
        .bind(version)
        .bind(template_text)
        .bind(description)
        .bind(activate)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PromptTemplate {
            id: result.last_insert_rowid(),
            template_key: template_key.to_string(),
            version,
            template_text: template_text.to_string(),
            description: description.map(|d| d.to_string()),
            is_active: activate,
            created_at,
        })
    }

    /// Return template versions, newest version first, optionally limited to
    /// one key.
    pub async fn list_templates(&self, template_key: Option<&str>) -> Result<Vec<PromptTemplate>> {
        let rows = match template_key {
            Some(key) => {
                sqlx::query(
                    "SELECT id, template_key, version, template_text, description, is_active, created_at \
                     FROM prompt_templates WHERE template_key = ? \
                     ORDER BY template_key, version DESC",
                )
                .bind(key)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, template_key, version, template_text, description, is_active, created_at \
                     FROM prompt_templates ORDER BY template_key, version DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(template_from_row).collect())
    }

    /// Persist one LLM request log row. Total tokens and cost are computed
    /// here so every row carries them.
    pub async fn log_request(&self, entry: LogEntry) -> Result<i64> {
        let total_tokens = entry.prompt_tokens + entry.completion_tokens;
        let cost_usd = self.calculate_cost_usd(entry.prompt_tokens, entry.completion_tokens);
        let metadata_json = match &entry.request_metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let created_at = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "INSERT INTO llm_request_logs \
             (request_type, conversation_id, model, question, prompt_input, \
              prompt_template_key, prompt_template_version, response_text, request_metadata, \
              prompt_tokens, completion_tokens, total_tokens, cost_usd, latency_ms, \
              success, error_message, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.request_type)
        .bind(&entry.conversation_id)
        .bind(&entry.model)
        .bind(&entry.question)
        .bind(&entry.prompt_input)
        .bind(&entry.prompt_template_key)
        .bind(entry.prompt_template_version)
        .bind(&entry.response_text)
        .bind(&metadata_json)
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(total_tokens)
        .bind(cost_usd)
        .bind(entry.latency_ms)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to write LLM request log")?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent request logs, newest first.
    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<LlmRequestLog>> {
        let rows = sqlx::query(
            "SELECT id, request_type, conversation_id, model, question, \
             prompt_tokens, completion_tokens, total_tokens, cost_usd, latency_ms, \
             success, error_message, created_at \
             FROM llm_request_logs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LlmRequestLog {
                id: row.get("id"),
                request_type: row.get("request_type"),
                conversation_id: row.get("conversation_id"),
                model: row.get("model"),
                question: row.get("question"),
                prompt_tokens: row.get("prompt_tokens"),
                completion_tokens: row.get("completion_tokens"),
                total_tokens: row.get("total_tokens"),
                cost_usd: row.get("cost_usd"),
                latency_ms: row.get("latency_ms"),
                success: row.get("success"),
                error_message: row.get("error_message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Aggregate headline metrics over logs newer than `window_hours` ago,
    /// with a chronological per-day breakdown.
    pub async fn metrics_summary(&self, window_hours: i64) -> Result<MetricsSummary> {
        let since = chrono::Utc::now().timestamp() - window_hours * 3600;

        let totals = sqlx::query(
            "SELECT COUNT(id) AS total_queries, \
             COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
             COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
             COALESCE(SUM(total_tokens), 0) AS total_tokens, \
             COALESCE(SUM(cost_usd), 0.0) AS total_cost, \
             COALESCE(AVG(latency_ms), 0.0) AS avg_latency, \
             COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS success_count, \
             COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failure_count \
             FROM llm_request_logs WHERE created_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let trend_rows = sqlx::query(
            "SELECT date(created_at, 'unixepoch') AS day, \
             COUNT(id) AS queries, \
             COALESCE(SUM(total_tokens), 0) AS tokens, \
             COALESCE(SUM(cost_usd), 0.0) AS cost, \
             COALESCE(AVG(latency_ms), 0.0) AS avg_latency \
             FROM llm_request_logs WHERE created_at >= ? \
             GROUP BY day ORDER BY day",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(MetricsSummary {
            window_hours,
            summary: MetricsTotals {
                total_queries: totals.get("total_queries"),
                prompt_tokens: totals.get("prompt_tokens"),
                completion_tokens: totals.get("completion_tokens"),
                total_tokens: totals.get("total_tokens"),
                total_cost_usd: round_to(totals.get::<f64, _>("total_cost"), 8),
                average_latency_ms: round_to(totals.get::<f64, _>("avg_latency"), 2),
                success_count: totals.get("success_count"),
                failure_count: totals.get("failure_count"),
            },
            trends: trend_rows
                .into_iter()
                .map(|row| DailyTrend {
                    date: row.get("day"),
                    queries: row.get("queries"),
                    tokens: row.get("tokens"),
                    cost_usd: round_to(row.get::<f64, _>("cost"), 8),
                    average_latency_ms: round_to(row.get::<f64, _>("avg_latency"), 2),
                })
                .collect(),
        })
    }

    async fn latest_template(&self, template_key: &str) -> Result<Option<PromptTemplate>> {
        let row = sqlx::query(
            "SELECT id, template_key, version, template_text, description, is_active, created_at \
             FROM prompt_templates WHERE template_key = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(template_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(template_from_row))
    }
}

fn template_from_row(row: sqlx::sqlite::SqliteRow) -> PromptTemplate {
    PromptTemplate {
        id: row.get("id"),
        template_key: row.get("template_key"),
        version: row.get("version"),
        template_text: row.get("template_text"),
        description: row.get("description"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    }
}

/// Round to `places` decimal places.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}
