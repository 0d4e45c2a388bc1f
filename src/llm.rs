//! LLM chat-completion client.
//!
//! [`ChatBackend`] is the wire-level trait: messages in, completion text and
//! token usage out, plus a streamed variant that yields text fragments as
//! they arrive. [`GroqBackend`] implements it against an OpenAI-compatible
//! chat-completions endpoint.
//!
//! [`LlmClient`] layers the RAG behavior on top: it resolves the active
//! prompt template, injects the retrieved context, measures latency,
//! computes cost, and logs every attempt (success or failure) to the
//! observability store before returning or re-raising.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::models::ChatMessage;
use crate::observability::{round_to, LogEntry, ObservabilityStore};

/// Well-known template key for the RAG question-answering system prompt.
pub const RAG_PROMPT_TEMPLATE_KEY: &str = "rag_qa_system_prompt";

/// Default RAG system prompt, auto-created as version 1 of
/// [`RAG_PROMPT_TEMPLATE_KEY`] when no template exists yet.
pub const DEFAULT_RAG_SYSTEM_PROMPT: &str = "\
You are a helpful AI assistant that answers questions based on the provided context from documents.

IMPORTANT RULES:
1. Answer ONLY based on the context provided
2. If the context doesn't contain the answer, say \"I cannot find this information in the provided documents\"
3. Be concise but comprehensive
4. Cite specific parts of the context when relevant
5. If you're uncertain, express your uncertainty
6. Use a professional but friendly tone

Context from documents:
{context}

Remember: Only use information from the context above. Do not use your general knowledge.";

/// A finished chat completion with token usage.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Trait for chat-completion backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Returns the model identifier (e.g. `"llama-3.3-70b-versatile"`).
    fn model_name(&self) -> &str;

    /// Send messages, wait for the full completion.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion>;

    /// Send messages, receive text fragments as they are generated. The
    /// stream is finite and cannot be restarted. Backends without native
    /// streaming fall back to yielding the whole completion at once.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<BoxStream<'static, Result<String>>> {
        let completion = self.complete(messages).await?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok(completion.text)
        })))
    }

    /// Liveness probe, reduced to a boolean. Never propagates errors.
    async fn ping(&self) -> bool {
        self.complete(&[ChatMessage::user("Hello")]).await.is_ok()
    }
}

// ============ Groq backend ============

/// Chat backend for Groq's OpenAI-compatible API.
///
/// Calls `POST {api_url}/chat/completions`. The API key is read from the
/// environment variable named in config (default `GROQ_API_KEY`).
pub struct GroqBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl GroqBackend {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "top_p": 1,
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, body_text);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for GroqBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let response = self.send(&self.request_body(messages, false)).await?;
        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.send(&self.request_body(messages, true)).await?;
        let bytes = response.bytes_stream();

        // Server-sent events: one `data: {json}` line per delta, terminated
        // by `data: [DONE]`.
        let stream = futures::stream::try_unfold(
            (bytes, String::new()),
            |(mut bytes, mut buffer)| async move {
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer.drain(..=pos);

                        if let Some(data) = line.strip_prefix("data: ") {
                            if data == "[DONE]" {
                                return Ok(None);
                            }
                            let event: serde_json::Value = serde_json::from_str(data)
                                .context("malformed stream event")?;
                            if let Some(delta) =
                                event["choices"][0]["delta"]["content"].as_str()
                            {
                                if !delta.is_empty() {
                                    return Ok(Some((delta.to_string(), (bytes, buffer))));
                                }
                            }
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                        Some(Err(e)) => return Err(anyhow::Error::from(e)),
                        None => return Ok(None),
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Parse an OpenAI-compatible chat-completion response.
fn parse_completion(json: &serde_json::Value) -> Result<Completion> {
    let text = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid LLM response: missing message content"))?
        .to_string();

    let usage = &json["usage"];
    let prompt_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let completion_tokens = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
    let total_tokens = usage["total_tokens"]
        .as_u64()
        .unwrap_or((prompt_tokens + completion_tokens) as u64) as u32;

    Ok(Completion {
        text,
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

// ============ LLM client ============

/// An answer generated for a question, with the accounting that goes with it.
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub latency_ms: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: f64,
    pub prompt_template_key: String,
    pub prompt_template_version: i64,
}

/// RAG-aware LLM client: template resolution, context injection, latency and
/// cost accounting, request logging.
pub struct LlmClient {
    backend: Box<dyn ChatBackend>,
    observability: Arc<ObservabilityStore>,
}

impl LlmClient {
    pub fn new(backend: Box<dyn ChatBackend>, observability: Arc<ObservabilityStore>) -> Self {
        Self {
            backend,
            observability,
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Generate an answer from retrieved context and conversation history.
    ///
    /// Logs the attempt to the observability store whether it succeeds or
    /// fails; a backend failure is re-raised after logging.
    pub async fn generate_answer(
        &self,
        question: &str,
        context: &str,
        history: &[ChatMessage],
        conversation_id: Option<&str>,
        request_metadata: serde_json::Value,
    ) -> Result<GeneratedAnswer> {
        let template = self.resolve_template().await?;
        let system_prompt = template.template_text.replace("{context}", context);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt.clone()));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(question));

        let mut metadata = json!({
            "history_messages": history.len(),
            "context_length": context.chars().count(),
        });
        if let (Some(base), Some(extra)) = (metadata.as_object_mut(), request_metadata.as_object())
        {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }

        let started = Instant::now();
        match self.backend.complete(&messages).await {
            Ok(completion) => {
                let latency_ms = round_to(started.elapsed().as_secs_f64() * 1000.0, 2);
                let cost_usd = self.observability.calculate_cost_usd(
                    completion.prompt_tokens as i64,
                    completion.completion_tokens as i64,
                );

                self.observability
                    .log_request(LogEntry {
                        request_type: "rag_answer".to_string(),
                        conversation_id: conversation_id.map(|c| c.to_string()),
                        model: self.backend.model_name().to_string(),
                        question: Some(question.to_string()),
                        prompt_input: system_prompt,
                        prompt_template_key: Some(template.template_key.clone()),
                        prompt_template_version: Some(template.version),
                        response_text: Some(completion.text.clone()),
                        request_metadata: Some(metadata),
                        prompt_tokens: completion.prompt_tokens as i64,
                        completion_tokens: completion.completion_tokens as i64,
                        latency_ms,
                        success: true,
                        error_message: None,
                    })
                    .await?;

                tracing::info!(
                    latency_ms,
                    prompt_tokens = completion.prompt_tokens,
                    completion_tokens = completion.completion_tokens,
                    cost_usd,
                    "generated answer"
                );

                Ok(GeneratedAnswer {
                    answer: completion.text,
                    latency_ms,
                    prompt_tokens: completion.prompt_tokens,
                    completion_tokens: completion.completion_tokens,
                    total_tokens: completion.total_tokens,
                    cost_usd,
                    prompt_template_key: template.template_key,
                    prompt_template_version: template.version,
                })
            }
            Err(e) => {
                let latency_ms = round_to(started.elapsed().as_secs_f64() * 1000.0, 2);

                self.observability
                    .log_request(LogEntry {
                        request_type: "rag_answer".to_string(),
                        conversation_id: conversation_id.map(|c| c.to_string()),
                        model: self.backend.model_name().to_string(),
                        question: Some(question.to_string()),
                        prompt_input: system_prompt,
                        prompt_template_key: Some(template.template_key),
                        prompt_template_version: Some(template.version),
                        response_text: None,
                        request_metadata: Some(metadata),
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        latency_ms,
                        success: false,
                        error_message: Some(e.to_string()),
                    })
                    .await?;

                tracing::error!(error = %e, "answer generation failed");
                Err(e).context("failed to generate answer")
            }
        }
    }

    /// Streamed variant of answer generation for real-time display. Renders
    /// the same system prompt but does not log a request row; the fragments
    /// are consumed by the caller as they arrive.
    pub async fn stream_answer(
        &self,
        question: &str,
        context: &str,
        history: &[ChatMessage],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let template = self.resolve_template().await?;
        let system_prompt = template.template_text.replace("{context}", context);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(question));

        self.backend.stream(&messages).await
    }

    /// Generate a short summary of document text, for previews. Logged as a
    /// `document_summary` request.
    pub async fn summarize(&self, text: &str, max_words: usize) -> Result<String> {
        let excerpt: String = text.chars().take(4000).collect();
        let prompt = format!(
            "Summarize the following text in approximately {} words.\n\
             Be concise and capture the main points.\n\nText:\n{}\n\nSummary:",
            max_words, excerpt
        );

        let messages = [ChatMessage::user(prompt.clone())];
        let started = Instant::now();
        let result = self.backend.complete(&messages).await;
        let latency_ms = round_to(started.elapsed().as_secs_f64() * 1000.0, 2);

        let (response_text, tokens, success, error_message) = match &result {
            Ok(completion) => (
                Some(completion.text.clone()),
                (completion.prompt_tokens as i64, completion.completion_tokens as i64),
                true,
                None,
            ),
            Err(e) => (None, (0, 0), false, Some(e.to_string())),
        };

        self.observability
            .log_request(LogEntry {
                request_type: "document_summary".to_string(),
                conversation_id: None,
                model: self.backend.model_name().to_string(),
                question: None,
                prompt_input: prompt,
                prompt_template_key: None,
                prompt_template_version: None,
                response_text,
                request_metadata: None,
                prompt_tokens: tokens.0,
                completion_tokens: tokens.1,
                latency_ms,
                success,
                error_message,
            })
            .await?;

        result.map(|c| c.text).context("failed to summarize document")
    }

    /// Liveness probe for the LLM API, reduced to a boolean.
    pub async fn ping(&self) -> bool {
        self.backend.ping().await
    }

    async fn resolve_template(&self) -> Result<crate::observability::PromptTemplate> {
        if let Some(template) = self
            .observability
            .get_active_template(RAG_PROMPT_TEMPLATE_KEY)
            .await?
        {
            return Ok(template);
        }

        self.observability
            .ensure_template(
                RAG_PROMPT_TEMPLATE_KEY,
                DEFAULT_RAG_SYSTEM_PROMPT,
                Some("Default RAG system prompt template used for question answering."),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_has_context_placeholder() {
        assert!(DEFAULT_RAG_SYSTEM_PROMPT.contains("{context}"));
    }

    #[test]
    fn parse_completion_reads_usage() {
        let json = json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        let completion = parse_completion(&json).unwrap();
        assert_eq!(completion.text, "hi");
        assert_eq!(completion.prompt_tokens, 12);
        assert_eq!(completion.completion_tokens, 3);
        assert_eq!(completion.total_tokens, 15);
    }

    #[test]
    fn parse_completion_defaults_missing_usage_to_zero() {
        let json = json!({"choices": [{"message": {"content": "hi"}}]});
        let completion = parse_completion(&json).unwrap();
        assert_eq!(completion.prompt_tokens, 0);
        assert_eq!(completion.total_tokens, 0);
    }

    #[test]
    fn parse_completion_rejects_missing_content() {
        let json = json!({"choices": []});
        assert!(parse_completion(&json).is_err());
    }
}
