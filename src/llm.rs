//! External-collaborator contract for the embedding/chat/rerank model.
//!
//! Out of scope: the generative model itself. This module only specifies the
//! trait the rest of the system depends on, plus an HTTP-backed implementation
//! against an OpenAI-compatible endpoint (matching a local LM-Studio-style
//! server, the shape the routing/prompt configuration already assumes).

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
    async fn chat(&self, messages: &[ChatMessage], temperature: f32, max_tokens: u32) -> AppResult<String>;
    /// Cross-encoder rerank. `None` means the caller should fall back to a
    /// local pairwise scorer or skip reranking entirely.
    async fn rerank(&self, query: &str, passages: &[String]) -> AppResult<Option<Vec<f32>>>;
}

pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    pub fn new(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: config.llm_base_url.clone(),
            retry: RetryPolicy { max_retries: config.max_retries, ..Default::default() },
        }
    }

    fn classify(status: reqwest::StatusCode) -> AppError {
        if status.is_server_error() {
            AppError::Transient(format!("llm returned {status}"))
        } else {
            AppError::BadRequest(format!("llm returned {status}"))
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let text = text.to_string();
        self.retry
            .run(|| async {
                let resp = self
                    .client
                    .post(format!("{}/embeddings", self.base_url))
                    .json(&serde_json::json!({ "input": text }))
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            AppError::Timeout
                        } else {
                            AppError::Transient(e.to_string())
                        }
                    })?;

                if !resp.status().is_success() {
                    return Err(Self::classify(resp.status()));
                }
                let parsed: EmbeddingResponse = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
                parsed
                    .data
                    .into_iter()
                    .next()
                    .map(|d| d.embedding)
                    .ok_or_else(|| AppError::Internal(anyhow::anyhow!("empty embedding response")))
            })
            .await
    }

    async fn chat(&self, messages: &[ChatMessage], temperature: f32, max_tokens: u32) -> AppResult<String> {
        self.retry
            .run(|| async {
                let resp = self
                    .client
                    .post(format!("{}/chat/completions", self.base_url))
                    .json(&serde_json::json!({
                        "messages": messages,
                        "temperature": temperature,
                        "max_tokens": max_tokens,
                    }))
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            AppError::Timeout
                        } else {
                            AppError::Transient(e.to_string())
                        }
                    })?;

                if !resp.status().is_success() {
                    return Err(Self::classify(resp.status()));
                }
                let parsed: ChatResponse = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| AppError::Internal(anyhow::anyhow!("empty chat response")))
            })
            .await
    }

    async fn rerank(&self, query: &str, passages: &[String]) -> AppResult<Option<Vec<f32>>> {
        #[derive(Deserialize)]
        struct RerankResult {
            index: usize,
            relevance_score: f32,
        }
        #[derive(Deserialize)]
        struct RerankResponse {
            results: Vec<RerankResult>,
        }

        let resp = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&serde_json::json!({ "query": query, "documents": passages }))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(AppError::Timeout),
            Err(_) => return Ok(None), // endpoint not implemented by this backend
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if resp.status().is_server_error() {
            return Err(AppError::Transient(format!("reranker returned {}", resp.status())));
        }
        if !resp.status().is_success() {
            return Ok(None);
        }

        let parsed: RerankResponse = resp.json().await.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        let mut scores = vec![0.0f32; passages.len()];
        for r in parsed.results {
            if r.index < scores.len() {
                scores[r.index] = r.relevance_score;
            }
        }
        Ok(Some(scores))
    }
}
