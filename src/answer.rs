//! AnswerGenerator (C10): assembles a context block from retrieved chunks,
//! picks a per-collection system prompt, calls the chat model, and formats
//! sources for the response.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatMessage, LlmClient};
use crate::retriever::RetrievedChunk;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub text: String,
    pub score: f32,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<Source>,
    pub degraded_rerank: bool,
    pub bm25_unavailable: bool,
}

pub struct AnswerGenerator {
    config: Arc<AppConfig>,
    llm: Arc<dyn LlmClient>,
}

impl AnswerGenerator {
    pub fn new(config: Arc<AppConfig>, llm: Arc<dyn LlmClient>) -> Self {
        Self { config, llm }
    }

    fn system_prompt(&self, collection: &str) -> String {
        self.config
            .collection_prompts
            .get(collection)
            .cloned()
            .unwrap_or_else(|| self.config.default_system_prompt.clone())
    }

    fn temperature(&self, collection: &str) -> f32 {
        self.config.collection_temperatures.get(collection).copied().unwrap_or(0.2)
    }

    fn build_context(chunks: &[RetrievedChunk]) -> String {
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] {}", i + 1, c.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub async fn answer(
        &self,
        collection: &str,
        question: &str,
        chunks: Vec<RetrievedChunk>,
        degraded_rerank: bool,
        bm25_unavailable: bool,
    ) -> AppResult<Answer> {
        if chunks.is_empty() {
            return Err(AppError::EmptyCorpus);
        }

        let context = Self::build_context(&chunks);
        let messages = vec![
            ChatMessage { role: "system".into(), content: self.system_prompt(collection) },
            ChatMessage {
                role: "user".into(),
                content: format!("Context:\n{}\n\nQuestion: {}", context, question),
            },
        ];

        let text = self.llm.chat(&messages, self.temperature(collection), 1024).await?;

        let sources = chunks
            .into_iter()
            .map(|c| Source { text: c.text, score: c.score, metadata: c.metadata })
            .collect();

        Ok(Answer { text, sources, degraded_rerank, bm25_unavailable })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn embed(&self, _text: &str) -> AppResult<Vec<f32>> {
            Ok(vec![0.0])
        }
        async fn chat(&self, messages: &[ChatMessage], _temperature: f32, _max_tokens: u32) -> AppResult<String> {
            Ok(messages.iter().map(|m| m.content.clone()).collect::<Vec<_>>().join("\n---\n"))
        }
        async fn rerank(&self, _query: &str, _passages: &[String]) -> AppResult<Option<Vec<f32>>> {
            Ok(None)
        }
    }

    fn chunk(text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk { text: text.into(), score, metadata: Default::default() }
    }

    #[test]
    fn build_context_numbers_each_passage() {
        let chunks = vec![chunk("first", 0.9), chunk("second", 0.8)];
        let ctx = AnswerGenerator::build_context(&chunks);
        assert_eq!(ctx, "[1] first\n\n[2] second");
    }

    #[tokio::test]
    async fn empty_corpus_is_rejected_before_calling_the_model() {
        let config = Arc::new(crate::config::AppConfig::from_env());
        let generator = AnswerGenerator::new(config, Arc::new(EchoLlm));
        let err = generator.answer("general", "anything?", vec![], false, false).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyCorpus));
    }

    #[tokio::test]
    async fn per_collection_prompt_override_is_used() {
        let mut config = crate::config::AppConfig::from_env();
        config.collection_prompts.insert("legal".into(), "Be terse and cite sources.".into());
        let generator = AnswerGenerator::new(Arc::new(config), Arc::new(EchoLlm));
        let answer = generator.answer("legal", "what changed?", vec![chunk("text", 1.0)], false, true).await.unwrap();
        assert!(answer.text.contains("Be terse and cite sources."));
        assert!(answer.bm25_unavailable);
        assert_eq!(answer.sources.len(), 1);
    }
}
