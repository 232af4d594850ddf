//! HybridRetriever (C4): vector + BM25 search, score-keyed dedup, rerank-batch
//! cap, cross-encoder rerank with transient-failure fallback, final cut.

use crate::chunker::Chunk;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::llm::LlmClient;
use crate::registry::CollectionRegistry;
use crate::vector::VectorIndex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct RetrieveRequest<'a> {
    pub query: &'a str,
    pub collection: &'a str,
    pub top_k: usize,
    pub final_k: usize,
    pub use_bm25: bool,
}

#[derive(Debug)]
pub struct RetrieveOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub bm25_unavailable: bool,
    pub degraded_rerank: bool,
}

pub struct HybridRetriever {
    config: Arc<AppConfig>,
    llm: Arc<dyn LlmClient>,
    vectors: Arc<VectorIndex>,
    registry: Arc<CollectionRegistry>,
}

struct Candidate {
    text: String,
    metadata: HashMap<String, serde_json::Value>,
    vector_score: Option<f32>,
    bm25_score: Option<f32>,
}

impl Candidate {
    fn current_score(&self) -> f32 {
        self.vector_score.unwrap_or(0.0).max(self.bm25_score.unwrap_or(0.0))
    }
}

impl HybridRetriever {
    pub fn new(
        config: Arc<AppConfig>,
        llm: Arc<dyn LlmClient>,
        vectors: Arc<VectorIndex>,
        registry: Arc<CollectionRegistry>,
    ) -> Self {
        Self { config, llm, vectors, registry }
    }

    fn validate(&self, req: &RetrieveRequest) -> AppResult<()> {
        if req.query.trim().is_empty() {
            return Err(AppError::InvalidArgument("query must not be empty".into()));
        }
        if req.query.len() > self.config.max_query_chars {
            return Err(AppError::InvalidArgument(format!(
                "query too long ({} chars, max {})",
                req.query.len(),
                self.config.max_query_chars
            )));
        }
        if req.final_k == 0 || req.top_k == 0 {
            return Err(AppError::InvalidArgument("top_k and final_k must be > 0".into()));
        }
        if req.final_k > req.top_k {
            return Err(AppError::InvalidArgument("final_k must be <= top_k".into()));
        }
        if req.top_k > self.config.max_top_k {
            return Err(AppError::InvalidArgument(format!("top_k exceeds max_top_k ({})", self.config.max_top_k)));
        }
        Ok(())
    }

    pub async fn retrieve(&self, req: RetrieveRequest<'_>) -> AppResult<RetrieveOutcome> {
        self.validate(&req)?;

        let query_vec = self.llm.embed(req.query).await?;
        let vector_hits = self.vectors.search(req.collection, &query_vec, req.top_k).await?;

        let entry = self.registry.get_or_create(req.collection);
        let bm25_ready = entry.bm25.is_ready();
        let bm25_hits = if req.use_bm25 && bm25_ready {
            entry.bm25.search(req.query, req.top_k)
        } else {
            Vec::new()
        };

        // Merge + dedupe by exact text, keeping the best score seen so far but
        // preserving both component scores in metadata for transparency.
        let mut by_text: HashMap<String, Candidate> = HashMap::new();
        for hit in vector_hits {
            by_text
                .entry(hit.text.clone())
                .and_modify(|c| c.vector_score = Some(c.vector_score.unwrap_or(0.0).max(hit.score)))
                .or_insert(Candidate { text: hit.text, metadata: hit.metadata, vector_score: Some(hit.score), bm25_score: None });
        }
        for hit in bm25_hits {
            by_text
                .entry(hit.text.clone())
                .and_modify(|c| c.bm25_score = Some(c.bm25_score.unwrap_or(0.0).max(hit.score)))
                .or_insert(Candidate { text: hit.text, metadata: hit.metadata, vector_score: None, bm25_score: Some(hit.score) });
        }

        let mut candidates: Vec<Candidate> = by_text.into_values().collect();
        candidates.sort_by(|a, b| {
            b.vector_score
                .partial_cmp(&a.vector_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.bm25_score.partial_cmp(&a.bm25_score).unwrap_or(std::cmp::Ordering::Equal))
        });
        candidates.truncate(self.config.max_rerank_passages);

        let mut degraded_rerank = false;
        let final_chunks = if candidates.is_empty() {
            Vec::new()
        } else {
            let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
            match self.llm.rerank(req.query, &passages).await {
                Ok(Some(scores)) => {
                    let mut scored: Vec<(f32, Candidate)> = scores.into_iter().zip(candidates).collect();
                    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                    scored
                        .into_iter()
                        .map(|(score, c)| finalize(c, score))
                        .collect()
                }
                Ok(None) | Err(AppError::Transient(_)) | Err(AppError::Timeout) => {
                    degraded_rerank = true;
                    candidates.into_iter().map(|c| { let s = c.current_score(); finalize(c, s) }).collect()
                }
                Err(e) => return Err(e),
            }
        };

        let mut chunks: Vec<RetrievedChunk> = final_chunks;
        chunks.truncate(req.final_k);

        Ok(RetrieveOutcome { chunks, bm25_unavailable: req.use_bm25 && !bm25_ready, degraded_rerank })
    }
}

fn finalize(c: Candidate, score: f32) -> RetrievedChunk {
    let mut metadata = c.metadata;
    if let Some(v) = c.vector_score {
        metadata.insert("vector_score".into(), serde_json::json!(v));
    }
    if let Some(v) = c.bm25_score {
        metadata.insert("bm25_score".into(), serde_json::json!(v));
    }
    RetrievedChunk { text: c.text, score, metadata }
}

/// Embeds a single chunk and stitches its embedding back on, used by the
/// Ingestor before handing chunks to `VectorIndex::upsert`.
pub async fn embed_chunks(llm: &dyn LlmClient, mut chunks: Vec<Chunk>) -> AppResult<Vec<Chunk>> {
    for chunk in &mut chunks {
        chunk.embedding = Some(llm.embed(&chunk.text).await?);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use crate::vector::{UpsertItem, VectorHit, VectorStore};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct FixedLlm {
        rerank_result: AppResult<Option<Vec<f32>>>,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn embed(&self, _text: &str) -> AppResult<Vec<f32>> {
            Ok(vec![0.0, 1.0])
        }
        async fn chat(&self, _messages: &[ChatMessage], _temperature: f32, _max_tokens: u32) -> AppResult<String> {
            Ok("unused".into())
        }
        async fn rerank(&self, _query: &str, passages: &[String]) -> AppResult<Option<Vec<f32>>> {
            match &self.rerank_result {
                Ok(Some(scores)) => Ok(Some(scores.iter().copied().chain(std::iter::repeat(0.0)).take(passages.len()).collect())),
                Ok(None) => Ok(None),
                Err(AppError::Transient(s)) => Err(AppError::Transient(s.clone())),
                Err(AppError::Timeout) => Err(AppError::Timeout),
                Err(_) => Ok(None),
            }
        }
    }

    struct FixedVectorStore {
        hits: Vec<VectorHit>,
    }

    #[async_trait]
    impl VectorStore for FixedVectorStore {
        async fn create_collection(&self, _collection: &str, _dim: usize) -> AppResult<()> {
            Ok(())
        }
        async fn collection_exists(&self, _collection: &str) -> AppResult<bool> {
            Ok(true)
        }
        async fn upsert(&self, _collection: &str, _items: Vec<UpsertItem>) -> AppResult<()> {
            Ok(())
        }
        async fn search(&self, _collection: &str, _query_vec: &[f32], _k: usize) -> AppResult<Vec<VectorHit>> {
            Ok(self.hits.clone())
        }
        async fn delete_by_filter(&self, _collection: &str, _key: &str, _value: &str) -> AppResult<usize> {
            Ok(0)
        }
        async fn delete_collection(&self, _collection: &str) -> AppResult<()> {
            Ok(())
        }
        async fn scroll_all(&self, _collection: &str) -> AppResult<Vec<(String, StdHashMap<String, serde_json::Value>)>> {
            Ok(Vec::new())
        }
        async fn count(&self, _collection: &str) -> AppResult<usize> {
            Ok(self.hits.len())
        }
        async fn list_collections(&self) -> AppResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn make_retriever(rerank: AppResult<Option<Vec<f32>>>, hits: Vec<VectorHit>) -> HybridRetriever {
        let config = Arc::new(crate::config::AppConfig::from_env());
        let llm: Arc<dyn LlmClient> = Arc::new(FixedLlm { rerank_result: rerank });
        let store: Arc<dyn VectorStore> = Arc::new(FixedVectorStore { hits });
        let vectors = Arc::new(crate::vector::VectorIndex::new(store));
        let registry = Arc::new(CollectionRegistry::new(std::env::temp_dir().join(format!("retriever-test-{}", uuid::Uuid::new_v4()))));
        HybridRetriever::new(config, llm, vectors, registry)
    }

    fn hit(text: &str, score: f32) -> VectorHit {
        VectorHit { text: text.into(), metadata: StdHashMap::new(), score }
    }

    #[tokio::test]
    async fn rejects_empty_query() {
        let retriever = make_retriever(Ok(None), vec![]);
        let err = retriever
            .retrieve(RetrieveRequest { query: "  ", collection: "c", top_k: 5, final_k: 3, use_bm25: false })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn rejects_final_k_above_top_k() {
        let retriever = make_retriever(Ok(None), vec![]);
        let err = retriever
            .retrieve(RetrieveRequest { query: "q", collection: "c", top_k: 3, final_k: 5, use_bm25: false })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn rerank_reorders_results() {
        let hits = vec![hit("alpha", 0.9), hit("beta", 0.5)];
        // Reranker scores "beta" above "alpha" despite vector score order.
        let retriever = make_retriever(Ok(Some(vec![0.1, 0.9])), hits);
        let outcome = retriever
            .retrieve(RetrieveRequest { query: "q", collection: "c", top_k: 5, final_k: 5, use_bm25: false })
            .await
            .unwrap();
        assert!(!outcome.degraded_rerank);
        assert_eq!(outcome.chunks[0].text, "beta");
        assert_eq!(outcome.chunks[1].text, "alpha");
    }

    #[tokio::test]
    async fn transient_rerank_failure_degrades_to_component_scores() {
        let hits = vec![hit("alpha", 0.9), hit("beta", 0.5)];
        let retriever = make_retriever(Err(AppError::Transient("reranker down".into())), hits);
        let outcome = retriever
            .retrieve(RetrieveRequest { query: "q", collection: "c", top_k: 5, final_k: 5, use_bm25: false })
            .await
            .unwrap();
        assert!(outcome.degraded_rerank);
        assert_eq!(outcome.chunks[0].text, "alpha");
    }

    #[tokio::test]
    async fn final_k_truncates_after_rerank() {
        let hits = vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7)];
        let retriever = make_retriever(Ok(None), hits);
        let outcome = retriever
            .retrieve(RetrieveRequest { query: "q", collection: "c", top_k: 5, final_k: 2, use_bm25: false })
            .await
            .unwrap();
        assert_eq!(outcome.chunks.len(), 2);
    }
}
