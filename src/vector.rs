//! External-collaborator contract for the dense vector store, plus the
//! VectorIndex facade (C3) that infers/enforces per-collection embedding
//! dimensionality on top of it.
//!
//! Out of scope: the ANN engine itself. `HttpVectorStore` talks to a
//! Qdrant-style REST API behind a manager-style facade that hides the
//! concrete backend; the facade owns dimension bookkeeping and the HTTP
//! client rather than an in-process model and on-disk index.

use crate::chunker::Chunk;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub text: String,
    pub metadata: HashMap<String, Value>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertItem {
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: HashMap<String, Value>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(&self, collection: &str, dim: usize) -> AppResult<()>;
    async fn collection_exists(&self, collection: &str) -> AppResult<bool>;
    async fn upsert(&self, collection: &str, items: Vec<UpsertItem>) -> AppResult<()>;
    async fn search(&self, collection: &str, query_vec: &[f32], k: usize) -> AppResult<Vec<VectorHit>>;
    async fn delete_by_filter(&self, collection: &str, filter_key: &str, filter_value: &str) -> AppResult<usize>;
    async fn delete_collection(&self, collection: &str) -> AppResult<()>;
    async fn scroll_all(&self, collection: &str) -> AppResult<Vec<(String, HashMap<String, Value>)>>;
    async fn count(&self, collection: &str) -> AppResult<usize>;
    async fn list_collections(&self) -> AppResult<Vec<String>>;
}

pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpVectorStore {
    pub fn new(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: config.vector_store_base_url.clone(),
            retry: RetryPolicy { max_retries: config.max_retries, ..Default::default() },
        }
    }

    fn classify(status: reqwest::StatusCode) -> AppError {
        if status.is_server_error() {
            AppError::Transient(format!("vector store returned {status}"))
        } else {
            AppError::BadRequest(format!("vector store returned {status}"))
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> AppResult<reqwest::Response> {
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout
            } else {
                AppError::Transient(e.to_string())
            }
        })
    }

    /// Exact count of points matching `filter`, used so `delete_by_filter` can
    /// report how many points it actually removed instead of guessing.
    async fn count_matching(&self, collection: &str, filter: &Value) -> AppResult<usize> {
        let url = format!("{}/collections/{}/points/count", self.base_url, collection);
        let body = serde_json::json!({ "filter": filter, "exact": true });
        let resp = self.retry.run(|| async { self.send(self.client.post(&url).json(&body)).await }).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        #[derive(Deserialize)]
        struct CountResult {
            count: usize,
        }
        #[derive(Deserialize)]
        struct CountResponse {
            result: CountResult,
        }
        let parsed: CountResponse = resp.json().await.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(parsed.result.count)
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn create_collection(&self, collection: &str, dim: usize) -> AppResult<()> {
        let url = format!("{}/collections/{}", self.base_url, collection);
        let resp = self
            .send(self.client.put(&url).json(&serde_json::json!({
                "vectors": { "size": dim, "distance": "Cosine" }
            })))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> AppResult<bool> {
        let url = format!("{}/collections/{}", self.base_url, collection);
        let resp = self.retry.run(|| async { self.send(self.client.get(&url)).await }).await?;
        Ok(resp.status().is_success())
    }

    async fn upsert(&self, collection: &str, items: Vec<UpsertItem>) -> AppResult<()> {
        let url = format!("{}/collections/{}/points", self.base_url, collection);
        let points: Vec<Value> = items
            .into_iter()
            .map(|item| {
                let mut payload = item.metadata;
                payload.insert("text".into(), Value::String(item.text));
                serde_json::json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "vector": item.vector,
                    "payload": payload,
                })
            })
            .collect();

        let body = serde_json::json!({ "points": points });
        // PUT isn't in the retryable verb set (§5/§7): a point upsert isn't safe
        // to blindly replay on a transient failure we didn't confirm landed.
        let resp = self.send(self.client.put(&url).json(&body)).await?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        Ok(())
    }

    async fn search(&self, collection: &str, query_vec: &[f32], k: usize) -> AppResult<Vec<VectorHit>> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection);
        let body = serde_json::json!({
            "vector": query_vec,
            "limit": k,
            "with_payload": true,
        });
        let resp = self
            .retry
            .run(|| async { self.send(self.client.post(&url).json(&body)).await })
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }

        #[derive(Deserialize)]
        struct SearchResult {
            score: f32,
            payload: HashMap<String, Value>,
        }
        #[derive(Deserialize)]
        struct SearchResponse {
            result: Vec<SearchResult>,
        }

        let parsed: SearchResponse = resp.json().await.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(parsed
            .result
            .into_iter()
            .map(|r| {
                let mut metadata = r.payload;
                let text = metadata.remove("text").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
                VectorHit { text, metadata, score: r.score }
            })
            .collect())
    }

    async fn delete_by_filter(&self, collection: &str, filter_key: &str, filter_value: &str) -> AppResult<usize> {
        let filter = serde_json::json!({ "must": [ { "key": filter_key, "match": { "value": filter_value } } ] });

        let matched = self.count_matching(collection, &filter).await?;
        if matched == 0 {
            return Ok(0);
        }

        let url = format!("{}/collections/{}/points/delete", self.base_url, collection);
        let resp = self
            .retry
            .run(|| async { self.send(self.client.post(&url).json(&serde_json::json!({ "filter": filter }))).await })
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        Ok(matched)
    }

    async fn delete_collection(&self, collection: &str) -> AppResult<()> {
        let url = format!("{}/collections/{}", self.base_url, collection);
        let resp = self.retry.run(|| async { self.send(self.client.delete(&url)).await }).await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::classify(resp.status()));
        }
        Ok(())
    }

    async fn scroll_all(&self, collection: &str) -> AppResult<Vec<(String, HashMap<String, Value>)>> {
        let url = format!("{}/collections/{}/points/scroll", self.base_url, collection);
        let mut out = Vec::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = serde_json::json!({ "limit": 256, "with_payload": true });
            if let Some(o) = &offset {
                body["offset"] = o.clone();
            }
            let resp = self.retry.run(|| async { self.send(self.client.post(&url).json(&body)).await }).await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                break;
            }
            if !resp.status().is_success() {
                return Err(Self::classify(resp.status()));
            }

            #[derive(Deserialize)]
            struct ScrollPoint {
                payload: HashMap<String, Value>,
            }
            #[derive(Deserialize)]
            struct ScrollResult {
                points: Vec<ScrollPoint>,
                next_page_offset: Option<Value>,
            }
            #[derive(Deserialize)]
            struct ScrollResponse {
                result: ScrollResult,
            }

            let parsed: ScrollResponse = resp.json().await.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            for p in parsed.result.points {
                let mut metadata = p.payload;
                let text = metadata.remove("text").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
                out.push((text, metadata));
            }

            match parsed.result.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }

        Ok(out)
    }

    async fn count(&self, collection: &str) -> AppResult<usize> {
        let url = format!("{}/collections/{}/points/count", self.base_url, collection);
        let body = serde_json::json!({ "exact": true });
        let resp = self.retry.run(|| async { self.send(self.client.post(&url).json(&body)).await }).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        #[derive(Deserialize)]
        struct CountResult {
            count: usize,
        }
        #[derive(Deserialize)]
        struct CountResponse {
            result: CountResult,
        }
        let parsed: CountResponse = resp.json().await.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(parsed.result.count)
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let url = format!("{}/collections", self.base_url);
        let resp = self.retry.run(|| async { self.send(self.client.get(&url)).await }).await?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        #[derive(Deserialize)]
        struct CollectionDesc {
            name: String,
        }
        #[derive(Deserialize)]
        struct CollectionsResult {
            collections: Vec<CollectionDesc>,
        }
        #[derive(Deserialize)]
        struct CollectionsResponse {
            result: CollectionsResult,
        }
        let parsed: CollectionsResponse = resp.json().await.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(parsed.result.collections.into_iter().map(|c| c.name).collect())
    }
}

/// Tracks the embedding dimension each collection was created with so a
/// mismatched later upsert fails fast rather than corrupting the store.
pub struct VectorIndex {
    store: std::sync::Arc<dyn VectorStore>,
    dims: DashMap<String, usize>,
}

impl VectorIndex {
    pub fn new(store: std::sync::Arc<dyn VectorStore>) -> Self {
        Self { store, dims: DashMap::new() }
    }

    /// Upserts in batches of at most 100. On success, `Ok(count)` is every
    /// chunk written. On a mid-batch failure, `Err((error, written))` reports
    /// how many chunks were already committed in prior batches — those stay
    /// in place, there's no rollback, so the caller can report a partial
    /// outcome instead of pretending nothing happened. A dimension mismatch
    /// is caught before any batch goes out, so it always carries `written: 0`.
    pub async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<usize, (AppError, usize)> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let dim = chunks[0].embedding.as_ref().map(|e| e.len()).unwrap_or(0);
        if dim == 0 {
            return Err((AppError::InvalidArgument("chunk is missing an embedding".into()), 0));
        }

        let expected = *self.dims.entry(collection.to_string()).or_insert(dim);
        if expected != dim {
            return Err((AppError::DimensionMismatch { expected, actual: dim }, 0));
        }
        for c in chunks {
            let got = c.embedding.as_ref().map(|e| e.len()).unwrap_or(0);
            if got != expected {
                return Err((AppError::DimensionMismatch { expected, actual: got }, 0));
            }
        }

        if !self.store.collection_exists(collection).await.map_err(|e| (e, 0))? {
            self.store.create_collection(collection, dim).await.map_err(|e| (e, 0))?;
        }

        let mut written = 0;
        for batch in chunks.chunks(100) {
            let items = batch
                .iter()
                .map(|c| UpsertItem {
                    vector: c.embedding.clone().unwrap_or_default(),
                    text: c.text.clone(),
                    metadata: c.metadata.clone(),
                })
                .collect();
            if let Err(e) = self.store.upsert(collection, items).await {
                return Err((e, written));
            }
            written += batch.len();
        }
        Ok(written)
    }

    pub async fn search(&self, collection: &str, query_vec: &[f32], k: usize) -> AppResult<Vec<VectorHit>> {
        self.store.search(collection, query_vec, k).await
    }

    /// Tries `doc_id`, then `uid`, then `message_id` until one matches.
    pub async fn delete_by_doc_keys(&self, collection: &str, value: &str) -> AppResult<usize> {
        for key in ["doc_id", "uid", "message_id"] {
            let count = self.store.delete_by_filter(collection, key, value).await?;
            if count > 0 {
                return Ok(count);
            }
        }
        Ok(0)
    }

    pub async fn delete_collection(&self, collection: &str) -> AppResult<()> {
        self.dims.remove(collection);
        self.store.delete_collection(collection).await
    }

    pub async fn scroll_all(&self, collection: &str) -> AppResult<Vec<(String, HashMap<String, Value>)>> {
        self.store.scroll_all(collection).await
    }

    pub async fn count(&self, collection: &str) -> AppResult<usize> {
        self.store.count(collection).await
    }

    pub async fn list_collections(&self) -> AppResult<Vec<String>> {
        self.store.list_collections().await
    }
}
