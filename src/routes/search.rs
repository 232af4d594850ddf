use crate::error::AppResult;
use crate::retriever::RetrieveRequest;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub collection: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub final_k: Option<usize>,
    #[serde(default)]
    pub use_bm25: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub chunks: Vec<crate::retriever::RetrievedChunk>,
    pub bm25_unavailable: bool,
    pub degraded_rerank: bool,
}

pub async fn search(State(state): State<AppState>, Json(body): Json<SearchBody>) -> AppResult<Json<SearchResponse>> {
    let outcome = state
        .retriever
        .retrieve(RetrieveRequest {
            query: &body.query,
            collection: &body.collection,
            top_k: body.top_k.unwrap_or(state.config.max_top_k),
            final_k: body.final_k.unwrap_or(5),
            use_bm25: body.use_bm25.unwrap_or(state.config.use_bm25_default),
        })
        .await?;

    Ok(Json(SearchResponse { chunks: outcome.chunks, bm25_unavailable: outcome.bm25_unavailable, degraded_rerank: outcome.degraded_rerank }))
}

pub async fn build_bm25(
    State(state): State<AppState>,
    axum::extract::Path(collection): axum::extract::Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.ingestor.request_bm25_rebuild(&collection);
    // The rebuild runs in the background; subscribe to `Bm25RebuildCompleted`
    // over the websocket feed for the real doc count once it finishes.
    Ok(Json(serde_json::json!({ "collection": collection, "status": "rebuild_queued" })))
}

pub async fn delete_bm25(
    State(state): State<AppState>,
    axum::extract::Path(collection): axum::extract::Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let entry = state.registry.get_or_create(&collection);
    entry.bm25.delete()?;
    Ok(Json(serde_json::json!({ "collection": collection, "bm25_ready": false })))
}
