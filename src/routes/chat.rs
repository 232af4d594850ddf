use crate::error::AppResult;
use crate::retriever::RetrieveRequest;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub question: String,
    pub collection: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub final_k: Option<usize>,
}

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> AppResult<Json<crate::answer::Answer>> {
    let outcome = state
        .retriever
        .retrieve(RetrieveRequest {
            query: &body.question,
            collection: &body.collection,
            top_k: body.top_k.unwrap_or(state.config.max_top_k),
            final_k: body.final_k.unwrap_or(5),
            use_bm25: state.config.use_bm25_default,
        })
        .await?;

    let answer = state
        .answerer
        .answer(&body.collection, &body.question, outcome.chunks, outcome.degraded_rerank, outcome.bm25_unavailable)
        .await?;

    Ok(Json(answer))
}
