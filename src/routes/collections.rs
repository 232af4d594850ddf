use crate::error::AppResult;
use crate::state::{AppState, ServerEvent};
use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    pub name: String,
    pub bm25_ready: bool,
    pub bm25_doc_count: usize,
}

pub async fn list_collections(State(state): State<AppState>) -> AppResult<Json<Vec<CollectionSummary>>> {
    let names = state.registry.list_names();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let entry = state.registry.get(&name)?;
        out.push(CollectionSummary { name, bm25_ready: entry.bm25.is_ready(), bm25_doc_count: entry.bm25.doc_count() });
    }
    Ok(Json(out))
}

pub async fn delete_collection(State(state): State<AppState>, Path(name): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.vectors.delete_collection(&name).await?;
    let removed = state.registry.delete(&name)?;
    if removed {
        let _ = state.event_tx.send(ServerEvent::CollectionDeleted { collection: name.clone() });
    }
    Ok(Json(serde_json::json!({ "collection": name, "deleted": removed })))
}
