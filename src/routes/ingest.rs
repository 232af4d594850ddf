use crate::error::{AppError, AppResult};
use crate::ingest::IngestRequest;
use crate::state::{AppState, ServerEvent};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub doc_id: String,
    pub collection: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

pub async fn ingest(State(state): State<AppState>, Json(body): Json<IngestBody>) -> AppResult<Json<serde_json::Value>> {
    if body.doc_id.trim().is_empty() {
        return Err(AppError::InvalidArgument("doc_id must not be empty".into()));
    }
    if body.collection.trim().is_empty() {
        return Err(AppError::InvalidArgument("collection must not be empty".into()));
    }

    let result = state
        .ingestor
        .ingest(IngestRequest {
            doc_id: body.doc_id.clone(),
            collection: body.collection.clone(),
            text: body.text,
            metadata: body.metadata,
        })
        .await;

    match result {
        Ok(outcome) => {
            let _ = state.event_tx.send(ServerEvent::IngestCompleted {
                collection: outcome.collection.clone(),
                doc_id: outcome.doc_id.clone(),
                chunks_written: outcome.chunks_written,
            });
            Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
        }
        Err(e) => {
            let _ = state.event_tx.send(ServerEvent::IngestFailed {
                collection: body.collection,
                doc_id: body.doc_id,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteDocQuery {
    pub collection: String,
}

pub async fn delete_document(
    State(state): State<AppState>,
    axum::extract::Path(doc_id): axum::extract::Path<String>,
    axum::extract::Query(query): axum::extract::Query<DeleteDocQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let deleted = state.ingestor.delete_document(&query.collection, &doc_id).await?;
    Ok(Json(serde_json::json!({ "deleted_chunks": deleted })))
}
