use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let public_routes = Router::new()
        .route("/healthz", get(routes::health::health_check))
        .route("/readyz", get(routes::health::readiness_check));

    let protected_routes = Router::new()
        .route("/shutdown", post(routes::health::shutdown_handler))
        .route("/ingest", post(routes::ingest::ingest))
        .route("/document/{doc_id}", delete(routes::ingest::delete_document))
        .route("/search", post(routes::search::search))
        .route("/chat", post(routes::chat::chat))
        .route("/collections", get(routes::collections::list_collections))
        .route("/collection/{name}", delete(routes::collections::delete_collection))
        .route("/build-bm25/{collection}", post(routes::search::build_bm25))
        .route("/bm25/{collection}", delete(routes::search::delete_bm25))
        .route("/ws", get(ws_handler))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Validates `X-API-Key` against `AppConfig::api_key`. When no key is
/// configured, auth is skipped (development mode).
async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    let Some(expected) = &state.config.api_key else {
        return Ok(next.run(req).await);
    };

    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    match provided {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => {
            tracing::warn!("missing or mismatched X-API-Key, rejecting request");
            Err((StatusCode::UNAUTHORIZED, axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401}))))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Broadcasts `ServerEvent`s to connected clients. This is a one-way feed —
/// there's no client->server command surface, since ingestion/search are
/// driven entirely by HTTP and mail, not by interactive browser commands.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("websocket client connected");
    let mut rx = state.event_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("websocket client lagged, skipped {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::info!("websocket client disconnected");
}
