use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::sync::Notify;

static START_TIME: OnceLock<Instant> = OnceLock::new();
static SHUTDOWN_NOTIFY: OnceLock<Arc<Notify>> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub fn init_shutdown_notify() -> Arc<Notify> {
    SHUTDOWN_NOTIFY.get_or_init(|| Arc::new(Notify::new())).clone()
}

pub async fn wait_for_shutdown() {
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notified().await;
    } else {
        std::future::pending::<()>().await;
    }
}

pub async fn health_check() -> Json<Value> {
    let uptime = START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0);
    Json(json!({
        "status": "ok",
        "service": "mailrag-core",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
    }))
}

/// Distinct from `/health`: confirms the process can actually serve traffic
/// (config loaded, registry constructed), not just that it's alive.
pub async fn readiness_check(
    axum::extract::State(state): axum::extract::State<crate::state::AppState>,
) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "collections": state.registry.list_names().len(),
    }))
}

pub async fn shutdown_handler() -> Json<Value> {
    tracing::info!("shutdown requested via HTTP endpoint");
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notify_one();
    }
    Json(json!({ "status": "shutting_down" }))
}
