use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub api_key: Option<String>,
    pub data_dir: String,
    pub archive_root: String,
    pub bm25_index_root: String,

    pub worker_count: usize,
    pub worker_queue_size: usize,
    pub poll_interval_secs: u64,

    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub max_top_k: usize,
    pub max_query_chars: usize,
    pub max_rerank_passages: usize,
    pub use_bm25_default: bool,

    pub request_timeout_secs: u64,
    pub max_retries: u32,

    pub default_workspace: String,
    pub default_system_prompt: String,
    /// Per-collection system prompt overrides, keyed by collection name.
    pub collection_prompts: HashMap<String, String>,
    /// Per-collection sampling temperature overrides.
    pub collection_temperatures: HashMap<String, f32>,

    pub routing_rules_path: String,

    pub llm_base_url: String,
    pub vector_store_base_url: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port: u16 = env_or("MAILRAG_PORT", 8080);

        let data_dir = std::env::var("MAILRAG_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("mailrag").to_string_lossy().to_string())
                .unwrap_or_else(|| ".mailrag-data".to_string())
        });

        let collection_prompts = std::env::var("MAILRAG_COLLECTION_PROMPTS")
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(&raw).ok())
            .unwrap_or_default();

        let collection_temperatures = std::env::var("MAILRAG_COLLECTION_TEMPERATURES")
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, f32>>(&raw).ok())
            .unwrap_or_default();

        Self {
            listen_addr: format!("0.0.0.0:{}", port),
            api_key: std::env::var("MAILRAG_API_KEY").ok().filter(|t| !t.is_empty()),
            archive_root: std::env::var("MAILRAG_ARCHIVE_ROOT")
                .unwrap_or_else(|_| format!("{}/archive", data_dir)),
            bm25_index_root: std::env::var("MAILRAG_BM25_ROOT")
                .unwrap_or_else(|_| format!("{}/bm25", data_dir)),
            data_dir,

            worker_count: env_or("MAILRAG_WORKER_COUNT", 4),
            worker_queue_size: env_or("MAILRAG_WORKER_QUEUE_SIZE", 256),
            poll_interval_secs: env_or("MAILRAG_POLL_INTERVAL_SECS", 30),

            chunk_size: env_or("MAILRAG_CHUNK_SIZE", 1000),
            chunk_overlap: env_or("MAILRAG_CHUNK_OVERLAP", 150),

            max_top_k: env_or("MAILRAG_MAX_TOP_K", 50),
            max_query_chars: env_or("MAILRAG_MAX_QUERY_CHARS", 4000),
            max_rerank_passages: env_or("MAILRAG_MAX_RERANK_PASSAGES", 30),
            use_bm25_default: env_or("MAILRAG_USE_BM25_DEFAULT", true),

            request_timeout_secs: env_or("MAILRAG_REQUEST_TIMEOUT_SECS", 30),
            max_retries: env_or("MAILRAG_MAX_RETRIES", 3),

            default_workspace: std::env::var("MAILRAG_DEFAULT_WORKSPACE")
                .unwrap_or_else(|_| "general".to_string()),
            default_system_prompt: std::env::var("MAILRAG_DEFAULT_SYSTEM_PROMPT").unwrap_or_else(|_| {
                "Answer the question using only the provided context. If the context does \
                 not contain enough information, say so explicitly instead of guessing."
                    .to_string()
            }),
            collection_prompts,
            collection_temperatures,

            routing_rules_path: std::env::var("MAILRAG_ROUTING_RULES_PATH")
                .unwrap_or_else(|_| "routing.json".to_string()),

            llm_base_url: std::env::var("MAILRAG_LLM_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:1234/v1".to_string()),
            vector_store_base_url: std::env::var("MAILRAG_VECTOR_STORE_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
        }
    }
}
