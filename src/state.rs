use crate::answer::AnswerGenerator;
use crate::archive::ArchiveStore;
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::ingest::Ingestor;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::mail::{FileMailTransport, MailTransport};
use crate::registry::CollectionRegistry;
use crate::retriever::HybridRetriever;
use crate::scheduler::{JobProcessor, JobScheduler};
use crate::vector::{HttpVectorStore, VectorIndex, VectorStore};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events broadcast to connected WebSocket clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "ingest_completed")]
    IngestCompleted { collection: String, doc_id: String, chunks_written: usize },
    #[serde(rename = "ingest_failed")]
    IngestFailed { collection: String, doc_id: String, error: String },
    #[serde(rename = "bm25_rebuild_completed")]
    Bm25RebuildCompleted { collection: String, doc_count: usize },
    #[serde(rename = "collection_deleted")]
    CollectionDeleted { collection: String },
    #[serde(rename = "mail_job_enqueued")]
    MailJobEnqueued { uid: u32, collection: String },
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<CollectionRegistry>,
    pub vectors: Arc<VectorIndex>,
    pub llm: Arc<dyn LlmClient>,
    pub archive: Arc<ArchiveStore>,
    pub ingestor: Arc<Ingestor>,
    pub retriever: Arc<HybridRetriever>,
    pub answerer: Arc<AnswerGenerator>,
    pub scheduler: Arc<JobScheduler>,
    pub mail_transport: Arc<dyn MailTransport>,
    pub event_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        let config = Arc::new(config);

        tokio::fs::create_dir_all(&config.data_dir).await?;
        tokio::fs::create_dir_all(&config.archive_root).await?;
        tokio::fs::create_dir_all(&config.bm25_index_root).await?;

        let registry = Arc::new(CollectionRegistry::new(std::path::PathBuf::from(&config.bm25_index_root)));
        let vector_store: Arc<dyn VectorStore> = Arc::new(HttpVectorStore::new(&config));
        let vectors = Arc::new(VectorIndex::new(vector_store));
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config));
        let archive = Arc::new(ArchiveStore::new(&config.archive_root));

        let ingestor = Arc::new(Ingestor::new(config.clone(), llm.clone(), vectors.clone(), registry.clone(), event_tx.clone()));
        let retriever = Arc::new(HybridRetriever::new(config.clone(), llm.clone(), vectors.clone(), registry.clone()));
        let answerer = Arc::new(AnswerGenerator::new(config.clone(), llm.clone()));

        let mail_transport: Arc<dyn MailTransport> = Arc::new(FileMailTransport::new(
            format!("{}/inbox", config.data_dir),
            format!("{}/outbox.jsonl", config.data_dir),
        ));

        let processor = Arc::new(JobProcessor {
            ingestor: ingestor.clone(),
            retriever: retriever.clone(),
            answerer: answerer.clone(),
            mail: mail_transport.clone(),
            top_k: config.max_top_k,
            final_k: 5,
            use_bm25_default: config.use_bm25_default,
        });
        let scheduler = JobScheduler::start(config.worker_count, config.worker_queue_size, processor);

        Ok(Self { config, registry, vectors, llm, archive, ingestor, retriever, answerer, scheduler, mail_transport, event_tx })
    }
}
