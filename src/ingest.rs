//! Ingestor (C5): chunk -> embed -> upsert -> coalesced BM25 rebuild request.

use crate::chunker;
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::llm::LlmClient;
use crate::registry::CollectionRegistry;
use crate::retriever::embed_chunks;
use crate::state::ServerEvent;
use crate::vector::VectorIndex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Complete,
    /// A batch upsert failed partway through; `chunks_written` batches are
    /// already committed and stay in place (no rollback). The caller should
    /// treat this as a retryable gap, not a clean failure.
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub collection: String,
    pub chunks_written: usize,
    pub rebuild_queued: bool,
    pub status: IngestStatus,
}

pub struct IngestRequest {
    pub doc_id: String,
    pub collection: String,
    pub text: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct Ingestor {
    config: Arc<AppConfig>,
    llm: Arc<dyn LlmClient>,
    vectors: Arc<VectorIndex>,
    registry: Arc<CollectionRegistry>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl Ingestor {
    pub fn new(
        config: Arc<AppConfig>,
        llm: Arc<dyn LlmClient>,
        vectors: Arc<VectorIndex>,
        registry: Arc<CollectionRegistry>,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self { config, llm, vectors, registry, event_tx }
    }

    pub async fn ingest(&self, req: IngestRequest) -> AppResult<IngestOutcome> {
        let mut base_metadata = req.metadata.clone();
        base_metadata.insert("doc_id".into(), serde_json::json!(req.doc_id));

        let chunks = chunker::chunk(&req.text, &base_metadata, self.config.chunk_size, self.config.chunk_overlap)?;

        let chunks = embed_chunks(self.llm.as_ref(), chunks).await?;

        let (written, status) = match self.vectors.upsert(&req.collection, &chunks).await {
            Ok(n) => (n, IngestStatus::Complete),
            Err((e, n)) if n > 0 => {
                warn!(
                    doc_id = %req.doc_id, collection = %req.collection, error = %e, written = n,
                    "ingest batch failed partway, already-written batches are kept"
                );
                (n, IngestStatus::Partial)
            }
            Err((e, _)) => return Err(e),
        };

        let rebuild_queued = if written > 0 { self.request_bm25_rebuild(&req.collection) } else { false };

        info!(doc_id = %req.doc_id, collection = %req.collection, written, ?status, "ingested document");
        Ok(IngestOutcome { doc_id: req.doc_id, collection: req.collection, chunks_written: written, rebuild_queued, status })
    }

    /// Marks the collection dirty and spawns a background rebuild task if one
    /// isn't already running for this collection; otherwise the running
    /// rebuild's finishing pass picks up the dirty bit, coalescing any number
    /// of concurrent ingests into at most one extra rebuild. Never blocks the
    /// caller on the scroll+build itself, and a scroll/build failure is logged
    /// rather than surfaced — the next ingest's dirty mark will retry it.
    pub fn request_bm25_rebuild(&self, collection: &str) -> bool {
        let entry = self.registry.get_or_create(collection);
        entry.dirty.store(true, Ordering::Release);

        let vectors = self.vectors.clone();
        let event_tx = self.event_tx.clone();
        let collection = collection.to_string();
        tokio::spawn(async move {
            let Ok(_guard) = entry.rebuild_lock.try_lock() else {
                return;
            };

            loop {
                if !entry.dirty.swap(false, Ordering::AcqRel) {
                    break;
                }
                let docs = match vectors.scroll_all(&collection).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(collection, error = %e, "bm25 rebuild scroll failed, will retry on next dirty mark");
                        break;
                    }
                };
                let bm_docs = docs
                    .into_iter()
                    .map(|(text, metadata)| crate::bm25::BmDocument {
                        doc_id: metadata.get("doc_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        text,
                        metadata,
                    })
                    .collect::<Vec<_>>();

                if bm_docs.is_empty() {
                    warn!(collection, "skipping bm25 rebuild, no chunks found in vector store");
                    continue;
                }
                match entry.bm25.build(bm_docs) {
                    Ok(count) => {
                        info!(collection, count, "bm25 index rebuilt");
                        let _ = event_tx.send(ServerEvent::Bm25RebuildCompleted { collection: collection.clone(), doc_count: count });
                    }
                    Err(e) => warn!(collection, error = %e, "bm25 rebuild failed"),
                }
            }
        });
        true
    }

    pub async fn delete_document(&self, collection: &str, doc_id: &str) -> AppResult<usize> {
        let deleted = self.vectors.delete_by_doc_keys(collection, doc_id).await?;
        if deleted > 0 {
            self.request_bm25_rebuild(collection);
        }
        Ok(deleted)
    }
}
