//! JobScheduler (C7): bounded MPMC queue + worker pool. MailLoop is the only
//! producer; `enqueue` blocking when the queue is full is the deliberate
//! backpressure mechanism that throttles IMAP polling.

use crate::answer::AnswerGenerator;
use crate::ingest::{IngestRequest, Ingestor};
use crate::mail::MailTransport;
use crate::retriever::{HybridRetriever, RetrieveRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub enum Job {
    Ingest {
        uid: u32,
        archive_id: String,
        collection: String,
        subject: String,
        sender: String,
        body: String,
        /// System-generated mail (digests, bounces) never gets a reply.
        synthetic: bool,
    },
    Query {
        uid: u32,
        archive_id: String,
        collection: String,
        subject: String,
        sender: String,
        question: String,
        synthetic: bool,
    },
}

/// Dispatches a single job to the ingestion or retrieval+answer path and
/// replies via the mail transport. Worker exceptions are logged, never
/// retried automatically — at-least-once is achieved by manual re-ingestion
/// of the archived copy.
pub struct JobProcessor {
    pub ingestor: Arc<Ingestor>,
    pub retriever: Arc<HybridRetriever>,
    pub answerer: Arc<AnswerGenerator>,
    pub mail: Arc<dyn MailTransport>,
    pub top_k: usize,
    pub final_k: usize,
    pub use_bm25_default: bool,
}

impl JobProcessor {
    async fn process(&self, job: Job) {
        match job {
            Job::Ingest { uid, archive_id, collection, subject, sender, body, synthetic } => {
                let result = self
                    .ingestor
                    .ingest(IngestRequest {
                        doc_id: archive_id.clone(),
                        collection: collection.clone(),
                        text: body,
                        metadata: HashMap::from([
                            ("subject".into(), serde_json::json!(subject)),
                            ("sender".into(), serde_json::json!(sender)),
                            ("uid".into(), serde_json::json!(uid)),
                        ]),
                    })
                    .await;

                match result {
                    Ok(outcome) => {
                        info!(uid, collection, chunks = outcome.chunks_written, status = ?outcome.status, "ingest job completed");
                        let body = match outcome.status {
                            crate::ingest::IngestStatus::Complete => format!(
                                "Indexed {} chunk(s) into workspace '{}'.",
                                outcome.chunks_written, collection
                            ),
                            crate::ingest::IngestStatus::Partial => format!(
                                "Indexed {} chunk(s) into workspace '{}' before a batch failed; re-send this message to finish indexing the rest.",
                                outcome.chunks_written, collection
                            ),
                        };
                        if !synthetic {
                            self.reply(&sender, &subject, &body).await;
                        }
                    }
                    Err(e) => {
                        error!(uid, collection, error = %e, "ingest job failed");
                        if !synthetic {
                            self.reply(&sender, &subject, &format!("Ingestion failed: {e}")).await;
                        }
                    }
                }
            }
            Job::Query { uid, collection, subject, sender, question, synthetic, .. } => {
                let outcome = self
                    .retriever
                    .retrieve(RetrieveRequest {
                        query: &question,
                        collection: &collection,
                        top_k: self.top_k,
                        final_k: self.final_k,
                        use_bm25: self.use_bm25_default,
                    })
                    .await;

                let outcome = match outcome {
                    Ok(o) => o,
                    Err(e) => {
                        error!(uid, collection, error = %e, "retrieval failed");
                        if !synthetic {
                            self.reply(&sender, &subject, &format!("Search failed: {e}")).await;
                        }
                        return;
                    }
                };

                let answer = self
                    .answerer
                    .answer(&collection, &question, outcome.chunks, outcome.degraded_rerank, outcome.bm25_unavailable)
                    .await;

                if synthetic {
                    return;
                }
                match answer {
                    Ok(a) => self.reply(&sender, &subject, &a.text).await,
                    Err(e) => {
                        error!(uid, collection, error = %e, "answer generation failed");
                        self.reply(&sender, &subject, &format!("Could not generate an answer: {e}")).await;
                    }
                }
            }
        }
    }

    async fn reply(&self, to: &str, subject: &str, body: &str) {
        let reply_subject = format!("Re: {subject}");
        if let Err(e) = self.mail.send_reply(to, &reply_subject, body).await {
            error!(to, error = %e, "failed to send reply");
        }
    }
}

pub struct JobScheduler {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn start(worker_count: usize, queue_size: usize, processor: Arc<JobProcessor>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for id in 0..worker_count.max(1) {
            let rx = rx.clone();
            let processor = processor.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => processor.process(job).await,
                        None => {
                            info!(worker_id = id, "job scheduler worker exiting, queue closed");
                            break;
                        }
                    }
                }
            }));
        }

        Arc::new(Self { tx: Mutex::new(Some(tx)), workers: Mutex::new(workers) })
    }

    /// Blocks when the queue is full — the deliberate backpressure the mail
    /// loop relies on. Fails immediately once `shutdown` has been called.
    pub async fn enqueue(&self, job: Job) -> Result<(), Job> {
        let tx = { self.tx.lock().await.clone() };
        match tx {
            Some(tx) => tx.send(job).await.map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Stops accepting new jobs and waits for in-flight and already-queued
    /// jobs to drain, up to `deadline`.
    pub async fn shutdown(&self, deadline: std::time::Duration) {
        self.tx.lock().await.take();

        let mut workers = self.workers.lock().await;
        let handles = std::mem::take(&mut *workers);
        let joined = tokio::time::timeout(deadline, futures_util::future::join_all(handles)).await;
        if joined.is_err() {
            error!("job scheduler shutdown deadline exceeded, some jobs may have been abandoned");
        }
    }
}
