//! MailLoop (C8): polls a mail source, advances a persistent UID cursor,
//! and enqueues jobs. The UID cursor advances *at enqueue time*, not at job
//! completion — the archived copy under `archive_id` is the durable record,
//! so re-ingestion on failure is a manual replay rather than automatic retry.

use crate::archive::{ArchiveRecord, ArchiveStore};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::registry::CollectionRegistry;
use crate::router::{self, EmailFields, RoutingRuleSet};
use crate::scheduler::{Job, JobScheduler};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub subject: String,
    pub sender: String,
    pub body: String,
    /// Mirrors an `X-Mailrag-Synthetic` header a real transport would see on
    /// system-generated mail (digests, bounce notices, self-replies). Never
    /// reply to one of these — doing so risks a reply loop.
    pub synthetic: bool,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Returns messages with UID strictly greater than `since_uid`, in
    /// ascending UID order.
    async fn fetch_new_messages(&self, since_uid: u32) -> AppResult<Vec<RawMessage>>;
    async fn send_reply(&self, to: &str, subject: &str, body: &str) -> AppResult<()>;
}

/// Wiring boundary for a real IMAP/SMTP backend. Connection handling, folder
/// selection, and MIME parsing are out of scope here (§1 Non-goals) — this
/// type exists so `main.rs` has somewhere to plug a concrete transport in
/// without the rest of the system depending on IMAP/SMTP crates directly.
pub struct ImapSmtpTransport {
    pub imap_host: String,
    pub smtp_host: String,
}

#[async_trait]
impl MailTransport for ImapSmtpTransport {
    async fn fetch_new_messages(&self, _since_uid: u32) -> AppResult<Vec<RawMessage>> {
        Err(AppError::Internal(anyhow::anyhow!(
            "ImapSmtpTransport is a wiring boundary; configure a concrete IMAP backend before use"
        )))
    }

    async fn send_reply(&self, _to: &str, _subject: &str, _body: &str) -> AppResult<()> {
        Err(AppError::Internal(anyhow::anyhow!(
            "ImapSmtpTransport is a wiring boundary; configure a concrete SMTP backend before use"
        )))
    }
}

/// Dev/test transport: inbound messages are JSON files dropped into
/// `inbox_dir`; outbound replies are appended as JSON lines to `outbox_path`.
pub struct FileMailTransport {
    inbox_dir: PathBuf,
    outbox_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct InboxMessage {
    uid: u32,
    subject: String,
    sender: String,
    body: String,
    /// Stand-in for the `X-Mailrag-Synthetic` header a real IMAP transport
    /// would read off the message.
    #[serde(default)]
    synthetic: bool,
}

#[derive(Debug, Serialize)]
struct OutboxEntry<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

impl FileMailTransport {
    pub fn new(inbox_dir: impl Into<PathBuf>, outbox_path: impl Into<PathBuf>) -> Self {
        Self { inbox_dir: inbox_dir.into(), outbox_path: outbox_path.into() }
    }
}

#[async_trait]
impl MailTransport for FileMailTransport {
    async fn fetch_new_messages(&self, since_uid: u32) -> AppResult<Vec<RawMessage>> {
        if !self.inbox_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.inbox_dir).await?;
        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            let parsed: InboxMessage = match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable inbox file");
                    continue;
                }
            };
            if parsed.uid > since_uid {
                messages.push(RawMessage {
                    uid: parsed.uid,
                    subject: parsed.subject,
                    sender: parsed.sender,
                    body: parsed.body,
                    synthetic: parsed.synthetic,
                });
            }
        }
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    async fn send_reply(&self, to: &str, subject: &str, body: &str) -> AppResult<()> {
        if let Some(parent) = self.outbox_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = OutboxEntry { to, subject, body };
        let line = serde_json::to_string(&entry)?;
        let mut existing = tokio::fs::read_to_string(&self.outbox_path).await.unwrap_or_default();
        existing.push_str(&line);
        existing.push('\n');
        tokio::fs::write(&self.outbox_path, existing).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CursorState {
    last_uid: u32,
    uid_to_archive: HashMap<u32, String>,
}

/// Persists `state` to `path` via write-temp-then-rename so a crash never
/// observes a partially written cursor file.
async fn persist_cursor(path: &PathBuf, state: &CursorState) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(state)?;
    tokio::fs::write(&tmp_path, body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn load_cursor(path: &PathBuf) -> CursorState {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => CursorState::default(),
    }
}

pub struct MailLoop {
    config: Arc<AppConfig>,
    transport: Arc<dyn MailTransport>,
    archive: Arc<ArchiveStore>,
    registry: Arc<CollectionRegistry>,
    routing_rules: RoutingRuleSet,
    scheduler: Arc<JobScheduler>,
    state: Mutex<CursorState>,
    state_path: PathBuf,
}

impl MailLoop {
    pub async fn new(
        config: Arc<AppConfig>,
        transport: Arc<dyn MailTransport>,
        archive: Arc<ArchiveStore>,
        registry: Arc<CollectionRegistry>,
        scheduler: Arc<JobScheduler>,
        state_path: PathBuf,
    ) -> Self {
        let routing_rules = RoutingRuleSet::load(&config.routing_rules_path);
        let state = load_cursor(&state_path).await;
        Self { config, transport, archive, registry, routing_rules, scheduler, state: Mutex::new(state), state_path }
    }

    fn last_uid(&self) -> u32 {
        self.state.lock().last_uid
    }

    /// One poll tick: fetch, route, archive, enqueue, advance cursor.
    pub async fn tick(&self) -> AppResult<usize> {
        let since = self.last_uid();
        let messages = self.transport.fetch_new_messages(since).await?;
        let mut enqueued = 0;

        for msg in messages {
            if msg.uid <= self.last_uid() {
                continue;
            }

            let collection = router::determine_collection(
                EmailFields { sender: &msg.sender, subject: &msg.subject, body: &msg.body },
                &self.routing_rules,
                &self.config.default_workspace,
            );
            self.registry.get_or_create(&collection);

            let existing: HashSet<String> = self.state.lock().uid_to_archive.values().cloned().collect();
            let archive_id = self.archive.get_or_assign(msg.uid, &existing);

            let record = ArchiveRecord {
                archive_id: archive_id.clone(),
                uid: msg.uid,
                received_at: chrono::Utc::now(),
                raw_body_path: "body.txt".into(),
                attachments: Vec::new(),
                synthetic: msg.synthetic,
            };
            if let Err(e) = self.archive.write_record(&record, &msg.body).await {
                warn!(uid = msg.uid, error = %e, "failed to persist archive record");
            }

            let subj_lower = msg.subject.to_lowercase();
            let job = if subj_lower.starts_with("chat:") || subj_lower.starts_with("question:") {
                let question = msg.subject.splitn(2, ':').nth(1).unwrap_or(&msg.subject).trim().to_string();
                Job::Query {
                    uid: msg.uid,
                    archive_id: archive_id.clone(),
                    collection,
                    subject: msg.subject.clone(),
                    sender: msg.sender.clone(),
                    question: if question.is_empty() { msg.body.clone() } else { question },
                    synthetic: msg.synthetic,
                }
            } else {
                Job::Ingest {
                    uid: msg.uid,
                    archive_id: archive_id.clone(),
                    collection,
                    subject: msg.subject.clone(),
                    sender: msg.sender.clone(),
                    body: msg.body.clone(),
                    synthetic: msg.synthetic,
                }
            };

            // Backpressure: this blocks if the scheduler's queue is full,
            // which is the deliberate throttle on how fast we poll ahead.
            if self.scheduler.enqueue(job).await.is_err() {
                warn!(uid = msg.uid, "job scheduler is shutting down, stopping this tick early");
                break;
            }

            let snapshot = {
                let mut state = self.state.lock();
                state.last_uid = msg.uid;
                state.uid_to_archive.insert(msg.uid, archive_id);
                state.clone()
            };
            persist_cursor(&self.state_path, &snapshot).await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(n) if n > 0 => info!(enqueued = n, "mail loop tick processed messages"),
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "mail loop tick failed, backing off");
                            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mail loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mail-test-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn file_transport_reads_only_messages_past_the_cursor() {
        let root = scratch_dir("inbox");
        let inbox = root.join("inbox");
        tokio::fs::create_dir_all(&inbox).await.unwrap();
        for (uid, subject) in [(1u32, "first"), (2, "second"), (3, "third")] {
            let msg = InboxMessage { uid, subject: subject.into(), sender: "a@b.com".into(), body: "hello".into(), synthetic: false };
            tokio::fs::write(inbox.join(format!("{uid}.json")), serde_json::to_string(&msg).unwrap()).await.unwrap();
        }
        let transport = FileMailTransport::new(inbox.clone(), root.join("outbox.jsonl"));

        let messages = transport.fetch_new_messages(1).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].uid, 2);
        assert_eq!(messages[1].uid, 3);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn synthetic_flag_defaults_false_and_round_trips_when_set() {
        let root = scratch_dir("synthetic");
        let inbox = root.join("inbox");
        tokio::fs::create_dir_all(&inbox).await.unwrap();

        let plain = InboxMessage { uid: 1, subject: "hi".into(), sender: "a@b.com".into(), body: "hello".into(), synthetic: false };
        tokio::fs::write(inbox.join("1.json"), serde_json::to_string(&plain).unwrap()).await.unwrap();
        // Omit the field entirely to exercise `#[serde(default)]`.
        tokio::fs::write(inbox.join("2.json"), r#"{"uid":2,"subject":"digest","sender":"bot@b.com","body":"auto"}"#).await.unwrap();
        let synthetic = InboxMessage { uid: 3, subject: "bounce".into(), sender: "mailer-daemon@b.com".into(), body: "undeliverable".into(), synthetic: true };
        tokio::fs::write(inbox.join("3.json"), serde_json::to_string(&synthetic).unwrap()).await.unwrap();

        let transport = FileMailTransport::new(inbox.clone(), root.join("outbox.jsonl"));
        let messages = transport.fetch_new_messages(0).await.unwrap();

        assert!(!messages[0].synthetic);
        assert!(!messages[1].synthetic);
        assert!(messages[2].synthetic);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn file_transport_send_reply_appends_jsonl() {
        let dir = scratch_dir("outbox");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let outbox = dir.join("outbox.jsonl");
        let transport = FileMailTransport::new(dir.join("inbox"), outbox.clone());

        transport.send_reply("a@b.com", "Re: hi", "first reply").await.unwrap();
        transport.send_reply("a@b.com", "Re: hi", "second reply").await.unwrap();

        let contents = tokio::fs::read_to_string(&outbox).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("first reply"));
        assert!(contents.contains("second reply"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn cursor_persists_and_reloads_across_restarts() {
        let dir = scratch_dir("cursor");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("cursor.json");

        let mut state = CursorState::default();
        state.last_uid = 42;
        state.uid_to_archive.insert(42, "abc123".into());
        persist_cursor(&path, &state).await.unwrap();

        let reloaded = load_cursor(&path).await;
        assert_eq!(reloaded.last_uid, 42);
        assert_eq!(reloaded.uid_to_archive.get(&42), Some(&"abc123".to_string()));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_cursor_file_defaults_to_zero() {
        let path = scratch_dir("missing").join("does-not-exist.json");
        let state = load_cursor(&path).await;
        assert_eq!(state.last_uid, 0);
        assert!(state.uid_to_archive.is_empty());
    }
}
