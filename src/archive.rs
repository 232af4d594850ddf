//! Per-message archive storage and opaque archive-id assignment.
//!
//! Every ingested message gets a directory under `archive_root/<archive_id>/`
//! holding its raw extracted body and attachment analyses. The `archive_id` is
//! deliberately decoupled from the IMAP UID (unguessable, URL-safe).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub analysis_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub archive_id: String,
    pub uid: u32,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub raw_body_path: String,
    pub attachments: Vec<Attachment>,
    pub synthetic: bool,
}

pub struct ArchiveStore {
    root: PathBuf,
    /// uid -> archive_id, mirrored into the UID cursor file by the mail loop.
    assigned: DashMap<u32, String>,
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), assigned: DashMap::new() }
    }

    /// Generate an archive_id not already present in `existing`, retrying on
    /// collision up to 100 times before falling back to a longer token.
    pub fn generate_unique_id(existing: &std::collections::HashSet<String>) -> String {
        for _ in 0..100 {
            let candidate = random_token(8);
            if !existing.contains(&candidate) {
                return candidate;
            }
        }
        tracing::warn!("repeated archive_id collisions, generating a longer token");
        random_token(16)
    }

    pub fn get_or_assign(&self, uid: u32, existing_ids: &std::collections::HashSet<String>) -> String {
        if let Some(id) = self.assigned.get(&uid) {
            return id.clone();
        }
        let id = Self::generate_unique_id(existing_ids);
        self.assigned.insert(uid, id.clone());
        id
    }

    pub fn archive_dir(&self, archive_id: &str) -> PathBuf {
        self.root.join(archive_id)
    }

    pub async fn write_record(&self, record: &ArchiveRecord, body: &str) -> std::io::Result<()> {
        let dir = self.archive_dir(&record.archive_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("body.txt"), body).await?;
        let meta = serde_json::to_string_pretty(record).unwrap_or_default();
        tokio::fs::write(dir.join("record.json"), meta).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avoids_collisions() {
        let mut existing = std::collections::HashSet::new();
        let a = ArchiveStore::generate_unique_id(&existing);
        existing.insert(a.clone());
        let b = ArchiveStore::generate_unique_id(&existing);
        assert_ne!(a, b);
    }
}
