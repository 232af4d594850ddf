//! CollectionRegistry (C6): owns the per-collection BM25 index and lifecycle
//! state, serialized behind a per-name lock. Creation is implicit on first
//! write; deletion is explicit and tears down BM25 before reporting success.

use crate::bm25::Bm25Index;
use crate::error::{AppError, AppResult};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Creating,
    Ready,
    Deleting,
}

pub struct CollectionEntry {
    pub bm25: Arc<Bm25Index>,
    pub state: parking_lot::RwLock<CollectionState>,
    /// Set when an ingest lands while a rebuild is already running; the
    /// rebuild supervisor checks this when its current run finishes so at
    /// most one extra rebuild is ever queued per collection.
    pub dirty: std::sync::atomic::AtomicBool,
    /// Serializes rebuilds for this collection so at most one runs at a time.
    pub rebuild_lock: tokio::sync::Mutex<()>,
}

pub struct CollectionRegistry {
    entries: DashMap<String, Arc<CollectionEntry>>,
    bm25_root: PathBuf,
}

impl CollectionRegistry {
    pub fn new(bm25_root: PathBuf) -> Self {
        Self { entries: DashMap::new(), bm25_root }
    }

    fn bm25_dir(&self, name: &str) -> PathBuf {
        self.bm25_root.join(name)
    }

    /// Returns the entry for `name`, creating it (in `Ready` state) if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CollectionEntry> {
        if let Some(entry) = self.entries.get(name) {
            return entry.clone();
        }
        let entry = Arc::new(CollectionEntry {
            bm25: Arc::new(Bm25Index::new(self.bm25_dir(name))),
            state: parking_lot::RwLock::new(CollectionState::Ready),
            dirty: std::sync::atomic::AtomicBool::new(false),
            rebuild_lock: tokio::sync::Mutex::new(()),
        });
        self.entries.insert(name.to_string(), entry.clone());
        entry
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<CollectionEntry>> {
        self.entries.get(name).map(|e| e.clone()).ok_or_else(|| AppError::CollectionGone(name.to_string()))
    }

    pub fn list_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Deletes the BM25 side of a collection; the caller is responsible for
    /// deleting the vector-store side first so a delete never leaves the BM25
    /// index pointing at a vector collection that no longer exists.
    pub fn delete(&self, name: &str) -> AppResult<bool> {
        let Some((_, entry)) = self.entries.remove(name) else { return Ok(false) };
        *entry.state.write() = CollectionState::Deleting;
        entry.bm25.delete()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_on_first_access_is_ready() {
        let dir = std::env::temp_dir().join(format!("registry-test-{}", uuid::Uuid::new_v4()));
        let registry = CollectionRegistry::new(dir.clone());
        let entry = registry.get_or_create("a");
        assert_eq!(*entry.state.read(), CollectionState::Ready);
        assert!(registry.get("a").is_ok());
        assert!(registry.get("missing").is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn isolated_collections_dont_share_state() {
        let dir = std::env::temp_dir().join(format!("registry-test-{}", uuid::Uuid::new_v4()));
        let registry = CollectionRegistry::new(dir.clone());
        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");
        assert!(!Arc::ptr_eq(&a.bm25, &b.bm25));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
