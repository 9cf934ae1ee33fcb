//! In-memory implementation of TaskDocumentStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::store::*;
use crate::task::TaskInstance;

/// In-memory implementation of TaskDocumentStore
///
/// Provides the same conditional-write semantics as the PostgreSQL store,
/// plus hooks to simulate outages in tests.
///
/// # Example
///
/// ```
/// use everruns_task_manager::InMemoryTaskDocumentStore;
///
/// let store = InMemoryTaskDocumentStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
pub struct InMemoryTaskDocumentStore {
    docs: RwLock<HashMap<String, TaskInstance>>,
    available: AtomicBool,
    /// Number of upcoming operations that fail with `Database`
    failures_pending: AtomicU32,
    writes: AtomicU64,
}

impl InMemoryTaskDocumentStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            failures_pending: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` while
    /// `false`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` operations fail with a database error
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes (create, conditional write, delete)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn task_count(&self) -> usize {
        self.docs.read().len()
    }

    /// Snapshot of every stored document
    pub fn all(&self) -> Vec<TaskInstance> {
        self.docs.read().values().cloned().collect()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.docs.write().clear();
    }

    fn check_health(&self) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Database("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryTaskDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDocumentStore for InMemoryTaskDocumentStore {
    async fn create(&self, mut doc: TaskInstance) -> Result<TaskInstance, StoreError> {
        self.check_health()?;
        let mut docs = self.docs.write();
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        doc.version = 1;
        doc.updated_at = Utc::now();
        docs.insert(doc.id.clone(), doc.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(doc)
    }

    async fn read(&self, id: &str) -> Result<TaskInstance, StoreError> {
        self.check_health()?;
        self.docs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn conditional_write(&self, mut doc: TaskInstance) -> Result<TaskInstance, StoreError> {
        self.check_health()?;
        let mut docs = self.docs.write();
        let stored = docs
            .get_mut(&doc.id)
            .ok_or_else(|| StoreError::NotFound(doc.id.clone()))?;

        if stored.version != doc.version {
            return Err(StoreError::VersionConflict {
                id: doc.id,
                expected: doc.version,
                actual: stored.version,
            });
        }

        doc.version += 1;
        doc.updated_at = Utc::now();
        *stored = doc.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(doc)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check_health()?;
        self.docs
            .write()
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn conditional_delete(&self, id: &str, version: u64) -> Result<(), StoreError> {
        self.check_health()?;
        let mut docs = self.docs.write();
        let stored = docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if stored.version != version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: version,
                actual: stored.version,
            });
        }
        docs.remove(id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskInstance>, StoreError> {
        self.check_health()?;
        let matching: Vec<TaskInstance> = self
            .docs
            .read()
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        Ok(query.sort_and_page(matching))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".into()))
        }
    }
}
