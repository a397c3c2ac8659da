//! In-process record storage with an optional JSON snapshot on disk.
//!
//! Uniqueness is enforced here as well as in the pipeline:
//! `content_hash` per category, `source_hash` across journal records and
//! `source_url` across influences.

use crate::error::StorageError;
use crate::index::write_atomic;
use crate::models::{Category, ContentRecord, NewRecord};
use crate::traits::RecordStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    records: Vec<ContentRecord>,
}

impl Snapshot {
    fn conflict(&self, candidate: &ContentRecord) -> Option<StorageError> {
        self.records
            .iter()
            .filter(|existing| !(existing.id == candidate.id && existing.category == candidate.category))
            .find_map(|existing| {
                let same_category = existing.category == candidate.category;
                if same_category && existing.content_hash == candidate.content_hash {
                    return Some(candidate.content_hash.clone());
                }
                if same_category && candidate.category == Category::Journal {
                    if let (Some(left), Some(right)) = (&existing.source_hash, &candidate.source_hash) {
                        if left == right {
                            return Some(right.clone());
                        }
                    }
                }
                if same_category && candidate.category == Category::Influence {
                    if let (Some(left), Some(right)) = (&existing.source_url, &candidate.source_url) {
                        if left == right {
                            return Some(right.clone());
                        }
                    }
                }
                None
            })
            .map(|hash| StorageError::Conflict {
                category: candidate.category,
                hash,
            })
    }

    fn position(&self, category: Category, id: u64) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.category == category && record.id == id)
    }
}

pub struct MemoryRecordStore {
    path: Option<PathBuf>,
    state: Mutex<Snapshot>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    /// Store that lives only as long as the process.
    pub fn new() -> Self {
        Self {
            path: None,
            state: Mutex::new(Snapshot {
                next_id: 1,
                records: Vec::new(),
            }),
        }
    }

    /// Store backed by a JSON snapshot at `path`, written after every mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let snapshot: Snapshot = serde_json::from_slice(&std::fs::read(&path)?)?;
            info!(records = snapshot.records.len(), path = %path.display(), "loaded record store");
            snapshot
        } else {
            Snapshot {
                next_id: 1,
                records: Vec::new(),
            }
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(snapshot),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn records(&self, category: Category) -> Vec<ContentRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .filter(|record| record.category == category)
            .cloned()
            .collect()
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_vec(snapshot)?)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_content_hash(
        &self,
        category: Category,
        hash: &str,
    ) -> Result<Option<ContentRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .find(|record| record.category == category && record.content_hash == hash)
            .cloned())
    }

    async fn find_by_source_hash(&self, hash: &str) -> Result<Option<ContentRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .find(|record| {
                record.category == Category::Journal && record.source_hash.as_deref() == Some(hash)
            })
            .cloned())
    }

    async fn get(&self, category: Category, id: u64) -> Result<Option<ContentRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.position(category, id).map(|index| state.records[index].clone()))
    }

    async fn create(&self, record: NewRecord) -> Result<ContentRecord, StorageError> {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        let created = record.into_record(id, Utc::now());

        if let Some(conflict) = state.conflict(&created) {
            return Err(conflict);
        }

        state.records.push(created.clone());
        state.next_id += 1;

        if let Err(error) = self.persist(&state) {
            state.records.pop();
            state.next_id -= 1;
            return Err(error);
        }

        Ok(created)
    }

    async fn replace(&self, record: ContentRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let index = state
            .position(record.category, record.id)
            .ok_or(StorageError::NotFound {
                category: record.category,
                id: record.id,
            })?;

        if let Some(conflict) = state.conflict(&record) {
            return Err(conflict);
        }

        let previous = std::mem::replace(&mut state.records[index], record);
        if let Err(error) = self.persist(&state) {
            state.records[index] = previous;
            return Err(error);
        }
        Ok(())
    }

    async fn delete(&self, category: Category, id: u64) -> Result<ContentRecord, StorageError> {
        let mut state = self.state.lock().await;
        let index = state
            .position(category, id)
            .ok_or(StorageError::NotFound { category, id })?;

        let removed = state.records.remove(index);
        if let Err(error) = self.persist(&state) {
            state.records.insert(index, removed);
            return Err(error);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(text: &str, source_hash: Option<&str>) -> NewRecord {
        NewRecord {
            category: Category::Journal,
            text: text.to_string(),
            content_hash: crate::fingerprint::text_fingerprint(text),
            source_hash: source_hash.map(str::to_string),
            tags: Vec::new(),
            insights: Vec::new(),
            occurred_at: None,
            embedding: vec![1.0, 0.0],
            image_paths: Vec::new(),
            title: None,
            source_url: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids() -> Result<(), StorageError> {
        let store = MemoryRecordStore::new();
        let first = store.create(journal("one", None)).await?;
        let second = store.create(journal("two", None)).await?;
        assert_eq!(first.id + 1, second.id);
        assert_eq!(store.len().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_content_hash_is_a_conflict() -> Result<(), StorageError> {
        let store = MemoryRecordStore::new();
        store.create(journal("same text", None)).await?;

        let result = store.create(journal("Same   TEXT", None)).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));

        let mut influence = journal("same text", None);
        influence.category = Category::Influence;
        store.create(influence).await?;
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_source_hash_is_a_conflict() -> Result<(), StorageError> {
        let store = MemoryRecordStore::new();
        store.create(journal("page one", Some("ffee"))).await?;

        assert!(store.find_by_source_hash("ffee").await?.is_some());
        assert!(matches!(
            store.create(journal("page two", Some("ffee"))).await,
            Err(StorageError::Conflict { .. })
        ));
        store.create(journal("page three", None)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn delete_and_lookup() -> Result<(), StorageError> {
        let store = MemoryRecordStore::new();
        let created = store.create(journal("to delete", None)).await?;

        assert!(store.get(Category::Journal, created.id).await?.is_some());
        assert!(store.get(Category::Influence, created.id).await?.is_none());

        store.delete(Category::Journal, created.id).await?;
        assert!(store
            .find_by_content_hash(Category::Journal, &created.content_hash)
            .await?
            .is_none());
        assert!(matches!(
            store.delete(Category::Journal, created.id).await,
            Err(StorageError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("records.json");
        {
            let store = MemoryRecordStore::open(&path)?;
            store.create(journal("kept on disk", Some("abcd"))).await?;
        }

        let reopened = MemoryRecordStore::open(&path)?;
        let found = reopened.find_by_source_hash("abcd").await?;
        assert_eq!(found.map(|record| record.text), Some("kept on disk".to_string()));

        let next = reopened.create(journal("after reopen", None)).await?;
        assert_eq!(next.id, 2);
        Ok(())
    }
}
