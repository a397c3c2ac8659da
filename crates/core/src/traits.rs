use crate::error::{EmbeddingError, IngestError, StorageError};
use crate::models::{Analysis, Category, ContentRecord, NewRecord, OcrOutput, PromptConfig};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Embedder {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[async_trait]
pub trait OcrEngine {
    fn name(&self) -> &str;

    async fn extract_text(&self, image: &Path) -> Result<OcrOutput, IngestError>;
}

#[async_trait]
pub trait Tagger {
    async fn analyze(&self, text: &str, prompt: &PromptConfig) -> Result<Analysis, IngestError>;
}

/// Record persistence. Implementations must reject duplicate hashes with
/// [`StorageError::Conflict`] even when the caller already checked.
#[async_trait]
pub trait RecordStore {
    async fn find_by_content_hash(
        &self,
        category: Category,
        hash: &str,
    ) -> Result<Option<ContentRecord>, StorageError>;

    async fn find_by_source_hash(&self, hash: &str) -> Result<Option<ContentRecord>, StorageError>;

    async fn get(&self, category: Category, id: u64) -> Result<Option<ContentRecord>, StorageError>;

    async fn create(&self, record: NewRecord) -> Result<ContentRecord, StorageError>;

    async fn replace(&self, record: ContentRecord) -> Result<(), StorageError>;

    async fn delete(&self, category: Category, id: u64) -> Result<ContentRecord, StorageError>;
}
