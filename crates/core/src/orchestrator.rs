//! Ingest pipeline tying OCR, segmentation, tagging, storage and the similarity index together.

use crate::embeddings::l2_normalize;
use crate::error::{EmbeddingError, IngestError, Result, StorageError};
use crate::fingerprint::{image_fingerprint_blocking, text_fingerprint};
use crate::index::SimilarityIndex;
use crate::models::{
    Analysis, Category, ContentRecord, ImageOutcome, IndexStats, InfluenceOutcome, IngestFailure,
    IngestSummary, NewRecord, ProcessedEntry, SearchHit,
};
use crate::segmenter::{DateBlock, DateSegmenter};
use crate::tagging::PromptChoice;
use crate::traits::{Embedder, OcrEngine, RecordStore, Tagger};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct JournalIngestor<S, E, O, T> {
    store: S,
    index: SimilarityIndex<E>,
    ocr: O,
    tagger: T,
    segmenter: DateSegmenter,
    prompt: PromptChoice,
}

enum BlockOutcome {
    Created(ProcessedEntry),
    Duplicate,
    Failed(String),
}

impl<S, E, O, T> JournalIngestor<S, E, O, T>
where
    S: RecordStore + Send + Sync,
    E: Embedder + Send + Sync,
    O: OcrEngine + Send + Sync,
    T: Tagger + Send + Sync,
{
    pub fn new(
        store: S,
        index: SimilarityIndex<E>,
        ocr: O,
        tagger: T,
        prompt: PromptChoice,
    ) -> Result<Self> {
        Ok(Self {
            store,
            index,
            ocr,
            tagger,
            segmenter: DateSegmenter::new()?,
            prompt,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn index(&self) -> &SimilarityIndex<E> {
        &self.index
    }

    pub fn prompt(&self) -> &PromptChoice {
        &self.prompt
    }

    /// Runs every image in order. A failing image never stops the ones after it.
    pub async fn ingest_batch(&self, paths: &[PathBuf]) -> IngestSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, images = paths.len(), prompt = %self.prompt.used, "starting ingest run");

        let mut processed = Vec::new();
        let mut skipped_duplicates = Vec::new();
        let mut errors = Vec::new();

        for path in paths {
            let file = display_name(path);

            if !path.is_file() {
                warn!(path = %path.display(), "input file not found");
                errors.push(IngestFailure {
                    file,
                    reason: format!("File not found: {}", path.display()),
                });
                continue;
            }

            match self.process_image(path).await {
                ImageOutcome::Processed {
                    entries,
                    block_errors,
                } => {
                    errors.extend(block_errors.into_iter().map(|reason| IngestFailure {
                        file: file.clone(),
                        reason,
                    }));
                    processed.extend(entries);
                }
                ImageOutcome::SkippedDuplicateImage { .. } => skipped_duplicates.push(file),
                ImageOutcome::Error { reason } => errors.push(IngestFailure { file, reason }),
            }
        }

        let summary = IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            prompt_config_used: self.prompt.used.clone(),
            processed,
            skipped_duplicates,
            errors,
        };

        info!(
            %run_id,
            processed = summary.processed.len(),
            skipped = summary.skipped_duplicates.len(),
            errors = summary.errors.len(),
            "finished ingest run"
        );
        summary
    }

    pub async fn process_image(&self, path: &Path) -> ImageOutcome {
        let file = display_name(path);

        let source_hash = match image_fingerprint_blocking(path.to_path_buf()).await {
            Ok(hash) => hash,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "image fingerprint failed");
                return ImageOutcome::Error {
                    reason: format!("hash computation failed: {error}"),
                };
            }
        };

        match self.store.find_by_source_hash(&source_hash).await {
            Ok(Some(existing)) => {
                info!(path = %path.display(), existing_id = existing.id, "skipping already ingested image");
                return ImageOutcome::SkippedDuplicateImage {
                    existing_id: existing.id,
                };
            }
            Ok(None) => {}
            Err(error) => {
                warn!(path = %path.display(), error = %error, "duplicate image lookup failed");
                return ImageOutcome::Error {
                    reason: error.to_string(),
                };
            }
        }

        let ocr = match self.ocr.extract_text(path).await {
            Ok(output) if !output.text.trim().is_empty() => output,
            Ok(_) | Err(IngestError::NoTextExtracted) => {
                warn!(path = %path.display(), "no text extracted");
                return ImageOutcome::Error {
                    reason: "no text extracted".to_string(),
                };
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "no text extracted");
                return ImageOutcome::Error {
                    reason: format!("no text extracted: {error}"),
                };
            }
        };
        debug!(path = %path.display(), engine = %ocr.engine, confidence = ocr.confidence, "page transcribed");

        let blocks = self.segmenter.segment(&ocr.text);
        let mut entries = Vec::new();
        let mut block_errors = Vec::new();
        let mut source_claimed = false;

        for (number, block) in blocks.iter().enumerate() {
            let claim = (!source_claimed).then(|| source_hash.clone());
            match self.commit_block(path, &file, block, claim.clone()).await {
                BlockOutcome::Created(entry) => {
                    source_claimed |= claim.is_some();
                    entries.push(entry);
                }
                BlockOutcome::Duplicate => {}
                BlockOutcome::Failed(reason) => {
                    warn!(path = %path.display(), block = number + 1, reason = %reason, "block failed");
                    block_errors.push(format!("block {}: {reason}", number + 1));
                }
            }
        }

        // every block failed: nothing was written, so a later run retries the whole image
        if entries.is_empty() && !block_errors.is_empty() && block_errors.len() == blocks.len() {
            return ImageOutcome::Error {
                reason: block_errors.join("; "),
            };
        }

        info!(path = %path.display(), created = entries.len(), blocks = blocks.len(), "processed image");
        ImageOutcome::Processed {
            entries,
            block_errors,
        }
    }

    async fn commit_block(
        &self,
        path: &Path,
        file: &str,
        block: &DateBlock,
        source_hash: Option<String>,
    ) -> BlockOutcome {
        let content_hash = text_fingerprint(&block.text);
        match self
            .store
            .find_by_content_hash(Category::Journal, &content_hash)
            .await
        {
            Ok(Some(existing)) => {
                debug!(existing_id = existing.id, "skipping duplicate block");
                return BlockOutcome::Duplicate;
            }
            Ok(None) => {}
            Err(error) => return BlockOutcome::Failed(error.to_string()),
        }

        let analysis = self.analyze(&block.text).await;
        let embedding = match self.embed(&block.text).await {
            Ok(vector) => vector,
            Err(error) => return BlockOutcome::Failed(error.to_string()),
        };

        let record = NewRecord {
            category: Category::Journal,
            text: block.text.clone(),
            content_hash,
            source_hash,
            tags: analysis.tags,
            insights: analysis.insights,
            occurred_at: block.date,
            embedding,
            image_paths: vec![path.display().to_string()],
            title: None,
            source_url: None,
        };

        let record = match self.store.create(record).await {
            Ok(record) => record,
            Err(StorageError::Conflict { hash, .. }) => {
                info!(hash = %hash, "record already stored, treating block as duplicate");
                return BlockOutcome::Duplicate;
            }
            Err(error) => return BlockOutcome::Failed(error.to_string()),
        };

        if let Err(error) = self.index_record(&record).await {
            return BlockOutcome::Failed(error.to_string());
        }

        BlockOutcome::Created(ProcessedEntry {
            record_id: record.id,
            source_file: file.to_string(),
            date: record.occurred_at,
            tag_count: record.tags.len(),
            insight_count: record.insights.len(),
        })
    }

    /// Adds a piece of external content (a quote, an article excerpt) as an influence.
    pub async fn ingest_influence(
        &self,
        text: &str,
        title: Option<String>,
        source_url: Option<String>,
    ) -> Result<InfluenceOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(IngestError::InvalidArgument("influence text is empty".to_string()));
        }

        let content_hash = text_fingerprint(text);
        if let Some(existing) = self
            .store
            .find_by_content_hash(Category::Influence, &content_hash)
            .await?
        {
            return Ok(InfluenceOutcome::Duplicate {
                existing_id: existing.id,
            });
        }

        let analysis = self.analyze(text).await;
        let embedding = self.embed(text).await?;

        let record = self
            .store
            .create(NewRecord {
                category: Category::Influence,
                text: text.to_string(),
                content_hash,
                source_hash: None,
                tags: analysis.tags,
                insights: analysis.insights,
                occurred_at: None,
                embedding,
                image_paths: Vec::new(),
                title,
                source_url,
            })
            .await?;

        self.index_record(&record).await?;

        info!(record_id = record.id, "added influence");
        Ok(InfluenceOutcome::Created {
            record_id: record.id,
            tag_count: record.tags.len(),
        })
    }

    /// Removes a record from storage and the index as one operation.
    pub async fn delete_record(&self, category: Category, id: u64) -> Result<ContentRecord> {
        let record = self
            .store
            .get(category, id)
            .await?
            .ok_or(StorageError::NotFound { category, id })?;

        self.index.remove(id, category).await?;

        if let Err(error) = self.store.delete(category, id).await {
            if let Err(restore) = self
                .index
                .insert_vector(
                    record.embedding.clone(),
                    &record.text,
                    id,
                    category,
                    index_metadata(&record),
                )
                .await
            {
                error!(record_id = id, error = %restore, "failed to restore index entry after storage delete failed");
            }
            return Err(error.into());
        }

        info!(record_id = id, category = %category, "deleted record");
        Ok(record)
    }

    /// Replaces a record's text, re-embedding it in storage and the index.
    /// Tags and insights are refreshed when tagging succeeds and kept otherwise.
    pub async fn update_record_text(
        &self,
        category: Category,
        id: u64,
        new_text: &str,
    ) -> Result<ContentRecord> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Err(IngestError::InvalidArgument("new text is empty".to_string()));
        }

        let previous = self
            .store
            .get(category, id)
            .await?
            .ok_or(StorageError::NotFound { category, id })?;

        let embedding = self.embed(new_text).await?;
        let mut updated = previous.clone();
        updated.text = new_text.to_string();
        updated.content_hash = text_fingerprint(new_text);
        updated.embedding = embedding;

        match self.tagger.analyze(new_text, &self.prompt.config).await {
            Ok(analysis) => {
                let analysis = Analysis::bounded(analysis.tags, analysis.insights);
                updated.tags = analysis.tags;
                updated.insights = analysis.insights;
            }
            Err(error) => warn!(record_id = id, error = %error, "tagging failed, keeping previous tags"),
        }

        self.store.replace(updated.clone()).await?;

        if let Err(error) = self
            .index
            .update_vector(
                updated.embedding.clone(),
                id,
                category,
                new_text,
                index_metadata(&updated),
            )
            .await
        {
            if let Err(restore) = self.store.replace(previous).await {
                error!(record_id = id, error = %restore, "failed to restore record after index update failed");
            }
            return Err(error.into());
        }

        info!(record_id = id, category = %category, "updated record text");
        Ok(updated)
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        category: Option<Category>,
    ) -> Result<Vec<SearchHit>> {
        Ok(self.index.search(query, k, category).await?)
    }

    pub async fn stats(&self) -> IndexStats {
        self.index.stats().await
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(self.index.flush().await?)
    }

    async fn analyze(&self, text: &str) -> Analysis {
        match self.tagger.analyze(text, &self.prompt.config).await {
            Ok(analysis) => Analysis::bounded(analysis.tags, analysis.insights),
            Err(error) => {
                warn!(error = %error, "tagging failed, continuing without tags");
                Analysis::default()
            }
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = self.index.embedder().embed(text).await?;
        if vector.len() != self.index.dimension() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "embedding dimension {} != {}",
                vector.len(),
                self.index.dimension()
            )));
        }
        if !l2_normalize(&mut vector) {
            return Err(EmbeddingError::InvalidResponse("embedding is a zero vector".to_string()));
        }
        Ok(vector)
    }

    /// Inserts the stored vector; on failure the record is deleted again so
    /// storage never holds a record the index cannot find.
    async fn index_record(&self, record: &ContentRecord) -> Result<()> {
        let inserted = self
            .index
            .insert_vector(
                record.embedding.clone(),
                &record.text,
                record.id,
                record.category,
                index_metadata(record),
            )
            .await;

        if let Err(error) = inserted {
            warn!(record_id = record.id, error = %error, "index insert failed, rolling back record");
            if let Err(rollback) = self.store.delete(record.category, record.id).await {
                error!(record_id = record.id, error = %rollback, "failed to roll back record");
            }
            return Err(error.into());
        }
        Ok(())
    }
}

/// Extra index metadata derived from a record; rebuilt whenever the entry is rewritten.
fn index_metadata(record: &ContentRecord) -> Map<String, Value> {
    let mut extra = Map::new();
    if let Some(image) = record.image_paths.first() {
        extra.insert("source_file".to_string(), Value::String(display_name(Path::new(image))));
    }
    if let Some(date) = record.occurred_at {
        extra.insert("occurred_at".to_string(), json!(date));
    }
    if let Some(title) = &record.title {
        extra.insert("title".to_string(), Value::String(title.clone()));
    }
    if let Some(url) = &record.source_url {
        extra.insert("source_url".to_string(), Value::String(url.clone()));
    }
    extra.insert("tags".to_string(), json!(record.tags));
    extra
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexPaths;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{OcrOutput, PromptConfig};
    use crate::store::MemoryRecordStore;
    use async_trait::async_trait;
    use image::{ImageBuffer, Luma};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// OCR fake keyed by file name; unknown files yield no text.
    #[derive(Default)]
    struct FakeOcr {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl FakeOcr {
        fn with_page(mut self, file: &str, text: &str) -> Self {
            self.pages.insert(file.to_string(), text.to_string());
            self
        }
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        fn name(&self) -> &str {
            "fake"
        }

        async fn extract_text(&self, image: &Path) -> Result<OcrOutput, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let file = display_name(image);
            let text = self.pages.get(&file).cloned().ok_or(IngestError::NoTextExtracted)?;
            Ok(OcrOutput {
                text,
                confidence: 0.9,
                engine: "fake".to_string(),
            })
        }
    }

    struct FakeTagger {
        fail: bool,
    }

    #[async_trait]
    impl Tagger for FakeTagger {
        async fn analyze(&self, text: &str, _prompt: &PromptConfig) -> Result<Analysis, IngestError> {
            if self.fail {
                return Err(IngestError::TaggingFailed("model offline".to_string()));
            }
            let tags = text
                .split_whitespace()
                .map(|word| word.to_lowercase())
                .collect();
            Ok(Analysis::bounded(tags, vec!["an insight".to_string()]))
        }
    }

    /// Refuses to embed any text containing `refuse`.
    struct FlakyEmbedder {
        inner: CharacterNgramEmbedder,
        refuse: &'static str,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains(self.refuse) {
                return Err(EmbeddingError::Unavailable("rate limited".to_string()));
            }
            self.inner.embed(text).await
        }
    }

    /// Store whose text lookups never see committed records, like a reader
    /// racing another writer. `create` still enforces uniqueness.
    struct StaleReadStore {
        inner: MemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for StaleReadStore {
        async fn find_by_content_hash(
            &self,
            _category: Category,
            _hash: &str,
        ) -> Result<Option<ContentRecord>, StorageError> {
            Ok(None)
        }

        async fn find_by_source_hash(&self, hash: &str) -> Result<Option<ContentRecord>, StorageError> {
            self.inner.find_by_source_hash(hash).await
        }

        async fn get(&self, category: Category, id: u64) -> Result<Option<ContentRecord>, StorageError> {
            self.inner.get(category, id).await
        }

        async fn create(&self, record: NewRecord) -> Result<ContentRecord, StorageError> {
            self.inner.create(record).await
        }

        async fn replace(&self, record: ContentRecord) -> Result<(), StorageError> {
            self.inner.replace(record).await
        }

        async fn delete(&self, category: Category, id: u64) -> Result<ContentRecord, StorageError> {
            self.inner.delete(category, id).await
        }
    }

    /// Store that cannot delete.
    struct UndeletableStore {
        inner: MemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for UndeletableStore {
        async fn find_by_content_hash(
            &self,
            category: Category,
            hash: &str,
        ) -> Result<Option<ContentRecord>, StorageError> {
            self.inner.find_by_content_hash(category, hash).await
        }

        async fn find_by_source_hash(&self, hash: &str) -> Result<Option<ContentRecord>, StorageError> {
            self.inner.find_by_source_hash(hash).await
        }

        async fn get(&self, category: Category, id: u64) -> Result<Option<ContentRecord>, StorageError> {
            self.inner.get(category, id).await
        }

        async fn create(&self, record: NewRecord) -> Result<ContentRecord, StorageError> {
            self.inner.create(record).await
        }

        async fn replace(&self, record: ContentRecord) -> Result<(), StorageError> {
            self.inner.replace(record).await
        }

        async fn delete(&self, _category: Category, _id: u64) -> Result<ContentRecord, StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk is read-only")))
        }
    }

    type TestIngestor = JournalIngestor<MemoryRecordStore, CharacterNgramEmbedder, FakeOcr, FakeTagger>;

    fn build<S, E>(
        dir: &Path,
        store: S,
        embedder: E,
        ocr: FakeOcr,
    ) -> Result<JournalIngestor<S, E, FakeOcr, FakeTagger>>
    where
        S: RecordStore + Send + Sync,
        E: Embedder + Send + Sync,
    {
        JournalIngestor::new(
            store,
            SimilarityIndex::open(embedder, IndexPaths::in_dir(dir)),
            ocr,
            FakeTagger { fail: false },
            PromptChoice::default_prompt(),
        )
    }

    fn ingestor(dir: &Path, ocr: FakeOcr, fail_tagging: bool) -> Result<TestIngestor> {
        let mut ingestor = build(
            dir,
            MemoryRecordStore::new(),
            CharacterNgramEmbedder { dimensions: 256 },
            ocr,
        )?;
        ingestor.tagger.fail = fail_tagging;
        Ok(ingestor)
    }

    /// Writes a distinct grayscale page; `seed` changes the pattern and therefore the fingerprint.
    fn write_page(dir: &Path, name: &str, seed: u32) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let image = ImageBuffer::from_fn(96, 128, |x, y| {
            let horizontal = (f64::from(x) * 0.07 * f64::from(seed + 1)).sin();
            let vertical = (f64::from(y) * 0.05 * f64::from(seed + 2)).cos();
            Luma([(128.0 + 100.0 * horizontal * vertical) as u8])
        });
        let path = dir.join(name);
        image.save(&path)?;
        Ok(path)
    }

    #[tokio::test]
    async fn same_image_twice_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let page = write_page(dir.path(), "page.png", 0)?;
        let ocr = FakeOcr::default().with_page("page.png", "June 12, 2025 walked along the river");
        let ingestor = ingestor(dir.path(), ocr, false)?;

        let first = ingestor.ingest_batch(std::slice::from_ref(&page)).await;
        assert_eq!(first.processed.len(), 1);
        assert!(first.errors.is_empty());

        let second = ingestor.ingest_batch(&[page]).await;
        assert!(second.processed.is_empty());
        assert_eq!(second.skipped_duplicates, vec!["page.png"]);
        assert_eq!(ingestor.store().len().await, 1);
        assert_eq!(ingestor.stats().await.total_entries, 1);
        assert_eq!(ingestor.ocr.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn multi_date_page_creates_one_record_per_block() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let page = write_page(dir.path(), "week.png", 1)?;
        let ocr = FakeOcr::default().with_page(
            "week.png",
            "June 12, 2025 planted tomatoes\nJune 13, 2025 read about stoicism and rested",
        );
        let ingestor = ingestor(dir.path(), ocr, false)?;

        let outcome = ingestor.process_image(&page).await;
        let ImageOutcome::Processed { entries, block_errors } = outcome else {
            panic!("expected a processed outcome");
        };
        assert!(block_errors.is_empty());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].date, chrono::NaiveDate::from_ymd_opt(2025, 6, 12));
        assert_eq!(entries[1].date, chrono::NaiveDate::from_ymd_opt(2025, 6, 13));

        let records = ingestor.store().records(Category::Journal).await;
        assert!(records[0].source_hash.is_some());
        assert!(records[1].source_hash.is_none());
        assert_eq!(records[0].image_paths, vec![page.display().to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_block_on_another_page_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let first = write_page(dir.path(), "first.png", 0)?;
        let second = write_page(dir.path(), "second.png", 1)?;
        let ocr = FakeOcr::default()
            .with_page("first.png", "June 12, 2025 walked along the river")
            .with_page(
                "second.png",
                "june 12, 2025   WALKED along the river\nJune 14, 2025 cooked dinner for friends",
            );
        let ingestor = ingestor(dir.path(), ocr, false)?;

        let summary = ingestor.ingest_batch(&[first, second]).await;
        assert_eq!(summary.processed.len(), 2);
        assert_eq!(summary.processed[1].source_file, "second.png");
        assert_eq!(summary.processed[1].date, chrono::NaiveDate::from_ymd_opt(2025, 6, 14));

        let records = ingestor.store().records(Category::Journal).await;
        assert!(records.iter().all(|record| record.source_hash.is_some()));
        Ok(())
    }

    #[tokio::test]
    async fn tagging_failure_still_persists() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let page = write_page(dir.path(), "page.png", 2)?;
        let ocr = FakeOcr::default().with_page("page.png", "no date on this page at all");
        let ingestor = ingestor(dir.path(), ocr, true)?;

        let summary = ingestor.ingest_batch(&[page]).await;
        assert_eq!(summary.processed.len(), 1);
        assert_eq!(summary.processed[0].tag_count, 0);
        assert_eq!(summary.processed[0].date, None);
        Ok(())
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_batch() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let blank = write_page(dir.path(), "blank.png", 0)?;
        let corrupt = dir.path().join("corrupt.jpg");
        std::fs::write(&corrupt, b"not really a jpeg")?;
        let missing = dir.path().join("missing.png");
        let good = write_page(dir.path(), "good.png", 3)?;

        let ocr = FakeOcr::default().with_page("good.png", "March 3, 2025 finished the draft");
        let ingestor = ingestor(dir.path(), ocr, false)?;

        let summary = ingestor
            .ingest_batch(&[blank, corrupt, missing.clone(), good])
            .await;

        assert_eq!(summary.processed.len(), 1);
        assert_eq!(summary.processed[0].source_file, "good.png");
        assert_eq!(summary.errors.len(), 3);
        assert_eq!(summary.errors[0].reason, "no text extracted");
        assert!(summary.errors[1].reason.starts_with("hash computation failed"));
        assert_eq!(summary.errors[2].reason, format!("File not found: {}", missing.display()));
        assert_eq!(summary.prompt_config_used, "default");
        Ok(())
    }

    #[tokio::test]
    async fn influences_are_deduplicated_and_searchable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let ingestor = ingestor(dir.path(), FakeOcr::default(), false)?;

        let created = ingestor
            .ingest_influence(
                "You have power over your mind, not outside events.",
                Some("Meditations".to_string()),
                None,
            )
            .await?;
        let InfluenceOutcome::Created { record_id, .. } = created else {
            panic!("expected a created influence");
        };

        let again = ingestor
            .ingest_influence("you have power over your mind,   not outside events.", None, None)
            .await?;
        assert_eq!(again, InfluenceOutcome::Duplicate { existing_id: record_id });

        let hits = ingestor
            .search("power over your mind", 3, Some(Category::Influence))
            .await?;
        assert_eq!(hits[0].record_id, record_id);
        assert_eq!(hits[0].entry.extra.get("title"), Some(&json!("Meditations")));

        assert!(ingestor
            .search("power over your mind", 3, Some(Category::Journal))
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_from_storage_and_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let ingestor = ingestor(dir.path(), FakeOcr::default(), false)?;

        let InfluenceOutcome::Created { record_id, .. } = ingestor
            .ingest_influence("Slow is smooth, smooth is fast.", None, None)
            .await?
        else {
            panic!("expected a created influence");
        };

        ingestor.delete_record(Category::Influence, record_id).await?;
        assert!(ingestor.store().is_empty().await);
        assert_eq!(ingestor.stats().await.total_entries, 0);

        assert!(matches!(
            ingestor.delete_record(Category::Influence, record_id).await,
            Err(IngestError::Storage(StorageError::NotFound { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn update_changes_text_in_storage_and_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let ingestor = ingestor(dir.path(), FakeOcr::default(), false)?;

        let InfluenceOutcome::Created { record_id, .. } = ingestor
            .ingest_influence("Gardening teaches patience.", None, None)
            .await?
        else {
            panic!("expected a created influence");
        };

        let updated = ingestor
            .update_record_text(Category::Influence, record_id, "Neural networks learn representations.")
            .await?;
        assert_eq!(updated.content_hash, text_fingerprint("Neural networks learn representations."));

        let hits = ingestor.search("neural networks", 1, None).await?;
        assert_eq!(hits[0].record_id, record_id);
        assert!(hits[0].entry.text_preview.starts_with("Neural"));
        assert_eq!(updated.tags[0], "neural");
        assert_eq!(hits[0].entry.extra.get("tags"), Some(&json!(updated.tags)));
        assert_eq!(ingestor.stats().await.total_entries, 1);
        Ok(())
    }

    #[tokio::test]
    async fn storage_conflict_after_lookup_counts_as_duplicate() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let text = "June 12, 2025 walked along the river";
        let page = write_page(dir.path(), "page.png", 0)?;

        let inner = MemoryRecordStore::new();
        inner
            .create(NewRecord {
                category: Category::Journal,
                text: text.to_string(),
                content_hash: text_fingerprint(text),
                source_hash: None,
                tags: Vec::new(),
                insights: Vec::new(),
                occurred_at: None,
                embedding: vec![1.0; 256],
                image_paths: Vec::new(),
                title: None,
                source_url: None,
            })
            .await?;

        let ocr = FakeOcr::default().with_page("page.png", text);
        let ingestor = build(
            dir.path(),
            StaleReadStore { inner },
            CharacterNgramEmbedder { dimensions: 256 },
            ocr,
        )?;

        let outcome = ingestor.process_image(&page).await;
        assert_eq!(
            outcome,
            ImageOutcome::Processed {
                entries: Vec::new(),
                block_errors: Vec::new(),
            }
        );
        assert_eq!(ingestor.store().inner.len().await, 1);
        assert_eq!(ingestor.stats().await.total_entries, 0);
        Ok(())
    }

    #[tokio::test]
    async fn index_failure_rolls_back_the_record() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let page = write_page(dir.path(), "page.png", 2)?;
        let ocr = FakeOcr::default().with_page("page.png", "March 3, 2025 finished the draft");
        let ingestor = ingestor(dir.path(), ocr, false)?;

        // a directory in place of the metadata temp file makes every index write fail
        let blocker = IndexPaths::in_dir(dir.path()).metadata.with_extension("tmp");
        std::fs::create_dir(&blocker)?;

        let outcome = ingestor.process_image(&page).await;
        let ImageOutcome::Error { reason } = outcome else {
            panic!("expected an error outcome");
        };
        assert!(reason.starts_with("block 1: "));
        assert!(ingestor.store().is_empty().await);
        assert_eq!(ingestor.stats().await.total_entries, 0);

        std::fs::remove_dir(&blocker)?;
        let retried = ingestor.ingest_batch(&[page]).await;
        assert_eq!(retried.processed.len(), 1);
        assert_eq!(ingestor.store().len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn partial_block_failure_keeps_the_other_blocks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let first = write_page(dir.path(), "first.png", 0)?;
        let second = write_page(dir.path(), "second.png", 1)?;
        let ocr = FakeOcr::default()
            .with_page(
                "first.png",
                "June 12, 2025 planted tomatoes\nJune 13, 2025 overslept and skipped the gym",
            )
            .with_page(
                "second.png",
                "July 1, 2025 overslept again\nJuly 2, 2025 long run by the lake",
            );
        let embedder = FlakyEmbedder {
            inner: CharacterNgramEmbedder { dimensions: 256 },
            refuse: "overslept",
        };
        let ingestor = build(dir.path(), MemoryRecordStore::new(), embedder, ocr)?;

        let outcome = ingestor.process_image(&first).await;
        let ImageOutcome::Processed { entries, block_errors } = outcome else {
            panic!("expected a processed outcome");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].date, chrono::NaiveDate::from_ymd_opt(2025, 6, 12));
        assert_eq!(block_errors.len(), 1);
        assert!(block_errors[0].starts_with("block 2: "));

        let summary = ingestor.ingest_batch(&[second]).await;
        assert_eq!(summary.processed.len(), 1);
        assert_eq!(summary.processed[0].date, chrono::NaiveDate::from_ymd_opt(2025, 7, 2));
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].file, "second.png");
        assert!(summary.errors[0].reason.starts_with("block 1: "));

        let records = ingestor.store().records(Category::Journal).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.source_hash.is_some()));
        assert_eq!(ingestor.stats().await.total_entries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_delete_restores_index_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let ingestor = build(
            dir.path(),
            UndeletableStore {
                inner: MemoryRecordStore::new(),
            },
            CharacterNgramEmbedder { dimensions: 256 },
            FakeOcr::default(),
        )?;

        let InfluenceOutcome::Created { record_id, .. } = ingestor
            .ingest_influence(
                "Waste no more time arguing what a good man should be.",
                Some("Meditations".to_string()),
                Some("https://example.org/meditations".to_string()),
            )
            .await?
        else {
            panic!("expected a created influence");
        };

        assert!(ingestor.delete_record(Category::Influence, record_id).await.is_err());

        let hits = ingestor.search("good man", 1, None).await?;
        assert_eq!(hits[0].record_id, record_id);
        assert_eq!(hits[0].entry.extra.get("title"), Some(&json!("Meditations")));
        assert_eq!(
            hits[0].entry.extra.get("source_url"),
            Some(&json!("https://example.org/meditations"))
        );
        assert!(hits[0].entry.extra.contains_key("tags"));
        Ok(())
    }
}
