//! Persisted similarity index over journal and influence texts.
//!
//! Vectors live in a dense, append-only inner-product store. Metadata rows sit
//! at the same ordinal as their vector. Removal never edits the store in place:
//! a new store is built from the surviving rows' stored vectors and swapped in
//! only after it has been written to disk.
//!
//! On-disk layout, two co-located files:
//!
//! vectors (little-endian):
//! - magic: `JIVX`
//! - version: u8 (1)
//! - dimension: u32
//! - count: u64
//! - count * dimension f32 values, row major
//!
//! metadata: JSON `{ "dimension": D, "entries": [IndexEntry, ...] }`

use crate::config::IndexPaths;
use crate::embeddings::l2_normalize;
use crate::error::IndexError;
use crate::models::{Category, IndexEntry, IndexStats, SearchHit, TEXT_PREVIEW_CHARS};
use crate::traits::Embedder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const MAGIC: &[u8; 4] = b"JIVX";
const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 4 + 8;
const OVERFETCH: usize = 3;
const RESERVED_KEYS: [&str; 4] = ["position", "record_id", "category", "text_preview"];

/// Dense row-major vector store scored by inner product. Rows cannot be removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIpStore {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIpStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(self.len() - 1)
    }

    pub fn row(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// New store holding copies of `positions`, in that order.
    pub fn rebuild_from(&self, positions: &[usize]) -> Result<Self, IndexError> {
        let mut rebuilt = Self::new(self.dimension);
        rebuilt.data.reserve(positions.len() * self.dimension);
        for position in positions {
            let row = self.row(*position).ok_or_else(|| {
                IndexError::Corruption(format!("no stored vector at position {position}"))
            })?;
            rebuilt.data.extend_from_slice(row);
        }
        Ok(rebuilt)
    }

    /// Up to `k` `(position, score)` pairs, highest score first, ties in position order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dimension || k == 0 {
            return Vec::new();
        }

        let mut scored = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| {
                let score = row.iter().zip(query).map(|(a, b)| a * b).sum::<f32>();
                (position, score)
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(k);
        scored
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() < HEADER_SIZE || &bytes[..4] != MAGIC {
            return Err(IndexError::Corruption("vector store header is invalid".to_string()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(IndexError::Corruption(format!(
                "vector store version {} is not supported",
                bytes[4]
            )));
        }

        let dimension = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[9..HEADER_SIZE]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let payload = &bytes[HEADER_SIZE..];
        let expected = count
            .checked_mul(dimension)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| IndexError::Corruption("vector store header overflows".to_string()))?;
        if payload.len() != expected {
            return Err(IndexError::Corruption(format!(
                "vector store holds {} bytes, header promises {expected}",
                payload.len()
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self { dimension, data })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone)]
struct IndexState {
    store: FlatIpStore,
    entries: Vec<IndexEntry>,
}

impl IndexState {
    fn empty(dimension: usize) -> Self {
        Self {
            store: FlatIpStore::new(dimension),
            entries: Vec::new(),
        }
    }

    /// Copy of this state without the entries matching `record_id`/`category`.
    fn without(&self, record_id: u64, category: Category) -> Result<(Self, usize), IndexError> {
        let survivors = self
            .entries
            .iter()
            .filter(|entry| !(entry.record_id == record_id && entry.category == category))
            .collect::<Vec<_>>();
        let removed = self.entries.len() - survivors.len();

        let positions = survivors.iter().map(|entry| entry.position).collect::<Vec<_>>();
        let store = self.store.rebuild_from(&positions)?;
        let entries = survivors
            .into_iter()
            .enumerate()
            .map(|(position, entry)| IndexEntry {
                position,
                ..entry.clone()
            })
            .collect();

        Ok((Self { store, entries }, removed))
    }

    fn push(&mut self, vector: &[f32], mut entry: IndexEntry) -> Result<IndexEntry, IndexError> {
        entry.position = self.store.add(vector)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn check(&self) -> Result<(), IndexError> {
        if self.store.len() != self.entries.len() {
            return Err(IndexError::Corruption(format!(
                "{} vectors but {} metadata rows",
                self.store.len(),
                self.entries.len()
            )));
        }
        if let Some(entry) = self
            .entries
            .iter()
            .enumerate()
            .find_map(|(position, entry)| (entry.position != position).then_some(entry))
        {
            return Err(IndexError::Corruption(format!(
                "metadata row for record {} claims position {}",
                entry.record_id, entry.position
            )));
        }
        Ok(())
    }
}

pub struct SimilarityIndex<E> {
    embedder: E,
    paths: IndexPaths,
    dimension: usize,
    state: RwLock<IndexState>,
}

impl<E> SimilarityIndex<E>
where
    E: Embedder + Send + Sync,
{
    /// Loads both artifacts from `paths`. Missing, partial or corrupt artifacts
    /// yield an empty index; corruption is logged because entries may have been lost.
    pub fn open(embedder: E, paths: IndexPaths) -> Self {
        let dimension = embedder.dimensions();
        let state = match load_state(&paths, dimension) {
            Ok(Some(state)) => {
                info!(
                    entries = state.entries.len(),
                    path = %paths.vectors.display(),
                    "loaded similarity index"
                );
                state
            }
            Ok(None) => {
                info!(path = %paths.vectors.display(), "created new similarity index");
                IndexState::empty(dimension)
            }
            Err(error) => {
                error!(
                    error = %error,
                    vectors = %paths.vectors.display(),
                    metadata = %paths.metadata.display(),
                    "discarding unusable similarity index, previously indexed entries are lost until re-indexed"
                );
                IndexState::empty(dimension)
            }
        };

        Self {
            embedder,
            paths,
            dimension,
            state: RwLock::new(state),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn insert(
        &self,
        text: &str,
        record_id: u64,
        category: Category,
        extra: Map<String, Value>,
    ) -> Result<IndexEntry, IndexError> {
        let vector = self.embedder.embed(text).await?;
        self.insert_vector(vector, text, record_id, category, extra).await
    }

    /// Inserts a vector that was already computed for `text`, e.g. the one stored on a record.
    pub async fn insert_vector(
        &self,
        mut vector: Vec<f32>,
        text: &str,
        record_id: u64,
        category: Category,
        extra: Map<String, Value>,
    ) -> Result<IndexEntry, IndexError> {
        self.prepare(&mut vector)?;
        let entry = new_entry(text, record_id, category, extra);

        let mut state = self.state.write().await;
        let mut next = state.clone();
        let inserted = next.push(&vector, entry)?;

        persist(&self.paths, &next, &state)?;
        *state = next;

        debug!(record_id, category = %category, position = inserted.position, "indexed entry");
        Ok(inserted)
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        category: Option<Category>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 || self.is_empty().await {
            return Ok(Vec::new());
        }

        let mut vector = self.embedder.embed(query).await?;
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        if !l2_normalize(&mut vector) {
            debug!("query embedded to a zero vector, nothing to match");
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let fetch = k.saturating_mul(OVERFETCH).min(state.entries.len());

        let hits = state
            .store
            .search(&vector, fetch)
            .into_iter()
            .filter_map(|(position, score)| {
                let entry = state.entries.get(position)?;
                if category.is_some_and(|wanted| wanted != entry.category) {
                    return None;
                }
                Some(SearchHit {
                    record_id: entry.record_id,
                    category: entry.category,
                    score,
                    entry: entry.clone(),
                })
            })
            .take(k)
            .collect();

        Ok(hits)
    }

    /// Drops every entry for `record_id`/`category` and rebuilds the store from
    /// the remaining stored vectors. Returns how many entries were dropped.
    pub async fn remove(&self, record_id: u64, category: Category) -> Result<usize, IndexError> {
        let mut state = self.state.write().await;
        let (rebuilt, removed) = state.without(record_id, category)?;

        if removed == 0 {
            warn!(record_id, category = %category, "entry not found in similarity index");
            return Ok(0);
        }

        persist(&self.paths, &rebuilt, &state)?;
        *state = rebuilt;

        info!(record_id, category = %category, remaining = state.entries.len(), "removed entry from similarity index");
        Ok(removed)
    }

    /// Re-embeds `new_text` and replaces the entry for `record_id`/`category`,
    /// keeping any extra metadata the old entry carried.
    pub async fn update(
        &self,
        record_id: u64,
        category: Category,
        new_text: &str,
    ) -> Result<IndexEntry, IndexError> {
        let vector = self.embedder.embed(new_text).await?;
        self.update_vector(vector, record_id, category, new_text, Map::new())
            .await
    }

    /// [`Self::update`] with a vector that was already computed for `new_text`.
    /// Keys in `changed` overwrite the old entry's extra metadata.
    pub async fn update_vector(
        &self,
        mut vector: Vec<f32>,
        record_id: u64,
        category: Category,
        new_text: &str,
        changed: Map<String, Value>,
    ) -> Result<IndexEntry, IndexError> {
        self.prepare(&mut vector)?;

        let mut state = self.state.write().await;
        let mut extra = state
            .entries
            .iter()
            .find(|entry| entry.record_id == record_id && entry.category == category)
            .map(|entry| entry.extra.clone())
            .unwrap_or_default();
        extra.extend(changed);

        let (mut rebuilt, _) = state.without(record_id, category)?;
        let inserted = rebuilt.push(&vector, new_entry(new_text, record_id, category, extra))?;

        persist(&self.paths, &rebuilt, &state)?;
        *state = rebuilt;

        Ok(inserted)
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        let journal_entries = state
            .entries
            .iter()
            .filter(|entry| entry.category == Category::Journal)
            .count();

        IndexStats {
            total_entries: state.entries.len(),
            journal_entries,
            influence_entries: state.entries.len() - journal_entries,
            dimension: self.dimension,
            vectors_path: self.paths.vectors.display().to_string(),
            metadata_path: self.paths.metadata.display().to_string(),
        }
    }

    pub async fn flush(&self) -> Result<(), IndexError> {
        let state = self.state.read().await;
        persist(&self.paths, &state, &state)
    }

    fn prepare(&self, vector: &mut [f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        if !l2_normalize(vector) {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }
}

pub fn text_preview(text: &str) -> String {
    if text.chars().count() > TEXT_PREVIEW_CHARS {
        let mut preview = text.chars().take(TEXT_PREVIEW_CHARS).collect::<String>();
        preview.push_str("...");
        preview
    } else {
        text.to_string()
    }
}

fn new_entry(text: &str, record_id: u64, category: Category, mut extra: Map<String, Value>) -> IndexEntry {
    for key in RESERVED_KEYS {
        extra.remove(key);
    }

    IndexEntry {
        position: 0,
        record_id,
        category,
        text_preview: text_preview(text),
        extra,
    }
}

fn load_state(paths: &IndexPaths, dimension: usize) -> Result<Option<IndexState>, IndexError> {
    let has_vectors = paths.vectors.exists();
    let has_metadata = paths.metadata.exists();

    match (has_vectors, has_metadata) {
        (false, false) => return Ok(None),
        (true, false) => {
            return Err(IndexError::Corruption(format!(
                "metadata file {} is missing",
                paths.metadata.display()
            )))
        }
        (false, true) => {
            return Err(IndexError::Corruption(format!(
                "vector file {} is missing",
                paths.vectors.display()
            )))
        }
        (true, true) => {}
    }

    let store = FlatIpStore::from_bytes(&std::fs::read(&paths.vectors)?)?;
    let metadata: MetadataFile = serde_json::from_slice(&std::fs::read(&paths.metadata)?)
        .map_err(|error| IndexError::Corruption(format!("metadata is unreadable: {error}")))?;

    if store.dimension() != dimension || metadata.dimension != dimension {
        return Err(IndexError::Corruption(format!(
            "index dimension {} (metadata {}) does not match embedder dimension {dimension}",
            store.dimension(),
            metadata.dimension
        )));
    }

    let state = IndexState {
        store,
        entries: metadata.entries,
    };
    state.check()?;
    Ok(Some(state))
}

/// Writes `next` as the pair of artifacts. Both temp files are written and
/// synced before either rename. If the metadata rename fails after the vector
/// rename, the vector file is put back to `previous` so the pair on disk
/// still matches.
fn persist(paths: &IndexPaths, next: &IndexState, previous: &IndexState) -> Result<(), IndexError> {
    next.check()?;

    let metadata = metadata_bytes(next)?;
    let vectors_temp = staging_path(&paths.vectors);
    let metadata_temp = staging_path(&paths.metadata);

    let staged = stage(&vectors_temp, &next.store.to_bytes())
        .and_then(|()| stage(&metadata_temp, &metadata))
        .and_then(|()| std::fs::rename(&vectors_temp, &paths.vectors));
    if let Err(error) = staged {
        discard(&vectors_temp);
        discard(&metadata_temp);
        return Err(error.into());
    }

    if let Err(error) = std::fs::rename(&metadata_temp, &paths.metadata) {
        discard(&metadata_temp);
        if let Err(restore) = restore_vectors(paths, previous) {
            error!(
                error = %restore,
                path = %paths.vectors.display(),
                "failed to restore vector file, index artifacts no longer match"
            );
        }
        return Err(error.into());
    }

    Ok(())
}

fn metadata_bytes(state: &IndexState) -> Result<Vec<u8>, IndexError> {
    Ok(serde_json::to_vec(&MetadataFile {
        dimension: state.store.dimension(),
        entries: state.entries.clone(),
    })?)
}

/// Puts the vector file back in line with the metadata file still on disk.
fn restore_vectors(paths: &IndexPaths, previous: &IndexState) -> std::io::Result<()> {
    if paths.metadata.exists() {
        write_atomic(&paths.vectors, &previous.store.to_bytes())
    } else {
        std::fs::remove_file(&paths.vectors)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Writes and syncs `bytes` at `temp_path` without touching the final file.
fn stage(temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = temp_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = BufWriter::new(File::create(temp_path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

fn discard(temp_path: &Path) {
    if let Err(error) = std::fs::remove_file(temp_path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %temp_path.display(), error = %error, "failed to remove temp file");
        }
    }
}

/// temp file -> fsync -> rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_path = staging_path(path);
    if let Err(error) = stage(&temp_path, bytes) {
        discard(&temp_path);
        return Err(error);
    }

    std::fs::rename(&temp_path, path)
}
