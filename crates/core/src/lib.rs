pub mod chat;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod orchestrator;
pub mod segmenter;
pub mod store;
pub mod tagging;
pub mod traits;

pub use chat::ChatClient;
pub use config::{records_path, IndexPaths, OpenAiConfig, DEFAULT_OPENAI_BASE_URL};
pub use embeddings::{
    normalize_whitespace, CharacterNgramEmbedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IndexError, IngestError, StorageError};
pub use fingerprint::{image_fingerprint, text_fingerprint};
pub use index::{FlatIpStore, SimilarityIndex};
pub use ingest::{discover_image_files, expand_inputs};
pub use models::{
    Analysis, Category, ContentRecord, ImageOutcome, IndexEntry, IndexStats, InfluenceOutcome,
    IngestFailure, IngestSummary, NewRecord, OcrOutput, ProcessedEntry, PromptConfig, SearchHit,
};
pub use ocr::{OcrChain, TesseractOcr, VisionOcr};
pub use orchestrator::JournalIngestor;
pub use segmenter::{DateBlock, DateSegmenter};
pub use store::MemoryRecordStore;
pub use tagging::{NoopTagger, OpenAiTagger, PromptChoice, PRESET_NAMES};
pub use traits::{Embedder, OcrEngine, RecordStore, Tagger};
