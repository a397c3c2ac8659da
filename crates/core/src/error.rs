use crate::models::Category;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("index corruption: {0}")]
    Corruption(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot index a zero-norm vector")]
    ZeroNormVector,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{category} record with hash {hash} already exists")]
    Conflict { category: Category, hash: String },

    #[error("{category} record {id} not found")]
    NotFound { category: Category, id: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unreadable image: {0}")]
    UnreadableImage(String),

    #[error("no text extracted")]
    NoTextExtracted,

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("tagging failed: {0}")]
    TaggingFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
