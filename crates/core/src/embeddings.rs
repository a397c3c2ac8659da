use crate::config::{OpenAiConfig, DEFAULT_EMBEDDING_MODEL};
use crate::error::{EmbeddingError, IngestError};
use crate::traits::Embedder;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

const DEFAULT: usize = 1536;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

const MAX_RETRIES: u32 = 3;

/// Collapses every run of whitespace, newlines included, to a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Scales `vector` to unit length in place. Returns `false` for a zero vector.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude <= f32::EPSILON || !magnitude.is_finite() {
        return false;
    }

    for value in vector.iter_mut() {
        *value /= magnitude;
    }
    true
}

/// Offline embedder hashing character trigrams into buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = normalize_whitespace(text).to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    config: OpenAiConfig,
    client: reqwest::Client,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig, model: Option<String>, dimensions: usize) -> Result<Self, IngestError> {
        let client = config.http_client()?;
        Ok(Self {
            config,
            client,
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            dimensions,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request_once(&self, input: &str) -> Result<Vec<f32>, AttemptError> {
        let endpoint = self
            .config
            .endpoint("embeddings")
            .map_err(|error| AttemptError::Fatal(EmbeddingError::Unavailable(error.to_string())))?;

        let mut request = self
            .client
            .post(endpoint)
            .json(&json!({ "model": self.model, "input": input }));
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => return Err(AttemptError::Retryable(EmbeddingError::Http(error))),
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AttemptError::Retryable(EmbeddingError::Unavailable(format!(
                "embedding endpoint returned {status}"
            ))));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Fatal(EmbeddingError::Unavailable(format!(
                "embedding endpoint returned {status}: {body}"
            ))));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| AttemptError::Fatal(EmbeddingError::InvalidResponse(error.to_string())))?;

        parse_embedding(payload, self.dimensions).map_err(AttemptError::Fatal)
    }
}

enum AttemptError {
    Retryable(EmbeddingError),
    Fatal(EmbeddingError),
}

fn parse_embedding(payload: EmbeddingResponse, dimensions: usize) -> Result<Vec<f32>, EmbeddingError> {
    let vector = payload
        .data
        .into_iter()
        .next()
        .map(|datum| datum.embedding)
        .ok_or_else(|| EmbeddingError::InvalidResponse("response has no embedding".to_string()))?;

    if vector.len() != dimensions {
        return Err(EmbeddingError::InvalidResponse(format!(
            "embedding dimension {} != {}",
            vector.len(),
            dimensions
        )));
    }

    Ok(vector)
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = normalize_whitespace(text);
        if input.is_empty() {
            return Err(EmbeddingError::Unavailable("cannot embed empty text".to_string()));
        }

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            match self.request_once(&input).await {
                Ok(vector) => return Ok(vector),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Retryable(error)) => {
                    warn!(attempt, error = %error, "embedding request failed, retrying");
                    last_error = Some(error);
                }
            }
        }

        Err(EmbeddingError::Unavailable(
            last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}
