use crate::error::IngestError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const VECTORS_FILE: &str = "journal.vectors";
const METADATA_FILE: &str = "journal.meta.json";
const RECORDS_FILE: &str = "records.json";

/// Connection settings shared by every OpenAI-compatible collaborator.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, IngestError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(IngestError::InvalidArgument("OpenAI base url is empty".to_string()));
        }

        // Url::join drops the last path segment unless it ends with a slash.
        let base_url = Url::parse(&format!("{trimmed}/"))?;
        let api_key = api_key.and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        Ok(Self {
            base_url,
            api_key,
            timeout,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, IngestError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    pub fn http_client(&self) -> Result<reqwest::Client, IngestError> {
        Ok(reqwest::Client::builder().timeout(self.timeout).build()?)
    }
}

/// The two co-located index artifacts. They are always read and written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub vectors: PathBuf,
    pub metadata: PathBuf,
}

impl IndexPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors: dir.join(VECTORS_FILE),
            metadata: dir.join(METADATA_FILE),
        }
    }
}

pub fn records_path(dir: &Path) -> PathBuf {
    dir.join(RECORDS_FILE)
}
