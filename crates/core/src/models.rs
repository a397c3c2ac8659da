use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_TAGS: usize = 5;
pub const MAX_INSIGHTS: usize = 3;
pub const TEXT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Journal,
    Influence,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Journal => "journal",
            Category::Influence => "influence",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "journal" => Ok(Category::Journal),
            "influence" => Ok(Category::Influence),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// A persisted journal entry or influence.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: u64,
    pub category: Category,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
    /// Perceptual hash of the page image. Only the first record created from an image carries it.
    pub source_hash: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    pub occurred_at: Option<NaiveDate>,
    #[serde(with = "embedding_base64")]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub image_paths: Vec<String>,
    pub title: Option<String>,
    pub source_url: Option<String>,
}

/// A record that passed every duplicate check and is waiting for an id from storage.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub category: Category,
    pub text: String,
    pub content_hash: String,
    pub source_hash: Option<String>,
    pub tags: Vec<String>,
    pub insights: Vec<String>,
    pub occurred_at: Option<NaiveDate>,
    pub embedding: Vec<f32>,
    pub image_paths: Vec<String>,
    pub title: Option<String>,
    pub source_url: Option<String>,
}

impl NewRecord {
    pub fn into_record(self, id: u64, created_at: DateTime<Utc>) -> ContentRecord {
        ContentRecord {
            id,
            category: self.category,
            text: self.text,
            created_at,
            content_hash: self.content_hash,
            source_hash: self.source_hash,
            tags: self.tags,
            insights: self.insights,
            occurred_at: self.occurred_at,
            embedding: self.embedding,
            image_paths: self.image_paths,
            title: self.title,
            source_url: self.source_url,
        }
    }
}

/// Tags and insights returned by the tagging collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Analysis {
    pub tags: Vec<String>,
    pub insights: Vec<String>,
}

impl Analysis {
    pub fn bounded(tags: Vec<String>, insights: Vec<String>) -> Self {
        let tags = tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .take(MAX_TAGS)
            .collect();
        let insights = insights
            .into_iter()
            .map(|insight| insight.trim().to_string())
            .filter(|insight| !insight.is_empty())
            .take(MAX_INSIGHTS)
            .collect();

        Self { tags, insights }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Advisory only; logged but never used for control flow.
    pub confidence: f32,
    pub engine: String,
}

/// Named prompt template handed to the tagging collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptConfig {
    pub name: String,
    pub system_prompt: String,
    pub instructions: String,
}

/// Metadata row stored next to the vector at the same ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub position: usize,
    pub record_id: u64,
    pub category: Category,
    pub text_preview: String,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub record_id: u64,
    pub category: Category,
    pub score: f32,
    pub entry: IndexEntry,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexStats {
    pub total_entries: usize,
    pub journal_entries: usize,
    pub influence_entries: usize,
    pub dimension: usize,
    pub vectors_path: String,
    pub metadata_path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub record_id: u64,
    pub source_file: String,
    pub date: Option<NaiveDate>,
    pub tag_count: usize,
    pub insight_count: usize,
}

/// Terminal state of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Processed {
        entries: Vec<ProcessedEntry>,
        block_errors: Vec<String>,
    },
    SkippedDuplicateImage {
        existing_id: u64,
    },
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestFailure {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub prompt_config_used: String,
    pub processed: Vec<ProcessedEntry>,
    pub skipped_duplicates: Vec<String>,
    pub errors: Vec<IngestFailure>,
}

/// Outcome of adding one influence text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfluenceOutcome {
    Created { record_id: u64, tag_count: usize },
    Duplicate { existing_id: u64 },
}

pub(crate) mod embedding_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(vector: &[f32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = vector
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<u8>>();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(de::Error::custom(format!(
                "embedding blob length {} is not a multiple of 4",
                bytes.len()
            )));
        }

        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_is_bounded_and_trimmed() {
        let analysis = Analysis::bounded(
            (0..8).map(|n| format!(" tag{n} ")).collect(),
            vec!["one".into(), "".into(), "two".into(), "three".into(), "four".into()],
        );

        assert_eq!(analysis.tags.len(), MAX_TAGS);
        assert_eq!(analysis.tags[0], "tag0");
        assert_eq!(analysis.insights, vec!["one", "two", "three"]);
    }

    #[test]
    fn record_embedding_survives_json() -> Result<(), Box<dyn std::error::Error>> {
        let record = NewRecord {
            category: Category::Journal,
            text: "June 12, 2025 walked by the river".to_string(),
            content_hash: "abc".to_string(),
            source_hash: None,
            tags: vec!["walk".to_string()],
            insights: Vec::new(),
            occurred_at: NaiveDate::from_ymd_opt(2025, 6, 12),
            embedding: vec![0.25, -1.5, 3.0],
            image_paths: Vec::new(),
            title: None,
            source_url: None,
        }
        .into_record(7, Utc::now());

        let json = serde_json::to_string(&record)?;
        assert!(!json.contains("source_hash"));

        let parsed: ContentRecord = serde_json::from_str(&json)?;
        assert_eq!(parsed.embedding, vec![0.25, -1.5, 3.0]);
        assert_eq!(parsed.occurred_at, record.occurred_at);
        Ok(())
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Journal".parse::<Category>(), Ok(Category::Journal));
        assert_eq!("influence".parse::<Category>(), Ok(Category::Influence));
        assert!("video".parse::<Category>().is_err());
    }
}
