use crate::chat::ChatClient;
use crate::error::IngestError;
use crate::models::{Analysis, PromptConfig};
use crate::traits::Tagger;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use tracing::warn;

const TAGGING_MAX_TOKENS: u32 = 500;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a JSON generator. Analyze journal text and return structured data. Keep tags concise (≤5) and insights brief (≤3 sentences each).";
const JSON_SHAPE: &str = r#"Return { "tags": [...≤5], "core_insights": [...≤3 sentences] }"#;

pub const PRESET_NAMES: [&str; 5] = ["default", "therapist", "coach", "stoic", "productivity"];

/// Built-in prompt template by name.
pub fn preset(name: &str) -> Option<PromptConfig> {
    let (system, focus) = match name {
        "default" => (
            DEFAULT_SYSTEM_PROMPT,
            "Capture the main themes as tags and the most important realizations as insights.",
        ),
        "therapist" => (
            "You are a warm, attentive therapist reading a client's journal. You answer only in JSON.",
            "Tag emotions and recurring patterns. Write insights in the second person, each ending with a gentle question you could reflect on.",
        ),
        "coach" => (
            "You are a supportive performance coach reviewing a journal entry. You answer only in JSON.",
            "Tag goals, obstacles and wins. Write insights in the second person as concrete next steps you can take.",
        ),
        "stoic" => (
            "You are a Stoic mentor in the tradition of Marcus Aurelius and Epictetus. You answer only in JSON.",
            "Tag what was and was not within your control. Write insights in the second person, framed by Stoic principles.",
        ),
        "productivity" => (
            "You are a productivity consultant reading a work journal. You answer only in JSON.",
            "Tag projects, time sinks and priorities. Write insights in the second person about how you can focus your time and energy.",
        ),
        _ => return None,
    };

    Some(PromptConfig {
        name: name.to_string(),
        system_prompt: system.to_string(),
        instructions: format!("{focus}\n\n{JSON_SHAPE}"),
    })
}

/// The prompt handed to the tagger plus a label of where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptChoice {
    pub config: PromptConfig,
    pub used: String,
}

impl PromptChoice {
    pub fn default_prompt() -> Self {
        Self {
            config: default_config(),
            used: "default".to_string(),
        }
    }

    /// Preset wins over prompt file, prompt file wins over the default.
    /// An unknown preset is an error; an unreadable prompt file falls back to the default.
    pub fn resolve(preset_name: Option<&str>, prompt_file: Option<&Path>) -> Result<Self, IngestError> {
        if let Some(name) = preset_name {
            let config = preset(name).ok_or_else(|| {
                IngestError::InvalidArgument(format!(
                    "unknown preset {name}, expected one of {}",
                    PRESET_NAMES.join(", ")
                ))
            })?;
            return Ok(Self {
                config,
                used: format!("preset:{name}"),
            });
        }

        if let Some(path) = prompt_file {
            match load_prompt_file(path) {
                Ok(config) => {
                    return Ok(Self {
                        config,
                        used: format!("file:{}", path.display()),
                    })
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "prompt file unusable, using default prompt");
                }
            }
        }

        Ok(Self::default_prompt())
    }
}

fn default_config() -> PromptConfig {
    PromptConfig {
        name: "default".to_string(),
        system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        instructions: JSON_SHAPE.to_string(),
    }
}

pub fn load_prompt_file(path: &Path) -> Result<PromptConfig, IngestError> {
    let raw = std::fs::read_to_string(path)?;
    let config: PromptConfig = serde_json::from_str(&raw)?;
    if config.system_prompt.trim().is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "prompt file {} has an empty system_prompt",
            path.display()
        )));
    }
    Ok(config)
}

/// Tag and insight extraction through a chat model in JSON mode.
pub struct OpenAiTagger {
    chat: ChatClient,
}

impl OpenAiTagger {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Tagger for OpenAiTagger {
    async fn analyze(&self, text: &str, prompt: &PromptConfig) -> Result<Analysis, IngestError> {
        let messages = [
            json!({ "role": "system", "content": prompt.system_prompt }),
            json!({
                "role": "user",
                "content": format!("Transcript: {text}\n\n{}", prompt.instructions),
            }),
        ];

        let content = self
            .chat
            .complete(&messages, TAGGING_MAX_TOKENS, true)
            .await
            .map_err(|error| IngestError::TaggingFailed(format!("{}: {error}", self.chat.model())))?;

        parse_analysis(&content)
    }
}

/// Tagger that never enriches; used when no model is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagger;

#[async_trait]
impl Tagger for NoopTagger {
    async fn analyze(&self, _text: &str, _prompt: &PromptConfig) -> Result<Analysis, IngestError> {
        Ok(Analysis::default())
    }
}

pub fn parse_analysis(content: &str) -> Result<Analysis, IngestError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|error| IngestError::TaggingFailed(format!("response is not JSON: {error}")))?;

    let tags = strings_at(&value, &["tags", "core_tags"]);
    let insights = strings_at(&value, &["core_insights", "insights"]);
    Ok(Analysis::bounded(tags, insights))
}

fn strings_at(value: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}
