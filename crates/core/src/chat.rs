use crate::config::{OpenAiConfig, DEFAULT_CHAT_MODEL};
use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Minimal client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatClient {
    config: OpenAiConfig,
    client: reqwest::Client,
    model: String,
}

impl ChatClient {
    pub fn new(config: OpenAiConfig, model: Option<String>) -> Result<Self, IngestError> {
        let client = config.http_client()?;
        Ok(Self {
            config,
            client,
            model: model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends `messages` and returns the first choice's content.
    pub async fn complete(
        &self,
        messages: &[Value],
        max_tokens: u32,
        json_mode: bool,
    ) -> Result<String, IngestError> {
        let endpoint = self.config.endpoint("chat/completions")?;
        let payload = ChatRequest {
            model: &self.model,
            messages,
            max_tokens,
            response_format: json_mode.then(|| serde_json::json!({ "type": "json_object" })),
        };

        let mut request = self.client.post(endpoint.clone()).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(IngestError::BackendResponse {
                backend: endpoint.to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        first_content(parsed)
    }
}

fn first_content(response: ChatResponse) -> Result<String, IngestError> {
    response
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| IngestError::BackendResponse {
            backend: "chat".to_string(),
            details: "response has no content".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_content_is_trimmed() -> Result<(), Box<dyn std::error::Error>> {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"  hello\n"}}]}"#,
        )?;
        assert_eq!(first_content(response)?, "hello");
        Ok(())
    }

    #[test]
    fn missing_content_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#)?;
        assert!(first_content(response).is_err());

        let response: ChatResponse = serde_json::from_str(r#"{}"#)?;
        assert!(first_content(response).is_err());
        Ok(())
    }
}
