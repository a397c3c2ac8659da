use crate::chat::ChatClient;
use crate::error::IngestError;
use crate::models::OcrOutput;
use crate::traits::OcrEngine;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::ImageFormat;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const VISION_CONFIDENCE: f32 = 0.9;
const VISION_MAX_TOKENS: u32 = 1000;
const VISION_SYSTEM_PROMPT: &str = "You are an OCR system. Extract all text from the image exactly as written, preserving line breaks and formatting. Return only the extracted text.";
const VISION_USER_PROMPT: &str = "Please extract all text from this handwritten journal page:";

/// OCR through a vision-capable chat model.
pub struct VisionOcr {
    chat: ChatClient,
}

impl VisionOcr {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

fn image_mime(path: &Path) -> &'static str {
    ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/jpeg")
}

#[async_trait]
impl OcrEngine for VisionOcr {
    fn name(&self) -> &str {
        "vision"
    }

    async fn extract_text(&self, image: &Path) -> Result<OcrOutput, IngestError> {
        let bytes = tokio::fs::read(image).await?;
        let data_url = format!("data:{};base64,{}", image_mime(image), STANDARD.encode(bytes));

        let messages = [
            json!({ "role": "system", "content": VISION_SYSTEM_PROMPT }),
            json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": VISION_USER_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }),
        ];

        let text = self
            .chat
            .complete(&messages, VISION_MAX_TOKENS, false)
            .await
            .map_err(|error| {
                IngestError::OcrFailed(format!("{} via {}: {error}", image.display(), self.chat.model()))
            })?;

        Ok(OcrOutput {
            text,
            confidence: VISION_CONFIDENCE,
            engine: self.name().to_string(),
        })
    }
}

/// OCR through the `tesseract` command line tool.
pub struct TesseractOcr {
    binary: String,
    timeout: Duration,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn extract_text(&self, image: &Path) -> Result<OcrOutput, IngestError> {
        let mut command = Command::new(&self.binary);
        command
            .arg(image)
            .arg("stdout")
            .args(["--psm", "6", "tsv"])
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                IngestError::OcrFailed(format!(
                    "{} timed out after {:?} on {}",
                    self.binary,
                    self.timeout,
                    image.display()
                ))
            })?
            .map_err(|error| IngestError::OcrFailed(format!("failed to run {}: {error}", self.binary)))?;

        if !output.status.success() {
            return Err(IngestError::OcrFailed(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let (text, confidence) = parse_tesseract_tsv(&String::from_utf8_lossy(&output.stdout));
        Ok(OcrOutput {
            text,
            confidence,
            engine: self.name().to_string(),
        })
    }
}

/// Rebuilds line-broken text from tesseract TSV output and averages the positive word confidences.
pub fn parse_tesseract_tsv(tsv: &str) -> (String, f32) {
    let mut text = String::new();
    let mut current_line = None;
    let mut confidences = Vec::new();

    for row in tsv.lines() {
        let columns = row.split('\t').collect::<Vec<_>>();
        if columns.len() < 12 || columns[0] != "5" {
            continue;
        }

        let word = columns[11].trim();
        if word.is_empty() {
            continue;
        }

        let line_key = (columns[1], columns[2], columns[3], columns[4]);
        match current_line {
            Some(previous) if previous == line_key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(line_key);
        text.push_str(word);

        if let Ok(confidence) = columns[10].trim().parse::<f32>() {
            if confidence > 0.0 {
                confidences.push(confidence);
            }
        }
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32 / 100.0
    };

    (text, confidence)
}

/// Primary engine with an explicit second attempt on failure or empty output.
pub struct OcrChain {
    primary: Box<dyn OcrEngine + Send + Sync>,
    fallback: Option<Box<dyn OcrEngine + Send + Sync>>,
}

impl OcrChain {
    pub fn new(primary: Box<dyn OcrEngine + Send + Sync>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn OcrEngine + Send + Sync>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

async fn attempt(engine: &(dyn OcrEngine + Send + Sync), image: &Path) -> Option<OcrOutput> {
    match engine.extract_text(image).await {
        Ok(output) if !output.text.trim().is_empty() => {
            debug!(
                engine = engine.name(),
                confidence = output.confidence,
                path = %image.display(),
                "extracted text"
            );
            Some(output)
        }
        Ok(_) => {
            warn!(engine = engine.name(), path = %image.display(), "OCR returned no text");
            None
        }
        Err(error) => {
            warn!(engine = engine.name(), path = %image.display(), error = %error, "OCR failed");
            None
        }
    }
}

#[async_trait]
impl OcrEngine for OcrChain {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn extract_text(&self, image: &Path) -> Result<OcrOutput, IngestError> {
        if let Some(output) = attempt(self.primary.as_ref(), image).await {
            return Ok(output);
        }

        if let Some(fallback) = &self.fallback {
            if let Some(output) = attempt(fallback.as_ref(), image).await {
                return Ok(output);
            }
        }

        Err(IngestError::NoTextExtracted)
    }
}
