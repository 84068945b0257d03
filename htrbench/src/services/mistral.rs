//! Mistral vision adapter, using the OpenAI-compatible chat completions
//! endpoint with the image inlined as a base64 data URL.
//!
//! This backend returns plain text only; it reports no box geometry, so
//! annotated images for it show the original page unmarked.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::credentials::credentials_for;
use crate::error::{HtrError, Result};
use crate::models::Recognition;

use super::{read_image_checked, retry_after_secs, ServiceAdapter};

const MAX_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_ENDPOINT: &str = "https://api.mistral.ai/v1";
const MODEL: &str = "pixtral-12b-2409";
const PROMPT: &str = "Transcribe all handwritten and printed text in this image. \
    Return only the transcribed text, one line of text per output line, \
    without any explanations or formatting.";

pub struct MistralAdapter {
    client: Client,
    key: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

impl MistralAdapter {
    pub fn new(config: &Config) -> Result<Self> {
        let creds = credentials_for("mistral", config.credentials_dir.as_deref())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| HtrError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            key: creds.key,
            endpoint: creds
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[async_trait]
impl ServiceAdapter for MistralAdapter {
    fn name(&self) -> &'static str {
        "mistral"
    }

    fn max_rate(&self) -> f64 {
        1.0
    }

    fn max_size(&self) -> Option<u64> {
        Some(MAX_SIZE)
    }

    fn max_dimensions(&self) -> Option<(u32, u32)> {
        None
    }

    async fn recognize(&self, image: &Path) -> Result<Recognition> {
        let bytes = read_image_checked(image, self.max_size(), self.max_dimensions())?;
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));

        let request = ChatRequest {
            model: MODEL.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: 4096,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.key))
            .json(&request)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(HtrError::Auth(format!(
                    "Mistral rejected the credentials ({})",
                    response.status()
                )))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(HtrError::RateLimit {
                    retry_after: retry_after_secs(&response),
                })
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(HtrError::Service(format!(
                    "Chat request failed: {status} - {body}"
                )));
            }
            _ => {}
        }

        let data: serde_json::Value = response.json().await?;
        let parsed: ChatResponse = serde_json::from_value(data.clone())?;
        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| HtrError::Service("Chat reply contained no choices".to_string()))?;

        Ok(Recognition {
            data,
            text,
            boxes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_in_chat_format() {
        let request = ChatRequest {
            model: MODEL.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: "hello".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,AAAA".to_string(),
                        },
                    },
                ],
            }],
            max_tokens: 4096,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], MODEL);
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["messages"][0]["content"][1]["type"], "image_url");
        assert!(json["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": "the text"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, "the text");
    }
}
