//! Microsoft Azure Read adapter.
//!
//! The Read API is asynchronous on the server side: submitting the image
//! returns an `Operation-Location` URL which is polled until the analysis
//! succeeds or fails.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::credentials::credentials_for;
use crate::error::{HtrError, Result};
use crate::models::{BoxKind, Recognition, TextBox};

use super::{read_image_checked, retry_after_secs, ServiceAdapter};

const MAX_SIZE: u64 = 4 * 1024 * 1024;
const MAX_DIMENSIONS: (u32, u32) = (10_000, 10_000);
/// Upper bound on status polls for one submission.
const MAX_POLLS: u32 = 60;

pub struct MicrosoftAdapter {
    client: Client,
    key: String,
    endpoint: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadOperation {
    status: String,
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    read_results: Vec<ReadResult>,
}

#[derive(Debug, Deserialize)]
struct ReadResult {
    #[serde(default)]
    lines: Vec<ReadLine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadLine {
    bounding_box: Vec<f32>,
    text: String,
    #[serde(default)]
    words: Vec<ReadWord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadWord {
    bounding_box: Vec<f32>,
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl MicrosoftAdapter {
    pub fn new(config: &Config) -> Result<Self> {
        let creds = credentials_for("microsoft", config.credentials_dir.as_deref())?;
        let endpoint = creds.endpoint.ok_or_else(|| {
            HtrError::Auth("Microsoft credentials must include an endpoint".to_string())
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| HtrError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            key: creds.key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    async fn submit(&self, bytes: Vec<u8>) -> Result<String> {
        let url = format!("{}/vision/v3.2/read/analyze", self.endpoint);
        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        match response.status() {
            StatusCode::ACCEPTED => response
                .headers()
                .get("Operation-Location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    HtrError::Service("Read API reply lacked an Operation-Location".to_string())
                }),
            status => Err(classify_failure(status, response).await),
        }
    }

    async fn poll(&self, operation: &str) -> Result<AnalyzeResult> {
        for _ in 0..MAX_POLLS {
            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .get(operation)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(classify_failure(response.status(), response).await);
            }
            let op: ReadOperation = response.json().await?;
            debug!("Read operation status: {}", op.status);
            match op.status.as_str() {
                "succeeded" => {
                    return op.analyze_result.ok_or_else(|| {
                        HtrError::Service("Read operation succeeded without a result".to_string())
                    })
                }
                "failed" => {
                    return Err(HtrError::Service(
                        "Read operation reported failure".to_string(),
                    ))
                }
                _ => continue,
            }
        }
        Err(HtrError::Service(format!(
            "Read operation still pending after {MAX_POLLS} polls"
        )))
    }
}

#[async_trait]
impl ServiceAdapter for MicrosoftAdapter {
    fn name(&self) -> &'static str {
        "microsoft"
    }

    fn max_rate(&self) -> f64 {
        // Free-tier limit of 20 calls per minute.
        0.333
    }

    fn max_size(&self) -> Option<u64> {
        Some(MAX_SIZE)
    }

    fn max_dimensions(&self) -> Option<(u32, u32)> {
        Some(MAX_DIMENSIONS)
    }

    async fn recognize(&self, image: &Path) -> Result<Recognition> {
        let bytes = read_image_checked(image, self.max_size(), self.max_dimensions())?;
        let operation = self.submit(bytes).await?;
        let result = self.poll(&operation).await?;
        Ok(recognition_from(result))
    }
}

async fn classify_failure(status: StatusCode, response: reqwest::Response) -> HtrError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            HtrError::Auth(format!("Microsoft rejected the credentials ({status})"))
        }
        StatusCode::TOO_MANY_REQUESTS => HtrError::RateLimit {
            retry_after: retry_after_secs(&response),
        },
        _ => {
            let body = response.text().await.unwrap_or_default();
            HtrError::Service(format!("Read API request failed: {status} - {body}"))
        }
    }
}

fn recognition_from(result: AnalyzeResult) -> Recognition {
    let data = serde_json::json!({
        "readResults": result.read_results.iter().map(|page| {
            serde_json::json!({
                "lines": page.lines.iter().map(|line| serde_json::json!({
                    "boundingBox": line.bounding_box,
                    "text": line.text,
                    "words": line.words.iter().map(|w| serde_json::json!({
                        "boundingBox": w.bounding_box,
                        "text": w.text,
                        "confidence": w.confidence,
                    })).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    });

    let mut text = String::new();
    let mut boxes = Vec::new();
    for page in &result.read_results {
        for line in &page.lines {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&line.text);
            let confidence = if line.words.is_empty() {
                1.0
            } else {
                line.words.iter().map(|w| w.confidence).sum::<f32>() / line.words.len() as f32
            };
            boxes.push(TextBox {
                kind: BoxKind::Line,
                polygon: polygon_from(&line.bounding_box),
                text: line.text.clone(),
                confidence,
            });
            for word in &line.words {
                boxes.push(TextBox {
                    kind: BoxKind::Word,
                    polygon: polygon_from(&word.bounding_box),
                    text: word.text.clone(),
                    confidence: word.confidence,
                });
            }
        }
    }
    Recognition { data, text, boxes }
}

/// The Read API encodes quadrilaterals as a flat list of eight coordinates
/// starting at the upper-left corner.
fn polygon_from(bounding_box: &[f32]) -> Vec<(f32, f32)> {
    bounding_box.chunks_exact(2).map(|c| (c[0], c[1])).collect()
}
