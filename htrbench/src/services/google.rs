//! Google Cloud Vision adapter, using `DOCUMENT_TEXT_DETECTION` with the
//! handwriting language hint.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::Config;
use crate::credentials::credentials_for;
use crate::error::{HtrError, Result};
use crate::models::{BoxKind, Recognition, TextBox};

use super::{read_image_checked, retry_after_secs, ServiceAdapter};

const MAX_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com";

pub struct GoogleAdapter {
    client: Client,
    key: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<FullTextAnnotation>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct FullTextAnnotation {
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Paragraph {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Word {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    symbols: Vec<Symbol>,
}

#[derive(Debug, Deserialize)]
struct Symbol {
    text: String,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

/// Vision omits a vertex coordinate when it is 0 or falls outside the
/// image, so both fields are optional.
#[derive(Debug, Deserialize)]
struct Vertex {
    x: Option<f32>,
    y: Option<f32>,
}

impl GoogleAdapter {
    pub fn new(config: &Config) -> Result<Self> {
        let creds = credentials_for("google", config.credentials_dir.as_deref())?;
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
impl ServiceAdapter for GoogleAdapter {
    fn name(&self) -> &'static str {
        "google"
    }

    fn max_rate(&self) -> f64 {
        30.0
    }

    fn max_size(&self) -> Option<u64> {
        Some(MAX_SIZE)
    }

    fn max_dimensions(&self) -> Option<(u32, u32)> {
        // Vision does not document a hard pixel bound.
        None
    }

    async fn recognize(&self, image: &Path) -> Result<Recognition> {
        let bytes = read_image_checked(image, self.max_size(), self.max_dimensions())?;
        let body = serde_json::json!({
            "requests": [{
                "image": { "content": STANDARD.encode(&bytes) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "imageContext": { "languageHints": ["en-t-i0-handwrit"] },
            }]
        });

        let url = format!("{}/v1/images:annotate?key={}", self.endpoint, self.key);
        let response = self.client.post(&url).json(&body).send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(HtrError::Auth(format!(
                    "Google rejected the credentials ({})",
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
                    "Vision request failed: {status} - {body}"
                )));
            }
            _ => {}
        }

        let data: serde_json::Value = response.json().await?;
        let parsed: AnnotateResponse = serde_json::from_value(data.clone())?;
        let image_response = parsed
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| HtrError::Service("Vision reply contained no responses".to_string()))?;

        if let Some(error) = image_response.error {
            return Err(match error.code {
                // PERMISSION_DENIED and UNAUTHENTICATED in Vision's
                // embedded status codes.
                7 | 16 => HtrError::Auth(format!("Vision error: {}", error.message)),
                _ => HtrError::Service(format!(
                    "Vision error {}: {}",
                    error.code, error.message
                )),
            });
        }

        let annotation = image_response.full_text_annotation;
        let (text, boxes) = match &annotation {
            Some(a) => (a.text.trim_end().to_string(), boxes_from(a)),
            None => (String::new(), Vec::new()),
        };
        Ok(Recognition { data, text, boxes })
    }
}

fn boxes_from(annotation: &FullTextAnnotation) -> Vec<TextBox> {
    let mut boxes = Vec::new();
    for page in &annotation.pages {
        for block in &page.blocks {
            for paragraph in &block.paragraphs {
                let text = paragraph
                    .words
                    .iter()
                    .map(word_text)
                    .collect::<Vec<_>>()
                    .join(" ");
                if let Some(polygon) = polygon_from(paragraph.bounding_box.as_ref()) {
                    boxes.push(TextBox {
                        kind: BoxKind::Paragraph,
                        polygon,
                        text,
                        confidence: paragraph.confidence,
                    });
                }
                for word in &paragraph.words {
                    if let Some(polygon) = polygon_from(word.bounding_box.as_ref()) {
                        boxes.push(TextBox {
                            kind: BoxKind::Word,
                            polygon,
                            text: word_text(word),
                            confidence: word.confidence,
                        });
                    }
                }
            }
        }
    }
    boxes
}

fn word_text(word: &Word) -> String {
    word.symbols.iter().map(|s| s.text.as_str()).collect()
}

/// Quadrilateral from a bounding poly, dropping any vertex missing a
/// coordinate. A poly reduced below four corners is unusable and skipped.
fn polygon_from(poly: Option<&BoundingPoly>) -> Option<Vec<(f32, f32)>> {
    let poly = poly?;
    let polygon: Vec<(f32, f32)> = poly
        .vertices
        .iter()
        .filter_map(|v| Some((v.x?, v.y?)))
        .collect();
    (polygon.len() >= 4).then_some(polygon)
}
