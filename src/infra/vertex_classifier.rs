use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app::ports::{ClassificationRequest, ClassificationResponse, ClassifierPort};
use crate::constants::IMAGE_CONTENT_TYPE;
use crate::error::{MigrationError, Result};

static PUBLIC_STORAGE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://storage\.googleapis\.com/([^/]+)/(.+)$").expect("static storage url regex"));

/// Gemini `generateContent` on Vertex AI with a JSON response schema.
pub struct VertexClassifier {
    client: Client,
    endpoint: String,
    model: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}

/// Catalogue entries the model must return; an empty list means the image
/// shows nothing relevant.
pub fn product_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "products": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "product_name": {"type": "STRING"},
                        "sku": {"type": "STRING", "nullable": true},
                        "model": {"type": "STRING", "nullable": true},
                        "price": {"type": "NUMBER", "nullable": true},
                        "currency": {"type": "STRING", "nullable": true},
                        "brand": {"type": "STRING", "nullable": true},
                        "category": {"type": "STRING"},
                        "product_description": {"type": "STRING"},
                        "specifications": {"type": "STRING", "nullable": true},
                        "product_image": {"type": "STRING", "nullable": true}
                    },
                    "required": ["product_name", "category", "product_description"]
                }
            }
        },
        "required": ["products"]
    })
}

/// Public storage URLs are handed to the model as `gs://` URIs.
pub fn to_model_uri(url: &str) -> String {
    match PUBLIC_STORAGE_URL.captures(url) {
        Some(caps) => format!("gs://{}/{}", &caps[1], &caps[2]),
        None => url.to_string(),
    }
}

impl VertexClassifier {
    pub fn new(project_id: &str, location: &str, model: &str, token: impl Into<String>) -> Self {
        let endpoint = format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model}:generateContent",
            loc = location,
            project = project_id,
            model = model
        );
        Self { client: Client::new(), endpoint, model: model.to_string(), token: token.into() }
    }

    fn request_body(&self, request: &ClassificationRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": request.prompt},
                    {"fileData": {"mimeType": IMAGE_CONTENT_TYPE, "fileUri": to_model_uri(&request.image_uri)}}
                ]
            }],
            "generationConfig": {
                "temperature": 0.0,
                "responseMimeType": "application/json",
                "responseSchema": product_schema()
            }
        })
    }
}

fn parse_response(body: GenerateResponse, default_model: &str) -> Result<ClassificationResponse> {
    let text: String = body
        .candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        return Err(MigrationError::Classifier("model returned no text".into()));
    }
    let parsed: Value = serde_json::from_str(&text)
        .map_err(|e| MigrationError::Classifier(format!("response is not JSON: {}", e)))?;
    let products = parsed.get("products").and_then(Value::as_array).cloned().unwrap_or_default();
    let usage = body.usage_metadata.unwrap_or(UsageMetadata { prompt_token_count: 0, candidates_token_count: 0 });
    Ok(ClassificationResponse {
        products,
        token_input: usage.prompt_token_count,
        token_output: usage.candidates_token_count,
        model: body.model_version.unwrap_or_else(|| default_model.to_string()),
    })
}

#[async_trait]
impl ClassifierPort for VertexClassifier {
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&self.request_body(&request))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    Err(MigrationError::Auth(format!("Vertex {}: {}", status, body)))
                }
                _ => Err(MigrationError::Classifier(format!("Vertex {}: {}", status, body))),
            };
        }
        let body: GenerateResponse = resp.json().await?;
        debug!("Classified {}", request.image_uri);
        parse_response(body, &self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_public_storage_urls() {
        assert_eq!(to_model_uri("https://storage.googleapis.com/imgs/1_post_1.jpg"), "gs://imgs/1_post_1.jpg");
        assert_eq!(to_model_uri("https://cdn.example.com/a.jpg"), "https://cdn.example.com/a.jpg");
    }

    #[test]
    fn parses_products_and_usage() {
        let body: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "{\"products\": [{\"product_name\": \"Perfil de aluminio\"}]}"}]}}],
            "usageMetadata": {"promptTokenCount": 812, "candidatesTokenCount": 95},
            "modelVersion": "gemini-2.0-flash-001"
        }))
        .unwrap();
        let parsed = parse_response(body, "fallback").unwrap();
        assert_eq!(parsed.products.len(), 1);
        assert_eq!(parsed.token_input, 812);
        assert_eq!(parsed.token_output, 95);
        assert_eq!(parsed.model, "gemini-2.0-flash-001");
    }

    #[test]
    fn non_json_text_is_a_classifier_error() {
        let body: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "sorry"}]}}]
        }))
        .unwrap();
        assert!(matches!(parse_response(body, "m"), Err(MigrationError::Classifier(_))));
    }
}
