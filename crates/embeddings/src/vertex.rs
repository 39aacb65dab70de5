//! Vertex AI multimodal embedding client
//!
//! `POST {endpoint}/v1/projects/{project}/locations/{region}/publishers/google/models/{model}:predict`
//! with one instance holding the base64 image and the optional text.

use crate::{check_dimension, EmbeddingError, EmbeddingModel, EmbeddingResult, MultimodalEmbedding};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use svt_common::EMBEDDING_DIM;
use tracing::debug;

/// Vertex AI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexConfig {
    pub project_id: String,
    pub region: String,
    pub model: String,
    /// OAuth2 bearer token
    pub access_token: String,
    /// File holding the current bearer token, re-read on every call so an
    /// external refresher can rotate it; wins over `access_token`
    pub access_token_file: Option<PathBuf>,
    /// Overrides `https://{region}-aiplatform.googleapis.com`
    pub endpoint: Option<String>,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            project_id: std::env::var("GOOGLE_PROJECT_ID").unwrap_or_default(),
            region: std::env::var("REGION").unwrap_or_else(|_| "us-central1".to_string()),
            model: std::env::var("MODEL")
                .unwrap_or_else(|_| "multimodalembedding@001".to_string()),
            access_token: std::env::var("VERTEX_ACCESS_TOKEN").unwrap_or_default(),
            access_token_file: std::env::var("VERTEX_ACCESS_TOKEN_FILE").ok().map(PathBuf::from),
            endpoint: std::env::var("VERTEX_ENDPOINT").ok(),
        }
    }
}

impl VertexConfig {
    /// Prediction URL for the configured model
    #[must_use]
    pub fn predict_url(&self) -> String {
        let base = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", self.region));
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            base.trim_end_matches('/'),
            self.project_id,
            self.region,
            self.model
        )
    }

    /// Bearer token for the next call
    ///
    /// # Errors
    ///
    /// Returns an error if the token file cannot be read or is empty.
    pub fn bearer_token(&self) -> EmbeddingResult<String> {
        let Some(path) = &self.access_token_file else {
            return Ok(self.access_token.clone());
        };
        let token = std::fs::read_to_string(path).map_err(|e| {
            EmbeddingError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(EmbeddingError::InvalidConfig(format!(
                "{} is empty",
                path.display()
            )));
        }
        Ok(token.to_string())
    }
}

/// Map a non-success status to an error; credential rejections are distinct
fn status_error(status: u16, body: String) -> EmbeddingError {
    match status {
        401 | 403 => EmbeddingError::Unauthorized { status, body },
        _ => EmbeddingError::Api { status, body },
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: [Instance<'a>; 1],
    parameters: Parameters,
}

#[derive(Serialize)]
struct Instance<'a> {
    image: ImagePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagePayload {
    bytes_base64_encoded: String,
}

#[derive(Serialize)]
struct Parameters {
    dimension: usize,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    image_embedding: Option<Vec<f32>>,
    text_embedding: Option<Vec<f32>>,
}

fn request_body<'a>(image_jpeg: &[u8], text: Option<&'a str>) -> PredictRequest<'a> {
    PredictRequest {
        instances: [Instance {
            image: ImagePayload {
                bytes_base64_encoded: STANDARD.encode(image_jpeg),
            },
            text: text.filter(|t| !t.trim().is_empty()),
        }],
        parameters: Parameters {
            dimension: EMBEDDING_DIM,
        },
    }
}

fn parse_response(body: &str, expect_text: bool) -> EmbeddingResult<MultimodalEmbedding> {
    let response: PredictResponse = serde_json::from_str(body)
        .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
    let prediction = response
        .predictions
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingError::InvalidResponse("no predictions".to_string()))?;

    let image = prediction
        .image_embedding
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing imageEmbedding".to_string()))?;
    check_dimension("image", &image)?;

    let text = if expect_text {
        let text = prediction
            .text_embedding
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing textEmbedding".to_string()))?;
        check_dimension("text", &text)?;
        Some(text)
    } else {
        None
    };

    Ok(MultimodalEmbedding {
        image,
        text,
        placeholder: false,
    })
}

/// Blocking Vertex AI client
pub struct VertexEmbeddingModel {
    config: VertexConfig,
    client: reqwest::blocking::Client,
}

impl VertexEmbeddingModel {
    /// Create a client
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the project id is missing or the HTTP client cannot
    /// be built.
    pub fn new(config: VertexConfig) -> EmbeddingResult<Self> {
        if config.project_id.is_empty() {
            return Err(EmbeddingError::InvalidConfig(
                "GOOGLE_PROJECT_ID is not set".to_string(),
            ));
        }
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self { config, client })
    }
}

impl EmbeddingModel for VertexEmbeddingModel {
    fn embed(&self, image_jpeg: &[u8], text: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
        let body = request_body(image_jpeg, text);
        let expect_text = body.instances[0].text.is_some();
        let token = self.config.bearer_token()?;

        let response = self
            .client
            .post(self.config.predict_url())
            .bearer_auth(token)
            .json(&body)
            .send()?;

        let status = response.status();
        let payload = response.text()?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), payload));
        }

        debug!(
            "Embedded {} byte frame (text: {})",
            image_jpeg.len(),
            expect_text
        );
        parse_response(&payload, expect_text)
    }
}
