//! Multimodal embeddings
//!
//! The embedding model is an external service: it takes an image and,
//! optionally, a piece of text, and returns one 1408-dimension vector for each.
//! [`VertexEmbeddingModel`] calls the Vertex AI `multimodalembedding` endpoint.
//!
//! Model failures do not abort a video: [`embed_or_placeholder`] substitutes a
//! placeholder vector, flagged on the result and logged. Rejected credentials
//! are the exception; they fail the call so the video is retried once the
//! token is replaced.

pub mod vertex;

pub use vertex::{VertexConfig, VertexEmbeddingModel};

use serde::{Deserialize, Serialize};
use svt_common::EMBEDDING_DIM;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model returned {status}: {body}")]
    Api { status: u16, body: String },

    /// 401/403 from the model service
    #[error("Model rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EmbeddingError {
    /// Errors that would hit every frame alike, so a placeholder must not hide them
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::InvalidConfig(_))
    }
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Vectors returned for one model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultimodalEmbedding {
    pub image: Vec<f32>,
    /// Present when text was supplied with the call
    pub text: Option<Vec<f32>>,
    /// Set when `image` is the placeholder rather than a model output
    #[serde(default)]
    pub placeholder: bool,
}

impl MultimodalEmbedding {
    /// Image vector followed by the text vector, if any
    #[must_use]
    pub fn into_vectors(self) -> Vec<Vec<f32>> {
        let mut vectors = vec![self.image];
        vectors.extend(self.text);
        vectors
    }
}

/// Image/text embedding model
///
/// Blocking; callers run it off the async executor.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, image_jpeg: &[u8], text: Option<&str>) -> EmbeddingResult<MultimodalEmbedding>;
}

/// Stand-in vector used when the model call fails: `0.0, 1.0, ..., 1407.0`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn placeholder_vector() -> Vec<f32> {
    (0..EMBEDDING_DIM).map(|i| i as f32).collect()
}

/// Call the model, falling back to the placeholder vector on failure
///
/// # Errors
///
/// Returns the model error when it [is fatal](EmbeddingError::is_fatal).
pub fn embed_or_placeholder(
    model: &dyn EmbeddingModel,
    image_jpeg: &[u8],
    text: Option<&str>,
) -> EmbeddingResult<MultimodalEmbedding> {
    match model.embed(image_jpeg, text) {
        Ok(embedding) => Ok(embedding),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("Embedding model failed, using placeholder vector: {}", e);
            Ok(MultimodalEmbedding {
                image: placeholder_vector(),
                text: None,
                placeholder: true,
            })
        }
    }
}

/// Check a vector returned by the model
///
/// # Errors
///
/// Returns an error if the vector does not have [`EMBEDDING_DIM`] elements.
pub fn check_dimension(what: &str, vector: &[f32]) -> EmbeddingResult<()> {
    if vector.len() == EMBEDDING_DIM {
        Ok(())
    } else {
        Err(EmbeddingError::InvalidResponse(format!(
            "{what} embedding has {} dimensions, expected {EMBEDDING_DIM}",
            vector.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl EmbeddingModel for Failing {
        fn embed(&self, _: &[u8], _: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
            Err(EmbeddingError::Api {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }

    struct Expired;

    impl EmbeddingModel for Expired {
        fn embed(&self, _: &[u8], _: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
            Err(EmbeddingError::Unauthorized {
                status: 401,
                body: "token expired".to_string(),
            })
        }
    }

    struct Constant;

    impl EmbeddingModel for Constant {
        fn embed(&self, _: &[u8], text: Option<&str>) -> EmbeddingResult<MultimodalEmbedding> {
            Ok(MultimodalEmbedding {
                image: vec![0.5; EMBEDDING_DIM],
                text: text.map(|_| vec![0.25; EMBEDDING_DIM]),
                placeholder: false,
            })
        }
    }

    #[test]
    fn test_placeholder_vector() {
        let v = placeholder_vector();
        assert_eq!(v.len(), EMBEDDING_DIM);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[EMBEDDING_DIM - 1], 1407.0);
    }

    #[test]
    fn test_failure_degrades_to_placeholder() {
        let embedding = embed_or_placeholder(&Failing, b"jpeg", Some("caption")).unwrap();
        assert!(embedding.placeholder);
        assert_eq!(embedding.image, placeholder_vector());
        assert!(embedding.text.is_none());
    }

    #[test]
    fn test_rejected_credentials_are_not_masked() {
        let result = embed_or_placeholder(&Expired, b"jpeg", Some("caption"));
        assert!(matches!(
            result,
            Err(EmbeddingError::Unauthorized { status: 401, .. })
        ));
    }

    #[test]
    fn test_into_vectors_appends_text() {
        let with_text = embed_or_placeholder(&Constant, b"jpeg", Some("caption")).unwrap();
        assert_eq!(with_text.into_vectors().len(), 2);

        let image_only = embed_or_placeholder(&Constant, b"jpeg", None).unwrap();
        let vectors = image_only.into_vectors();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0][0], 0.5);
    }

    #[test]
    fn test_check_dimension() {
        assert!(check_dimension("image", &vec![0.0; EMBEDDING_DIM]).is_ok());
        assert!(matches!(
            check_dimension("text", &[0.0; 3]),
            Err(EmbeddingError::InvalidResponse(_))
        ));
    }
}
