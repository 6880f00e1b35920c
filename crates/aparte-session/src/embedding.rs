//! Embedding service client.
//!
//! The matcher needs a fixed-length vector for every topic string; the
//! conversion itself is an opaque external call. The [`Embedder`] trait is
//! the seam — tests substitute deterministic vectors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use aparte_shared::constants::EMBEDDING_DIM;
use aparte_shared::embedding::Embedding;
use aparte_shared::error::EmbeddingError;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding service error: {0}")]
    Service(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Text to fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// HTTP embedding client (`POST {"text": ...} -> {"embedding": [...]}`).
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
}

impl HttpEmbedder {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbedRequest { text })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmbedError::Service(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let body: EmbedResponse = response.json().await?;
        if body.embedding.len() != EMBEDDING_DIM {
            return Err(EmbedError::Embedding(EmbeddingError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: body.embedding.len(),
            }));
        }

        debug!(len = text.len(), "topic embedded");
        Ok(Embedding::new(body.embedding)?)
    }
}
