use thiserror::Error;

#[derive(Error, Debug)]
pub enum AparteError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding vector is empty")]
    Empty,

    #[error("Invalid embedding blob length: {0}")]
    InvalidBlob(usize),

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}
