use thiserror::Error;

/// Errors surfaced by the extraction, indexing, retrieval and generation steps
#[derive(Error, Debug)]
pub enum RagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse document: {0}")]
    Parse(String),

    #[error("Authentication with the model provider failed: {0}")]
    Auth(String),

    #[error("Model provider rate limit or quota exceeded: {0}")]
    RateLimit(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Model provider request failed: {0}")]
    Provider(String),

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        RagError::Provider(err.to_string())
    }
}

impl From<qdrant_client::QdrantError> for RagError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        RagError::Store(err.to_string())
    }
}
