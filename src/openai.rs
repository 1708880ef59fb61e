use crate::context::{ChatMessage, Role};
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::rag::ChatModel;
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const CHAT_MODEL: &str = "gpt-3.5-turbo-0125";
pub const EMBEDDING_MODEL: &str = "text-embedding-ada-002";

const TEMPERATURE: f32 = 0.7;
const EMBEDDING_BATCH_SIZE: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for the OpenAI API
#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OpenAiConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::Auth("OPENAI_API_KEY not set".to_string()))?;
        let base_url = env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(OpenAiConfig { api_key, base_url })
    }
}

/// Client for the OpenAI embeddings and chat completion endpoints
#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Create a new OpenAI client
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(RagError::Auth("missing OpenAI API key".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(OpenAiClient { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// One embeddings request worth of inputs
#[async_trait]
trait BatchEmbedder: Send + Sync {
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Embedding>>;
}

#[async_trait]
impl BatchEmbedder for OpenAiClient {
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Embedding>> {
        let request = EmbeddingRequest {
            model: EMBEDDING_MODEL,
            input: inputs,
        };

        let response = self
            .client
            .post(self.endpoint("embeddings"))
            .bearer_auth(self.config.api_key.trim())
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let response_data: EmbeddingResponse = response.json().await?;
        order_embeddings(response_data.data, inputs.len())
    }
}

/// Embed `texts` in requests of at most `EMBEDDING_BATCH_SIZE` inputs, preserving order
async fn embed_in_batches<B: BatchEmbedder + ?Sized>(
    backend: &B,
    texts: &[String],
) -> Result<Vec<Embedding>> {
    let mut embeddings = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBEDDING_BATCH_SIZE) {
        debug!("Embedding batch of {} inputs", batch.len());
        embeddings.extend(backend.embed_batch(batch).await?);
    }
    Ok(embeddings)
}

/// Put response entries back in input order; every input must have exactly one entry
fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Embedding>> {
    if data.len() != expected {
        return Err(RagError::Provider(format!(
            "OpenAI returned {} embeddings for {} inputs",
            data.len(),
            expected
        )));
    }

    data.sort_by_key(|entry| entry.index);
    if data.iter().enumerate().any(|(position, entry)| entry.index != position) {
        return Err(RagError::Provider(
            "OpenAI returned embeddings with missing or repeated indexes".to_string(),
        ));
    }

    Ok(data
        .into_iter()
        .map(|entry| Embedding {
            values: entry.embedding,
        })
        .collect())
}

#[async_trait]
impl Embedder for OpenAiClient {
    fn model(&self) -> &str {
        EMBEDDING_MODEL
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        embed_in_batches(self, texts).await
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: CHAT_MODEL,
            temperature: TEMPERATURE,
            messages: messages
                .iter()
                .map(|m| RequestMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(self.config.api_key.trim())
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let response_data: ChatResponse = response.json().await?;

        // Extract the generated text from the response
        response_data
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::Provider("No response generated".to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(classify_failure(status, &error_text))
}

fn classify_failure(status: StatusCode, body: &str) -> RagError {
    let message = format!("API request failed: {} {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RagError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => RagError::RateLimit(message),
        _ => RagError::Provider(message),
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'static str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'static str,
    temperature: f32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}
