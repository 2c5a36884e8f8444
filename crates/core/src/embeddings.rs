use crate::error::{EmbeddingErrorKind, IngestError};
use crate::traits::EmbeddingService;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Dimension of `text-embedding-3-small`, the reference embedding model.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1_536;
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Deterministic offline embedder: hashed character trigrams, L2-normalized.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingService for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingConfig {
    /// Base URL: `https://api.openai.com/v1` or an Azure OpenAI resource endpoint.
    pub endpoint: String,
    pub api_key: String,
    /// Model name, or the deployment name when `api_version` is set.
    pub model: String,
    /// Selects the Azure OpenAI URL layout and `api-key` header.
    pub api_version: Option<String>,
    pub dimensions: usize,
    pub timeout: Duration,
}

/// Client for OpenAI-compatible `/embeddings` endpoints, including Azure deployments.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingService {
    client: Client,
    url: Url,
    api_key: String,
    model: String,
    azure: bool,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbeddingService {
    pub fn new(config: OpenAiEmbeddingConfig) -> Result<Self, IngestError> {
        if config.api_key.trim().is_empty() {
            return Err(IngestError::Configuration(
                "missing embeddings API key".to_string(),
            ));
        }
        if config.model.trim().is_empty() {
            return Err(IngestError::Configuration(
                "missing embeddings model name".to_string(),
            ));
        }

        let base = config.endpoint.trim_end_matches('/');
        let url = match &config.api_version {
            Some(version) => {
                let mut url = Url::parse(&format!(
                    "{base}/openai/deployments/{}/embeddings",
                    config.model
                ))?;
                url.query_pairs_mut().append_pair("api-version", version);
                url
            }
            None => Url::parse(&format!("{base}/embeddings"))?,
        };

        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url,
            api_key: config.api_key.trim().to_string(),
            model: config.model,
            azure: config.api_version.is_some(),
            dimensions: config.dimensions,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn classify_status(status: StatusCode) -> EmbeddingErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        EmbeddingErrorKind::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        EmbeddingErrorKind::Transient
    } else {
        EmbeddingErrorKind::Permanent
    }
}

fn classify_transport(error: &reqwest::Error) -> EmbeddingErrorKind {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        EmbeddingErrorKind::Transient
    } else {
        EmbeddingErrorKind::Permanent
    }
}

fn into_ordered_vectors(
    mut response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, IngestError> {
    response.data.sort_by_key(|entry| entry.index);
    let in_order = response
        .data
        .iter()
        .enumerate()
        .all(|(position, entry)| entry.index == position);

    if response.data.len() != expected || !in_order {
        return Err(IngestError::embedding(
            EmbeddingErrorKind::Permanent,
            format!(
                "service returned {} embeddings for {} inputs",
                response.data.len(),
                expected
            ),
        ));
    }

    Ok(response
        .data
        .into_iter()
        .map(|entry| entry.embedding)
        .collect())
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            input: texts,
            model: (!self.azure).then_some(self.model.as_str()),
        };
        let request = self.client.post(self.url.clone()).json(&body);
        let request = if self.azure {
            request.header("api-key", &self.api_key)
        } else {
            request.bearer_auth(&self.api_key)
        };

        let response = request
            .send()
            .await
            .map_err(|error| IngestError::embedding(classify_transport(&error), error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(IngestError::embedding(
                classify_status(status),
                format!("embeddings request failed ({status}): {body}"),
            ));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|error| {
            IngestError::embedding(
                EmbeddingErrorKind::Transient,
                format!("invalid embeddings response: {error}"),
            )
        })?;
        into_ordered_vectors(parsed, texts.len())
    }
}
