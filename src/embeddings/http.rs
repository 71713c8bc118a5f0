//! HTTP embedding client with bounded retry and sequential batch pacing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::EmbeddingProvider;
use crate::types::TreedexError;

const DEFAULT_ENDPOINT: &str = "http://localhost:11434/api/embeddings";
const DEFAULT_MODEL: &str = "nomic-embed-text";

/// Configuration for [`HttpEmbeddingClient`].
#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub endpoint: Url,
    pub model: String,
    /// Per-request timeout; the client never blocks past this.
    pub request_timeout: Duration,
    /// Attempts per text, including the first.
    pub max_attempts: u32,
    /// Linear backoff unit; attempt `n` waits `n * backoff_unit` before retrying.
    pub backoff_unit: Duration,
    /// Pause between consecutive texts of a batch, skipped after the last.
    pub batch_delay: Duration,
}

impl EmbeddingConfig {
    pub fn new(endpoint: Url, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            request_timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_unit: Duration::from_secs(2),
            batch_delay: Duration::from_millis(200),
        }
    }

    /// Resolves endpoint and model from the environment
    /// (`TREEDEX_EMBED_ENDPOINT`, `TREEDEX_EMBED_MODEL`), with local defaults.
    pub fn from_env() -> Result<Self, TreedexError> {
        dotenvy::dotenv().ok();
        let endpoint = std::env::var("TREEDEX_EMBED_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let endpoint = Url::parse(&endpoint).map_err(|err| {
            TreedexError::Embedding(format!("invalid embedding endpoint '{endpoint}': {err}"))
        })?;
        let model =
            std::env::var("TREEDEX_EMBED_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(endpoint, model))
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    #[must_use]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

/// Client for a remote `{model, text}` embedding endpoint.
///
/// Batch calls run strictly sequentially with a fixed inter-call delay; at
/// most one request is in flight at a time. That is deliberate backpressure
/// against the remote service's connection pool, not an optimization target.
pub struct HttpEmbeddingClient {
    config: EmbeddingConfig,
    client: Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

struct RequestFailure {
    retryable: bool,
    message: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self, TreedexError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| TreedexError::Embedding(err.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    async fn request_once(&self, text: &str) -> Result<Vec<f32>, RequestFailure> {
        let response = self
            .client
            .post(self.config.endpoint.clone())
            .json(&EmbedRequest {
                model: &self.config.model,
                text,
            })
            .send()
            .await
            .map_err(|err| RequestFailure {
                // Connection-level failures and timeouts are worth retrying.
                retryable: true,
                message: err.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RequestFailure {
                retryable: true,
                message: format!("embedding endpoint returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(RequestFailure {
                retryable: false,
                message: format!("embedding endpoint returned {status}"),
            });
        }

        let body: EmbedResponse = response.json().await.map_err(|err| RequestFailure {
            retryable: false,
            message: format!("malformed embedding response: {err}"),
        })?;
        Ok(body.embedding)
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, TreedexError> {
        for attempt in 1..=self.config.max_attempts {
            match self.request_once(text).await {
                Ok(vector) => return Ok(vector),
                Err(failure) if failure.retryable && attempt < self.config.max_attempts => {
                    let wait = self.config.backoff_unit * attempt;
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %failure.message,
                        "embedding request failed; backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(failure) => return Err(TreedexError::Embedding(failure.message)),
            }
        }
        // max_attempts is clamped to >= 1, so the loop always returns first.
        Err(TreedexError::Embedding("no attempts were made".to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TreedexError> {
        self.embed_with_retry(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TreedexError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            vectors.push(self.embed_with_retry(text).await?);
            debug!(done = index + 1, total = texts.len(), "embedded batch item");
            if index + 1 < texts.len() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }
        Ok(vectors)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_config(server: &MockServer) -> EmbeddingConfig {
        let endpoint = Url::parse(&server.url("/api/embeddings")).unwrap();
        EmbeddingConfig::new(endpoint, "test-model")
            .with_backoff_unit(Duration::from_millis(1))
            .with_batch_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn embeds_single_text() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embeddings")
                    .json_body(json!({"model": "test-model", "text": "hello"}));
                then.status(200).json_body(json!({"embedding": [0.1, 0.2, 0.3]}));
            })
            .await;

        let client = HttpEmbeddingClient::new(test_config(&server)).unwrap();
        let vector = client.embed("hello").await.unwrap();

        mock.assert_async().await;
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhaustion() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(503);
            })
            .await;

        let client = HttpEmbeddingClient::new(test_config(&server)).unwrap();
        let err = client.embed("flaky").await.unwrap_err();

        assert!(matches!(err, TreedexError::Embedding(_)));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(400);
            })
            .await;

        let client = HttpEmbeddingClient::new(test_config(&server)).unwrap();
        let err = client.embed("bad request").await.unwrap_err();

        assert!(matches!(err, TreedexError::Embedding(_)));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embeddings")
                    .json_body_partial(r#"{"text": "first"}"#);
                then.status(200).json_body(json!({"embedding": [1.0]}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embeddings")
                    .json_body_partial(r#"{"text": "second"}"#);
                then.status(200).json_body(json!({"embedding": [2.0]}));
            })
            .await;

        let client = HttpEmbeddingClient::new(test_config(&server)).unwrap();
        let vectors = client
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }
}
