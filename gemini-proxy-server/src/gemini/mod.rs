//! The Gemini backend: a capability trait and its `reqwest` implementation.

mod sse;
pub mod types;

use crate::config::Config;
use crate::error::ProxyError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, error, info};
use types::{
    ApiErrorEnvelope, BackendRequest, GenerateContentResponse, ListModelsResponse, ModelInfo,
};

/// Lazy, single-pass sequence of partial generations in backend arrival order.
pub type ChunkStream = BoxStream<'static, Result<GenerateContentResponse, ProxyError>>;

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError>;

    async fn generate(
        &self,
        request: &BackendRequest,
    ) -> Result<GenerateContentResponse, ProxyError>;

    /// Opens a streaming generation. Errors returned here happen before any
    /// chunk was produced; later failures arrive inside the stream.
    async fn stream_generate(&self, request: &BackendRequest) -> Result<ChunkStream, ProxyError>;
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        info!("Initializing Gemini client for {}", config.base_url);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    async fn post(&self, url: &str, request: &BackendRequest) -> Result<Response, ProxyError> {
        debug!(model = %request.model, "POST {}", url);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to reach Gemini API");
                ProxyError::from(e)
            })?;
        check_status(response).await
    }
}

/// Turns a non-2xx response into `BackendRejected`, keeping the backend's message.
async fn check_status(response: Response) -> Result<Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorEnvelope>(&body) {
        Ok(envelope) if !envelope.error.message.is_empty() => envelope.error.message,
        _ if body.trim().is_empty() => format!("Gemini API returned {status}"),
        _ => body,
    };
    error!(status = %status, error = %message, "Gemini API returned error status");

    Err(ProxyError::BackendRejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError> {
        let url = format!("{}/models", self.base_url);
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", "1000".to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .client
                .get(&url)
                .header("x-goog-api-key", &self.api_key)
                .query(&query)
                .send()
                .await?;
            let page: ListModelsResponse = check_status(response).await?.json().await?;

            models.extend(page.models);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Gemini listed {} models", models.len());
        Ok(models)
    }

    async fn generate(
        &self,
        request: &BackendRequest,
    ) -> Result<GenerateContentResponse, ProxyError> {
        let url = self.model_url(&request.model, "generateContent");
        let response = self.post(&url, request).await?;
        let body = response.json::<GenerateContentResponse>().await?;

        if let Some(reason) = body.block_reason() {
            return Err(ProxyError::BackendRejected {
                status: 400,
                message: format!("Prompt blocked by Gemini: {reason}"),
            });
        }
        Ok(body)
    }

    async fn stream_generate(&self, request: &BackendRequest) -> Result<ChunkStream, ProxyError> {
        let url = self.model_url(&request.model, "streamGenerateContent?alt=sse");
        let response = self.post(&url, request).await?;
        let bytes = Box::pin(response.bytes_stream());
        Ok(sse::decode_events(bytes).boxed())
    }
}
