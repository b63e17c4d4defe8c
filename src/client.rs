//! HTTP/SSE wire adapter for OpenAI-compatible `chat/completions` backends.
//!
//! [`ChatCompletionsClient`] implements [`ContentGenerator`] by marshalling a
//! [`GenerateContentRequest`] with [`wire::build_request_body`], posting it to
//! `{base_url}/chat/completions` and mapping the reply back into the message
//! model. Streaming replies are fed through the SSE decoder and aggregator in
//! [`crate::streaming`].
//!
//! The client never retries; wrap it in a
//! [`FallbackRouter`](crate::FallbackRouter) for that.
//!
//! ```rust,no_run
//! use turnwise::{ChatCompletionsClient, ClientConfig, Content, ContentGenerator, GenerateContentRequest};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ChatCompletionsClient::new(ClientConfig::from_env()?)?;
//! let request = GenerateContentRequest::new("glm-4.6", vec![Content::user("Hello")]);
//!
//! let mut stream = client.generate_content_stream(request, "prompt-1").await?;
//! while let Some(response) = stream.next().await {
//!     println!("{}", response?.text());
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::generator::ContentGenerator;
use crate::streaming::{ResponseStream, response_stream};
use crate::types::{GenerateContentRequest, GenerateContentResponse};
use crate::wire::{self, ChatCompletionResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;

const EVENT_STREAM: &str = "text/event-stream";

/// Wire adapter over a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    http_client: reqwest::Client,
    config: ClientConfig,
}

impl ChatCompletionsClient {
    /// Creates a client; the HTTP connection pool is reused across requests.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends the request and returns the response once headers arrive.
    ///
    /// Non-2xx statuses become [`Error::Upstream`].
    async fn post(
        &self,
        request: &GenerateContentRequest,
        user_prompt_id: &str,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = wire::build_request_body(request, user_prompt_id, stream);
        let url = self.config.endpoint_url();
        log::debug!(
            "POST {} model={} stream={} messages={}",
            url,
            body.model,
            stream,
            body.messages.len()
        );

        let mut builder = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(org) = &self.config.organization {
            builder = builder.header("X-Organization", org);
        }

        let response = with_abort(request.abort_signal(), async {
            builder.send().await.map_err(Error::from)
        })
        .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let body = response.text().await.unwrap_or_else(|e| {
            log::warn!("Failed to read error response body: {}", e);
            String::new()
        });
        let message = wire::extract_error_message(&body)
            .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
            .unwrap_or_else(|| status_text.clone());

        log::debug!("Upstream returned {}: {}", status.as_u16(), message);
        Err(Error::upstream(status.as_u16(), status_text, message))
    }
}

/// Races `future` against the abort token, if any.
async fn with_abort<T>(
    abort: Option<&CancellationToken>,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match abort {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = future => result,
        },
        None => future.await,
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with(EVENT_STREAM))
}

async fn decode_body(
    response: reqwest::Response,
    abort: Option<&CancellationToken>,
) -> Result<ChatCompletionResponse> {
    let bytes = with_abort(abort, async { response.bytes().await.map_err(Error::from) }).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl ContentGenerator for ChatCompletionsClient {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<GenerateContentResponse> {
        let response = self.post(&request, user_prompt_id, false).await?;
        let payload = decode_body(response, request.abort_signal()).await?;
        Ok(wire::to_generate_content_response(&payload, &request.model))
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<ResponseStream> {
        let response = self.post(&request, user_prompt_id, true).await?;

        if !is_event_stream(&response) {
            log::debug!("Streaming request answered without SSE; decoding as one response");
            let payload = decode_body(response, request.abort_signal()).await?;
            let single = wire::to_generate_content_response(&payload, &request.model);
            return Ok(Box::pin(stream::once(async move { Ok(single) })));
        }

        let body = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));
        Ok(response_stream(
            body,
            request.model.clone(),
            request.abort_signal().cloned(),
        ))
    }
}
