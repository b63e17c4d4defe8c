//! The content generator contract and its decorators.
//!
//! [`ContentGenerator`] is what the conversation loop talks to. The HTTP
//! adapter implements it, and so does every wrapper here, so logging,
//! recording, replay and the retry router compose freely:
//!
//! ```text
//! FallbackRouter<LoggingContentGenerator<ChatCompletionsClient>>
//! ```

use crate::context::estimate_tokens;
use crate::streaming::ResponseStream;
use crate::types::{
    CountTokensRequest, CountTokensResponse, EmbedContentRequest, EmbedContentResponse,
    GenerateContentRequest, GenerateContentResponse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// Backend-neutral content generation.
///
/// Implementations do not retry; that is the router's job.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Single round trip.
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<GenerateContentResponse>;

    /// Lazy, finite sequence of cumulative responses. Dropping the stream cancels it.
    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<ResponseStream>;

    /// Deterministic token estimate.
    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse> {
        Ok(CountTokensResponse {
            total_tokens: estimate_tokens(&request.contents),
        })
    }

    async fn embed_content(&self, _request: EmbedContentRequest) -> Result<EmbedContentResponse> {
        Err(Error::unsupported("embedContent"))
    }
}

#[async_trait]
impl<G: ContentGenerator + ?Sized> ContentGenerator for Arc<G> {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<GenerateContentResponse> {
        (**self).generate_content(request, user_prompt_id).await
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<ResponseStream> {
        (**self).generate_content_stream(request, user_prompt_id).await
    }

    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse> {
        (**self).count_tokens(request).await
    }

    async fn embed_content(&self, request: EmbedContentRequest) -> Result<EmbedContentResponse> {
        (**self).embed_content(request).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// LOGGING
// ============================================================================

/// Logs every call with its latency through the `log` facade.
pub struct LoggingContentGenerator<G> {
    inner: G,
}

impl<G: ContentGenerator> LoggingContentGenerator<G> {
    pub fn new(inner: G) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: ContentGenerator> ContentGenerator for LoggingContentGenerator<G> {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<GenerateContentResponse> {
        let model = request.model.clone();
        log::debug!(
            "generate_content request: model={} prompt_id={} contents={}",
            model,
            user_prompt_id,
            request.contents.len()
        );
        let started = Instant::now();
        let result = self.inner.generate_content(request, user_prompt_id).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(response) => log::info!(
                "generate_content ok: model={} candidates={} latency_ms={} usage={:?}",
                model,
                response.candidates.len(),
                elapsed.as_millis(),
                response.usage_metadata
            ),
            Err(e) => log::warn!(
                "generate_content failed: model={} latency_ms={} error={}",
                model,
                elapsed.as_millis(),
                e
            ),
        }
        result
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<ResponseStream> {
        let model = request.model.clone();
        log::debug!(
            "generate_content_stream request: model={} prompt_id={}",
            model,
            user_prompt_id
        );
        let started = Instant::now();
        let inner = match self.inner.generate_content_stream(request, user_prompt_id).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("generate_content_stream failed to start: model={} error={}", model, e);
                return Err(e);
            }
        };

        let logged = inner.inspect(move |item| match item {
            Ok(response) => log::trace!(
                "stream emission: model={} finish={:?} elapsed_ms={}",
                model,
                response.finish_reason(),
                started.elapsed().as_millis()
            ),
            Err(e) => log::warn!("stream error: model={} error={}", model, e),
        });
        Ok(Box::pin(logged))
    }

    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse> {
        let result = self.inner.count_tokens(request).await;
        if let Ok(count) = &result {
            log::debug!("count_tokens: {}", count.total_tokens);
        }
        result
    }

    async fn embed_content(&self, request: EmbedContentRequest) -> Result<EmbedContentResponse> {
        self.inner.embed_content(request).await
    }
}

// ============================================================================
// RECORD / REPLAY
// ============================================================================

/// One recorded call, stored as a JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RecordedResponse {
    GenerateContent {
        response: GenerateContentResponse,
    },
    GenerateContentStream {
        responses: Vec<GenerateContentResponse>,
    },
    CountTokens {
        response: CountTokensResponse,
    },
}

impl RecordedResponse {
    fn method(&self) -> &'static str {
        match self {
            RecordedResponse::GenerateContent { .. } => "generateContent",
            RecordedResponse::GenerateContentStream { .. } => "generateContentStream",
            RecordedResponse::CountTokens { .. } => "countTokens",
        }
    }
}

#[derive(Clone)]
struct Recorder {
    path: PathBuf,
    /// Keeps concurrent appends whole
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Recorder {
    async fn append(&self, record: &RecordedResponse) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::other(format!("cannot open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::other(format!("cannot write {}: {}", self.path.display(), e)))
    }

    async fn append_logged(&self, record: &RecordedResponse) {
        if let Err(e) = self.append(record).await {
            log::warn!("failed to record {} response: {}", record.method(), e);
        }
    }
}

/// Appends every successful response to a JSON-lines file.
///
/// Streams are recorded as one line once they finish.
pub struct RecordingContentGenerator<G> {
    inner: G,
    recorder: Recorder,
}

impl<G: ContentGenerator> RecordingContentGenerator<G> {
    pub fn new(inner: G, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            recorder: Recorder {
                path: path.into(),
                lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        }
    }
}

#[async_trait]
impl<G: ContentGenerator> ContentGenerator for RecordingContentGenerator<G> {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<GenerateContentResponse> {
        let response = self.inner.generate_content(request, user_prompt_id).await?;
        self.recorder
            .append_logged(&RecordedResponse::GenerateContent {
                response: response.clone(),
            })
            .await;
        Ok(response)
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<ResponseStream> {
        let inner = self
            .inner
            .generate_content_stream(request, user_prompt_id)
            .await?;
        let recorder = self.recorder.clone();

        let recorded = stream::unfold(
            (inner, Vec::new(), Some(recorder)),
            |(mut inner, mut seen, recorder)| async move {
                let recorder = recorder?;
                match inner.next().await {
                    Some(Ok(response)) => {
                        seen.push(response.clone());
                        Some((Ok(response), (inner, seen, Some(recorder))))
                    }
                    // Failed streams are not recorded
                    Some(Err(e)) => Some((Err(e), (inner, seen, None))),
                    None => {
                        recorder
                            .append_logged(&RecordedResponse::GenerateContentStream {
                                responses: seen,
                            })
                            .await;
                        None
                    }
                }
            },
        );
        Ok(Box::pin(recorded))
    }

    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse> {
        let response = self.inner.count_tokens(request).await?;
        self.recorder
            .append_logged(&RecordedResponse::CountTokens { response })
            .await;
        Ok(response)
    }

    async fn embed_content(&self, request: EmbedContentRequest) -> Result<EmbedContentResponse> {
        self.inner.embed_content(request).await
    }
}

/// Replays recorded responses in order.
pub struct FakeContentGenerator {
    responses: Mutex<VecDeque<RecordedResponse>>,
}

impl FakeContentGenerator {
    pub fn new(responses: Vec<RecordedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Loads a file written by [`RecordingContentGenerator`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let responses = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<Vec<RecordedResponse>, _>>()?;
        Ok(Self::new(responses))
    }

    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }

    fn next(&self, method: &str) -> Result<RecordedResponse> {
        let mut responses = lock(&self.responses);
        match responses.front() {
            None => Err(Error::other(format!(
                "no recorded response left for {}",
                method
            ))),
            Some(next) if next.method() != method => Err(Error::other(format!(
                "expected a recorded {} response, found {}",
                method,
                next.method()
            ))),
            Some(_) => responses
                .pop_front()
                .ok_or_else(|| Error::other("recorded responses changed concurrently")),
        }
    }
}

#[async_trait]
impl ContentGenerator for FakeContentGenerator {
    async fn generate_content(
        &self,
        _request: GenerateContentRequest,
        _user_prompt_id: &str,
    ) -> Result<GenerateContentResponse> {
        match self.next("generateContent")? {
            RecordedResponse::GenerateContent { response } => Ok(response),
            other => Err(Error::other(format!("unexpected {}", other.method()))),
        }
    }

    async fn generate_content_stream(
        &self,
        _request: GenerateContentRequest,
        _user_prompt_id: &str,
    ) -> Result<ResponseStream> {
        match self.next("generateContentStream")? {
            RecordedResponse::GenerateContentStream { responses } => {
                Ok(Box::pin(stream::iter(responses.into_iter().map(Ok))))
            }
            other => Err(Error::other(format!("unexpected {}", other.method()))),
        }
    }

    async fn count_tokens(&self, request: CountTokensRequest) -> Result<CountTokensResponse> {
        let recorded = {
            let mut responses = lock(&self.responses);
            match responses.front() {
                Some(RecordedResponse::CountTokens { .. }) => responses.pop_front(),
                _ => None,
            }
        };
        match recorded {
            Some(RecordedResponse::CountTokens { response }) => Ok(response),
            _ => Ok(CountTokensResponse {
                total_tokens: estimate_tokens(&request.contents),
            }),
        }
    }
}
