//! Retry/fallback routing around a [`ContentGenerator`].
//!
//! [`FallbackRouter`] retries transient failures with backoff and, under
//! sustained quota pressure, switches the session into fallback mode where
//! non-lite models are replaced by a cheaper one. Fallback mode is sticky: it
//! stays on until [`FallbackState::reset`] is called.

use crate::config::{DEFAULT_FLASH_MODEL, effective_model_with, is_lite_model};
use crate::generator::ContentGenerator;
use crate::retry::{ErrorClass, RetryConfig, backoff, classify_error, retry_until_cancelled};
use crate::streaming::ResponseStream;
use crate::types::{
    CountTokensRequest, CountTokensResponse, EmbedContentRequest, EmbedContentResponse,
    GenerateContentRequest, GenerateContentResponse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ============================================================================
// ROUTING DECISIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    /// Name of the strategy that decided
    pub source: String,
    pub latency_ms: u64,
    pub reasoning: String,
}

/// Advisory model choice. Only the request's model field is ever rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model: String,
    pub metadata: RoutingMetadata,
}

/// A model-selection strategy; `None` defers to the next strategy in the chain.
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn route(&self, requested_model: &str, fallback_active: bool) -> Option<RoutingDecision>;
}

/// Always routes to the requested model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

impl RoutingStrategy for DefaultStrategy {
    fn name(&self) -> &str {
        "default"
    }

    fn route(&self, requested_model: &str, _fallback_active: bool) -> Option<RoutingDecision> {
        Some(RoutingDecision {
            model: requested_model.to_string(),
            metadata: RoutingMetadata {
                source: self.name().to_string(),
                latency_ms: 0,
                reasoning: format!("Routing to configured model: {}", requested_model),
            },
        })
    }
}

/// Downgrades non-lite models while fallback mode is active.
#[derive(Debug, Clone)]
pub struct FallbackStrategy {
    fallback_model: String,
}

impl FallbackStrategy {
    pub fn new(fallback_model: impl Into<String>) -> Self {
        Self {
            fallback_model: fallback_model.into(),
        }
    }
}

impl RoutingStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        "fallback"
    }

    fn route(&self, requested_model: &str, fallback_active: bool) -> Option<RoutingDecision> {
        if !fallback_active || is_lite_model(requested_model) {
            return None;
        }
        let model = effective_model_with(true, requested_model, &self.fallback_model);
        Some(RoutingDecision {
            metadata: RoutingMetadata {
                source: self.name().to_string(),
                latency_ms: 0,
                reasoning: format!(
                    "Fallback mode active: {} downgraded to {}",
                    requested_model, model
                ),
            },
            model,
        })
    }
}

// ============================================================================
// SHARED FALLBACK FLAG
// ============================================================================

/// Session-wide fallback flag, shared by every router in the session.
#[derive(Debug, Default)]
pub struct FallbackState {
    active: AtomicBool,
}

impl FallbackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Enters fallback mode. Returns true only for the caller that flipped it.
    pub fn activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leaves fallback mode. Returns true if it was active.
    pub fn reset(&self) -> bool {
        self.active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ============================================================================
// ROUTER
// ============================================================================

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub retry: RetryConfig,
    /// Consecutive retryable failures within one call that count as quota
    /// pressure. The fallback retry this triggers counts toward `retry.max_attempts`.
    pub quota_trip_threshold: u32,
    pub fallback_model: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default().with_max_attempts(5),
            quota_trip_threshold: 3,
            fallback_model: DEFAULT_FLASH_MODEL.to_string(),
        }
    }
}

impl RouterConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_quota_trip_threshold(mut self, threshold: u32) -> Self {
        self.quota_trip_threshold = threshold.max(1);
        self
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = model.into();
        self
    }
}

/// Per-call retry bookkeeping
#[derive(Debug, Default)]
struct Attempts {
    /// Failed attempts so far, the quota retry included
    made: u32,
    consecutive: u32,
    quota_retried: bool,
}

/// Retrying, model-downgrading wrapper around a [`ContentGenerator`].
pub struct FallbackRouter<G> {
    inner: G,
    config: RouterConfig,
    fallback: Arc<FallbackState>,
    strategies: Vec<Box<dyn RoutingStrategy>>,
}

impl<G: ContentGenerator> FallbackRouter<G> {
    pub fn new(inner: G, config: RouterConfig) -> Self {
        Self::with_state(inner, config, Arc::new(FallbackState::new()))
    }

    /// Shares an existing session fallback flag.
    pub fn with_state(inner: G, config: RouterConfig, fallback: Arc<FallbackState>) -> Self {
        let strategies: Vec<Box<dyn RoutingStrategy>> = vec![
            Box::new(FallbackStrategy::new(config.fallback_model.clone())),
            Box::new(DefaultStrategy),
        ];
        Self {
            inner,
            config,
            fallback,
            strategies,
        }
    }

    pub fn fallback_state(&self) -> Arc<FallbackState> {
        self.fallback.clone()
    }

    pub fn is_in_fallback_mode(&self) -> bool {
        self.fallback.is_active()
    }

    /// Clears fallback mode (e.g. after re-authentication).
    pub fn reset_fallback(&self) -> bool {
        let was_active = self.fallback.reset();
        if was_active {
            log::info!("Fallback mode cleared");
        }
        was_active
    }

    /// Picks the model for a request from the strategy chain.
    pub fn select_model(&self, requested_model: &str) -> RoutingDecision {
        let active = self.fallback.is_active();
        self.strategies
            .iter()
            .find_map(|s| s.route(requested_model, active))
            .unwrap_or_else(|| RoutingDecision {
                model: requested_model.to_string(),
                metadata: RoutingMetadata {
                    source: "default".to_string(),
                    latency_ms: 0,
                    reasoning: format!("Routing to configured model: {}", requested_model),
                },
            })
    }

    /// Puts a custom strategy in front of the built-in chain.
    pub fn with_strategy(mut self, strategy: Box<dyn RoutingStrategy>) -> Self {
        self.strategies.insert(0, strategy);
        self
    }

    /// Decides what to do with a failed attempt: `Ok(delay)` retries after
    /// `delay`, `Err` surfaces the error.
    fn on_failure(&self, err: Error, attempts: &mut Attempts) -> Result<Duration> {
        let mut class = classify_error(&err);
        if class == ErrorClass::Retryable {
            attempts.consecutive += 1;
            if attempts.consecutive >= self.config.quota_trip_threshold && !attempts.quota_retried {
                log::warn!(
                    "{} consecutive retryable failures, treating as quota pressure",
                    attempts.consecutive
                );
                class = ErrorClass::QuotaExceeded;
            }
        }

        match class {
            ErrorClass::Fatal => Err(err),
            ErrorClass::QuotaExceeded => {
                attempts.made += 1;
                if attempts.quota_retried || attempts.made >= self.config.retry.max_attempts {
                    return Err(match err {
                        Error::QuotaExceeded(_) => err,
                        other => Error::quota_exceeded(other.to_string()),
                    });
                }
                if self.fallback.activate() {
                    log::warn!(
                        "Quota exceeded ({}); switching to fallback model {}",
                        err,
                        self.config.fallback_model
                    );
                }
                attempts.quota_retried = true;
                attempts.consecutive = 0;
                Ok(Duration::ZERO)
            }
            ErrorClass::Retryable => {
                attempts.made += 1;
                if attempts.made >= self.config.retry.max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: attempts.made,
                        source: Box::new(err),
                    });
                }
                let delay = self.config.retry.calculate_delay(attempts.made - 1);
                log::debug!(
                    "Retryable failure (attempt {}): {}; retrying in {:?}",
                    attempts.made,
                    err,
                    delay
                );
                Ok(delay)
            }
        }
    }

    async fn run<T, F, Fut>(&self, request: GenerateContentRequest, mut call: F) -> Result<T>
    where
        F: FnMut(GenerateContentRequest) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let abort = request.config.abort_signal.clone();
        let mut attempts = Attempts::default();

        loop {
            let decision = self.select_model(&request.model);
            if decision.model != request.model {
                log::debug!("{}", decision.metadata.reasoning);
            }
            let mut routed = request.clone();
            routed.model = decision.model;

            match call(routed).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.on_failure(err, &mut attempts)?;
                    backoff(delay, abort.as_ref()).await?;
                }
            }
        }
    }
}

#[async_trait]
impl<G: ContentGenerator> ContentGenerator for FallbackRouter<G> {
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<GenerateContentResponse> {
        self.run(request, |routed| self.inner.generate_content(routed, user_prompt_id))
            .await
    }

    /// Retries cover opening the stream; failures after the first emission pass through.
    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
        user_prompt_id: &str,
    ) -> Result<ResponseStream> {
        self.run(request, |routed| {
            self.inner.generate_content_stream(routed, user_prompt_id)
        })
        .await
    }

    async fn count_tokens(&self, mut request: CountTokensRequest) -> Result<CountTokensResponse> {
        request.model = self.select_model(&request.model).model;
        let abort = request.abort_signal.clone();
        retry_until_cancelled(&self.config.retry, abort.as_ref(), || {
            self.inner.count_tokens(request.clone())
        })
        .await
    }

    async fn embed_content(&self, request: EmbedContentRequest) -> Result<EmbedContentResponse> {
        self.inner.embed_content(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_state_compare_and_set() {
        let state = FallbackState::new();
        assert!(!state.is_active());
        assert!(state.activate());
        assert!(!state.activate());
        assert!(state.is_active());
        assert!(state.reset());
        assert!(!state.reset());
    }

    #[test]
    fn test_default_strategy_metadata() {
        let decision = DefaultStrategy.route("glm-4.6", false).unwrap();
        assert_eq!(decision.model, "glm-4.6");
        assert_eq!(decision.metadata.source, "default");
        assert_eq!(decision.metadata.latency_ms, 0);
        assert_eq!(decision.metadata.reasoning, "Routing to configured model: glm-4.6");
    }

    #[test]
    fn test_fallback_strategy_honours_lite_models() {
        let strategy = FallbackStrategy::new("cheap");
        assert_eq!(strategy.route("big-model", false), None);
        assert_eq!(strategy.route("small-flash", true), None);
        let decision = strategy.route("big-model", true).unwrap();
        assert_eq!(decision.model, "cheap");
        assert_eq!(decision.metadata.source, "fallback");
    }

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.quota_trip_threshold, 3);
        assert_eq!(config.fallback_model, DEFAULT_FLASH_MODEL);
    }
}
