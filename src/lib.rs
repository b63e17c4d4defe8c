//! # turnwise
//!
//! The orchestration core of an agentic command-line assistant: it sits
//! between a conversation loop and a pluggable LLM backend.
//!
//! ## Overview
//!
//! - **Message model**: backend-neutral [`Content`]/[`Part`] turns and
//!   [`GenerateContentResponse`] candidates
//! - **Content generation**: the [`ContentGenerator`] contract, implemented
//!   over HTTP/SSE by [`ChatCompletionsClient`] and composable with the
//!   logging, recording and fake decorators
//! - **Streaming aggregation**: an SSE decoder plus a pure chunk reducer that
//!   turns deltas into cumulative responses
//! - **Tool scheduling**: [`ToolCallScheduler`] validates, gates and executes
//!   model-proposed tool calls, always producing one response per call
//! - **Retry and fallback**: [`FallbackRouter`] retries transient failures and
//!   downgrades to a cheaper model under quota pressure
//! - **Policy and confirmation**: [`PolicyEngine`] decides allow/ask/deny;
//!   [`ConfirmationBus`] carries "ask" decisions to an external approver
//!
//! ## Example
//!
//! ```rust,no_run
//! use turnwise::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let client = ChatCompletionsClient::new(ClientConfig::from_env()?)?;
//!     let router = FallbackRouter::new(client, RouterConfig::default());
//!
//!     let registry: ToolRegistry = vec![
//!         tool("ls", "List a directory")
//!             .param("path", "string")
//!             .build(|_args, _abort| async move { Ok(json!({"entries": []})) }),
//!     ]
//!     .into_iter()
//!     .collect();
//!     let policy = PolicyEngine::new(vec![PolicyRule::allow("read-only", "ls")])?;
//!     let scheduler = ToolCallScheduler::new(Arc::new(registry), Arc::new(policy));
//!
//!     let mut conversation = Conversation::new(
//!         router,
//!         scheduler,
//!         ConversationConfig::new("glm-4.6").with_system_instruction("You are a helpful assistant"),
//!     );
//!
//!     let outcome = conversation
//!         .run_turn("What is in this directory?", &CancellationToken::new())
//!         .await?;
//!     println!("{}", outcome.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: message model and request/response types
//! - **generator**: `ContentGenerator` trait and decorators
//! - **wire**: chat-completions wire format and mapping tables
//! - **streaming**: SSE decoding and chunk aggregation
//! - **client**: the HTTP/SSE adapter
//! - **retry** / **router**: error classification, backoff, fallback routing
//! - **policy** / **confirmation**: tool approval
//! - **tools** / **scheduler**: tool contract and call lifecycle
//! - **conversation** / **compression**: the turn loop and history summarisation
//! - **config** / **context** / **error**: ambient plumbing

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// HTTP/SSE adapter implementing `ContentGenerator` for chat-completions backends.
mod client;

/// Summarising old history once it passes a token limit.
mod compression;

/// Client configuration, model constants and effective-model selection.
mod config;

/// Approval requests and responses between the scheduler and an external approver.
mod confirmation;

/// Token estimation and history truncation.
mod context;

/// The multi-iteration turn loop.
mod conversation;

/// Error types; defines `Error` and the `Result<T>` alias.
mod error;

/// The content generator contract and its decorators.
mod generator;

/// Allow/ask/deny rules for tool calls.
mod policy;

/// Retry and model fallback around any content generator.
mod router;

/// Tool call lifecycle: validation, policy, confirmation, execution.
mod scheduler;

/// Tool contract, builder and registry.
mod tools;

/// Backend-neutral message model.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff, jitter and error classification.
pub mod retry;

/// SSE decoding and the streaming chunk aggregator.
pub mod streaming;

/// Chat-completions wire types and the mapping to and from the message model.
pub mod wire;

// --- Wire adapter ---

pub use client::ChatCompletionsClient;

// --- Compression ---

pub use compression::{
    CompressionConfig, CompressionMetrics, ContextCompressor, SUMMARY_PREFIX, is_summary,
};

// --- Configuration ---

pub use config::{
    ClientConfig, ClientConfigBuilder, DEFAULT_BASE_URL, DEFAULT_FLASH_LITE_MODEL,
    DEFAULT_FLASH_MODEL, DEFAULT_MODEL, effective_model_with, get_effective_model, is_lite_model,
};

// --- Confirmation ---

pub use confirmation::{
    ApproverHandle, ConfirmationBus, ConfirmationDecision, ConfirmationOutcome,
    ConfirmationRequest, ConfirmationResponse, Responder,
};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_history};

// --- Conversation ---

pub use conversation::{Conversation, ConversationConfig, ToolHistoryEntry, TurnOutcome};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Content Generation ---

pub use generator::{
    ContentGenerator, FakeContentGenerator, LoggingContentGenerator, RecordedResponse,
    RecordingContentGenerator,
};
pub use streaming::ResponseStream;

// --- Policy ---

pub use policy::{ArgumentMatcher, PolicyDecision, PolicyEngine, PolicyRule, PolicyVerdict};

// --- Routing ---

pub use retry::{ErrorClass, RetryConfig, classify_error};
pub use router::{
    DefaultStrategy, FallbackRouter, FallbackState, FallbackStrategy, RouterConfig,
    RoutingDecision, RoutingMetadata, RoutingStrategy,
};

// --- Tool System ---

pub use scheduler::{
    CompletedToolCall, SchedulerConfig, ToolCallRequest, ToolCallScheduler, ToolCallState,
    ToolCallStatus, ToolCallUpdate,
};
pub use tools::{Tool, ToolBuilder, ToolHandler, ToolRegistry, tool};

// --- Core Types ---

pub use types::{
    Candidate, Content, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, FinishReason, FunctionCall, FunctionCallingMode, FunctionDeclaration,
    FunctionResponse, GenerateContentConfig, GenerateContentRequest, GenerateContentResponse,
    Part, Role, TextPart, ToolConfig, UsageMetadata,
};

/// Re-exported so callers need not depend on `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most hosts need. Import with `use turnwise::prelude::*;`.
pub mod prelude {
    pub use crate::{
        CancellationToken, ChatCompletionsClient, ClientConfig, ConfirmationBus,
        ConfirmationDecision, ConfirmationResponse, Content, ContentGenerator, Conversation,
        ConversationConfig, Error, FallbackRouter, FunctionCall, FunctionResponse,
        GenerateContentRequest, GenerateContentResponse, Part, PolicyEngine, PolicyRule, Result,
        Role, RouterConfig, Tool, ToolCallScheduler, ToolRegistry, tool,
    };
}
