//! Conversation turn loop.
//!
//! A [`Conversation`] owns the history and drives one user turn to completion:
//! stream a model response, append it, run any proposed tool calls through the
//! [`ToolCallScheduler`], append their responses, and go again until the model
//! stops calling tools or the tool-iteration budget runs out.
//!
//! Before each model request the history is compressed if it has grown past
//! the configured token limit (see [`ContextCompressor`]).
//!
//! Only errors from the generator (after the router has given up) end a turn
//! early; tool failures are already folded into the history as responses.

use crate::compression::{CompressionConfig, CompressionMetrics, ContextCompressor};
use crate::config::DEFAULT_MODEL;
use crate::context::{estimate_tokens, truncate_history};
use crate::generator::ContentGenerator;
use crate::scheduler::{CompletedToolCall, ToolCallRequest, ToolCallScheduler, ToolCallStatus};
use crate::types::{
    Content, FinishReason, FunctionCall, FunctionResponse, GenerateContentConfig,
    GenerateContentRequest, GenerateContentResponse, Part, UsageMetadata,
};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Settings for a [`Conversation`]
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub model: String,
    /// Generation options; `tools` is filled from the scheduler's registry
    pub generation: GenerateContentConfig,
    /// Tool rounds allowed per user turn
    pub max_tool_iterations: u32,
    /// Prefix for turn and prompt ids
    pub session_id: String,
    pub compression: CompressionConfig,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            generation: GenerateContentConfig::default(),
            max_tool_iterations: 10,
            session_id: "session".to_string(),
            compression: CompressionConfig::default(),
        }
    }
}

impl ConversationConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.generation.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_generation_config(mut self, generation: GenerateContentConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_max_tool_iterations(mut self, iterations: u32) -> Self {
        self.max_tool_iterations = iterations;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }
}

/// One executed (or refused) tool call, kept for the life of the conversation
#[derive(Debug, Clone)]
pub struct ToolHistoryEntry {
    pub turn_id: String,
    pub call_id: String,
    pub name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    pub duration: Duration,
}

impl From<&CompletedToolCall> for ToolHistoryEntry {
    fn from(completed: &CompletedToolCall) -> Self {
        Self {
            turn_id: completed.state.turn_id.clone(),
            call_id: completed.state.call_id.clone(),
            name: completed.state.name.clone(),
            args: completed.state.args.clone(),
            status: completed.state.status,
            duration: completed.duration,
        }
    }
}

/// Summary of a finished turn
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Non-thought text of the last model response
    pub text: String,
    /// Tool rounds executed
    pub iterations: u32,
    pub tool_calls: Vec<CompletedToolCall>,
    pub finish_reason: Option<FinishReason>,
    /// Usage summed over every model response in the turn
    pub usage: UsageMetadata,
    /// The model still wanted tools when the budget ran out
    pub budget_exhausted: bool,
}

/// History plus the machinery to advance it.
pub struct Conversation<G> {
    generator: G,
    scheduler: ToolCallScheduler,
    config: ConversationConfig,
    history: Vec<Content>,
    tool_history: Vec<ToolHistoryEntry>,
    compressor: ContextCompressor,
    usage: UsageMetadata,
    turns: u64,
}

impl<G: ContentGenerator> Conversation<G> {
    pub fn new(generator: G, scheduler: ToolCallScheduler, config: ConversationConfig) -> Self {
        let compressor = ContextCompressor::new(config.compression.clone());
        Self {
            generator,
            scheduler,
            config,
            history: Vec::new(),
            tool_history: Vec::new(),
            compressor,
            usage: UsageMetadata::default(),
            turns: 0,
        }
    }

    /// Runs one user turn to completion.
    pub async fn run_turn(
        &mut self,
        prompt: impl Into<String>,
        abort: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.turns += 1;
        let turn_id = format!("{}-{}", self.config.session_id, self.turns);
        self.history.push(Content::user(prompt));

        let mut outcome = TurnOutcome::default();

        loop {
            if abort.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let trigger = if outcome.iterations == 0 { "user" } else { "tool" };
            self.compressor
                .maybe_compress(
                    &self.generator,
                    &self.config.model,
                    &mut self.history,
                    trigger,
                    abort,
                )
                .await?;

            // ================================================================
            // Ask the model
            // ================================================================
            let prompt_id = format!("{}#{}", turn_id, outcome.iterations);
            let response = self.stream_response(&prompt_id, abort).await?;

            if let Some(usage) = &response.usage_metadata {
                outcome.usage.accumulate(usage);
                self.usage.accumulate(usage);
            }

            let (content, finish_reason) = match response.first_candidate() {
                Some(candidate) => (candidate.content.clone(), candidate.finish_reason),
                None => (Content::model(vec![Part::text("")]), None),
            };
            let calls: Vec<FunctionCall> = content.function_calls().cloned().collect();
            outcome.text = content.text();
            outcome.finish_reason = finish_reason;
            self.history.push(content);

            if calls.is_empty() {
                return Ok(outcome);
            }

            // ================================================================
            // Out of budget: answer the calls without running them
            // ================================================================
            if outcome.iterations >= self.config.max_tool_iterations {
                log::warn!(
                    "Turn {} hit the tool iteration budget ({}); {} call(s) not executed",
                    turn_id,
                    self.config.max_tool_iterations,
                    calls.len()
                );
                let refusals = calls
                    .iter()
                    .enumerate()
                    .map(|(position, call)| {
                        let id = call
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("{}-{}", call.name, position));
                        FunctionResponse::error(
                            Some(id),
                            &call.name,
                            "tool iteration budget exhausted for this turn",
                        )
                    })
                    .collect();
                self.history.push(Content::tool_responses(refusals));
                outcome.budget_exhausted = true;
                return Ok(outcome);
            }

            // ================================================================
            // Run the tools; responses land together, in proposal order
            // ================================================================
            outcome.iterations += 1;
            let requests = calls.into_iter().map(ToolCallRequest::from).collect();
            let completed = self.scheduler.schedule(&turn_id, requests, abort).await;

            self.tool_history
                .extend(completed.iter().map(ToolHistoryEntry::from));
            self.history.push(Content::tool_responses(
                completed.iter().map(|c| c.response.clone()).collect(),
            ));
            outcome.tool_calls.extend(completed);
        }
    }

    /// Streams one response and returns the last cumulative emission.
    async fn stream_response(
        &self,
        prompt_id: &str,
        abort: &CancellationToken,
    ) -> Result<GenerateContentResponse> {
        let mut generation = self.config.generation.clone();
        let declarations = self.scheduler.registry().declarations();
        if !declarations.is_empty() {
            generation.tools = declarations;
        }
        generation.abort_signal = Some(abort.clone());

        let request = GenerateContentRequest::new(self.config.model.clone(), self.history.clone())
            .with_config(generation);

        let mut stream = self
            .generator
            .generate_content_stream(request, prompt_id)
            .await?;

        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item?);
        }
        last.ok_or_else(|| Error::other("model stream ended without a response"))
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Appends content directly, e.g. when restoring a saved session.
    pub fn push_content(&mut self, content: Content) {
        self.history.push(content);
    }

    pub fn tool_history(&self) -> &[ToolHistoryEntry] {
        &self.tool_history
    }

    /// Usage summed over the whole conversation.
    pub fn usage(&self) -> &UsageMetadata {
        &self.usage
    }

    pub fn estimated_tokens(&self) -> u32 {
        estimate_tokens(&self.history)
    }

    /// Keeps the first content and the most recent `keep`.
    pub fn truncate_history(&mut self, keep: usize) {
        let before = self.history.len();
        self.history = truncate_history(&self.history, keep);
        if self.history.len() != before {
            log::debug!("Truncated history from {} to {} entries", before, self.history.len());
        }
    }

    /// Compresses now if the history is over the limit; returns the passes run.
    pub async fn compress_history(&mut self, abort: &CancellationToken) -> Result<u32> {
        self.compressor
            .maybe_compress(
                &self.generator,
                &self.config.model,
                &mut self.history,
                "manual",
                abort,
            )
            .await
    }

    pub fn compression_metrics(&self) -> &CompressionMetrics {
        self.compressor.metrics()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.tool_history.clear();
        self.compressor.reset();
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }
}
