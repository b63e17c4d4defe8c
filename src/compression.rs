//! Context compression
//!
//! When the estimated history size passes `max_context_tokens`, the oldest
//! span of history (everything before the preserved tail) is replaced by one
//! model content holding a summary. The summary comes from the content
//! generator; when that call fails or returns nothing, a local snippet summary
//! is used instead so compression always makes progress.
//!
//! Passes repeat until the history is under `target_context_tokens`, the pass
//! limit is reached, or a pass saves less than 10% of the tokens.

use crate::context::estimate_tokens;
use crate::generator::ContentGenerator;
use crate::types::{Content, GenerateContentConfig, GenerateContentRequest, Part, Role};
use crate::{Error, Result};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Every summary content starts with this text.
pub const SUMMARY_PREFIX: &str = "[context compression #";

const MIN_SUMMARY_CHARS: usize = 200;
const CHARS_PER_TOKEN: usize = 4;
const FALLBACK_MAX_SNIPPETS: usize = 10;
const FALLBACK_SNIPPET_CHARS: usize = 160;
const TRANSCRIPT_PAYLOAD_CHARS: usize = 500;
const MIN_REDUCTION_RATIO: f64 = 0.10;

const SUMMARIZER_INSTRUCTION: &str =
    "You condense developer conversations into durable context summaries.";

/// Settings for automatic context compression
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Compression starts above this estimate
    pub max_context_tokens: u32,
    /// Passes stop once the estimate is at or below this
    pub target_context_tokens: u32,
    /// Most recent contents never summarised
    pub preserve_recent: usize,
    /// Summary length budget, as tokens (≈4 characters each)
    pub summary_max_tokens: u32,
    /// Model for summary requests; the conversation model when unset
    pub summary_model: Option<String>,
    pub max_passes: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_context_tokens: 185_000,
            target_context_tokens: 165_000,
            preserve_recent: 15,
            summary_max_tokens: 2_000,
            summary_model: None,
            max_passes: 3,
        }
    }
}

impl CompressionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets both thresholds.
    pub fn with_limits(mut self, max_context_tokens: u32, target_context_tokens: u32) -> Self {
        self.max_context_tokens = max_context_tokens;
        self.target_context_tokens = target_context_tokens;
        self
    }

    pub fn with_preserve_recent(mut self, contents: usize) -> Self {
        self.preserve_recent = contents;
        self
    }

    pub fn with_summary_max_tokens(mut self, tokens: u32) -> Self {
        self.summary_max_tokens = tokens;
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_context_tokens == 0 {
            return Err(Error::config("max_context_tokens must be greater than 0"));
        }
        if self.target_context_tokens == 0 {
            return Err(Error::config("target_context_tokens must be greater than 0"));
        }
        if self.target_context_tokens >= self.max_context_tokens {
            return Err(Error::config(format!(
                "target_context_tokens ({}) must be less than max_context_tokens ({})",
                self.target_context_tokens, self.max_context_tokens
            )));
        }
        if self.preserve_recent == 0 {
            return Err(Error::config("preserve_recent must be at least 1"));
        }
        if self.summary_max_tokens == 0 {
            return Err(Error::config("summary_max_tokens must be greater than 0"));
        }
        if self.max_passes == 0 {
            return Err(Error::config("max_passes must be at least 1"));
        }
        Ok(())
    }

    fn summary_max_chars(&self) -> usize {
        (self.summary_max_tokens as usize * CHARS_PER_TOKEN).max(MIN_SUMMARY_CHARS)
    }
}

/// Running totals over every compression pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionMetrics {
    pub compressions: u32,
    /// Estimated tokens of the summarised spans
    pub tokens_before: u64,
    /// Estimated tokens of the summaries that replaced them
    pub tokens_after: u64,
    pub contents_compressed: u64,
    pub model_summaries: u32,
    pub fallback_summaries: u32,
}

impl CompressionMetrics {
    fn record(&mut self, tokens_before: u32, tokens_after: u32, contents: usize, used_model: bool) {
        self.compressions += 1;
        self.tokens_before += u64::from(tokens_before);
        self.tokens_after += u64::from(tokens_after);
        self.contents_compressed += contents as u64;
        if used_model {
            self.model_summaries += 1;
        } else {
            self.fallback_summaries += 1;
        }
    }

    /// Share of summarised tokens saved, 0.0 before any compression.
    pub fn compression_ratio(&self) -> f64 {
        if self.tokens_before == 0 {
            return 0.0;
        }
        1.0 - self.tokens_after as f64 / self.tokens_before as f64
    }

    pub fn tokens_saved(&self) -> u64 {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

impl fmt::Display for CompressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.compressions == 0 {
            return write!(f, "No compressions performed yet.");
        }
        write!(
            f,
            "Compressions: {} | Contents compressed: {} | Tokens saved: {} ({:.1}%) | Model: {} | Fallback: {}",
            self.compressions,
            self.contents_compressed,
            self.tokens_saved(),
            self.compression_ratio() * 100.0,
            self.model_summaries,
            self.fallback_summaries
        )
    }
}

/// Keeps a history under its token limit by summarising old spans.
#[derive(Debug, Clone, Default)]
pub struct ContextCompressor {
    config: CompressionConfig,
    metrics: CompressionMetrics,
    /// Summaries produced since the last reset; numbers the next one
    count: u32,
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            metrics: CompressionMetrics::default(),
            count: 0,
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CompressionMetrics {
        &self.metrics
    }

    /// Restarts summary numbering, e.g. after the history was cleared.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = CompressionMetrics::default();
    }

    /// Compresses `history` in place if it is over the limit.
    ///
    /// Returns the number of passes performed. Summary request failures fall
    /// back to a local summary; only cancellation is returned as an error.
    pub async fn maybe_compress<G: ContentGenerator + ?Sized>(
        &mut self,
        generator: &G,
        model: &str,
        history: &mut Vec<Content>,
        trigger: &str,
        abort: &CancellationToken,
    ) -> Result<u32> {
        if !self.config.enabled {
            return Ok(0);
        }

        let mut passes = 0;
        for pass in 0..self.config.max_passes.max(1) {
            let tokens_before = estimate_tokens(history);
            if tokens_before <= self.config.max_context_tokens {
                break;
            }

            let compressed = self
                .compress_once(generator, model, history, trigger, pass, abort)
                .await?;
            if !compressed {
                break;
            }
            passes += 1;

            let tokens_after = estimate_tokens(history);
            let reduction =
                f64::from(tokens_before.saturating_sub(tokens_after)) / f64::from(tokens_before);
            if reduction < MIN_REDUCTION_RATIO {
                log::debug!(
                    "Compression stopped: {:.1}% reduction is below {:.0}%",
                    reduction * 100.0,
                    MIN_REDUCTION_RATIO * 100.0
                );
                break;
            }
            if tokens_after <= self.config.target_context_tokens {
                break;
            }
        }
        Ok(passes)
    }

    async fn compress_once<G: ContentGenerator + ?Sized>(
        &mut self,
        generator: &G,
        model: &str,
        history: &mut Vec<Content>,
        trigger: &str,
        pass: u32,
        abort: &CancellationToken,
    ) -> Result<bool> {
        let Some((start, end)) = self.select_span(history) else {
            log::debug!("Context compression skipped: nothing left to summarise");
            return Ok(false);
        };

        let total_tokens = estimate_tokens(history);
        let window = &history[start..end];
        let window_tokens = estimate_tokens(window);
        let (summary, used_model) = self.summarize(generator, model, window, abort).await?;
        let summary = truncate_summary(&summary, self.config.summary_max_chars());
        let text = self.format_summary(&summary, window, window_tokens, total_tokens, trigger, pass);

        let summary_content = Content::model(vec![Part::text(text)]);
        let summary_tokens = estimate_tokens(std::slice::from_ref(&summary_content));
        let removed = end - start;
        history.drain(start..end);
        history.insert(start, summary_content);
        self.count += 1;
        self.metrics
            .record(window_tokens, summary_tokens, removed, used_model);

        log::info!(
            "Context compressed: {} contents (≈{} tokens) summarised; trigger: {}",
            removed,
            window_tokens,
            trigger_label(trigger)
        );
        Ok(true)
    }

    /// Span of history to summarise: from the first non-system content up to
    /// the preserved tail.
    ///
    /// The tail never opens with a tool turn, so no function response is kept
    /// without the call that produced it.
    fn select_span(&self, history: &[Content]) -> Option<(usize, usize)> {
        let candidates: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, c)| c.role != Role::System)
            .map(|(i, _)| i)
            .collect();

        let preserve = self.config.preserve_recent.max(1);
        if candidates.len() <= preserve {
            return None;
        }

        let start = candidates[0];
        let mut end = candidates[candidates.len() - preserve];
        while end < history.len() && history[end].role == Role::Tool {
            end += 1;
        }
        if end >= history.len() || end <= start {
            return None;
        }

        if history[start..end].iter().all(is_summary) {
            return None;
        }
        Some((start, end))
    }

    async fn summarize<G: ContentGenerator + ?Sized>(
        &self,
        generator: &G,
        model: &str,
        window: &[Content],
        abort: &CancellationToken,
    ) -> Result<(String, bool)> {
        let model = self.config.summary_model.as_deref().unwrap_or(model);
        let prompt = format!(
            "Summarise the coding session conversation below.\n\
             Focus on:\n\
             - Key objectives, decisions, and conclusions.\n\
             - File paths, commands, and code changes mentioned.\n\
             - Outstanding tasks, questions, or follow-ups.\n\n\
             Output <= {} characters. Use concise bullet points when possible.\n\n\
             <conversation>\n{}\n</conversation>",
            self.config.summary_max_chars(),
            render_transcript(window)
        );
        let request = GenerateContentRequest::new(model, vec![Content::user(prompt)]).with_config(
            GenerateContentConfig::new()
                .with_system_instruction(SUMMARIZER_INSTRUCTION)
                .with_abort_signal(abort.clone()),
        );

        match generator.generate_content(request, "context-compression").await {
            Ok(response) => {
                let summary = response.text().trim().to_string();
                if summary.is_empty() {
                    log::warn!("Summary request returned no text; using local summary");
                    Ok((fallback_summary(window), false))
                } else {
                    Ok((summary, true))
                }
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                log::warn!("Summary request failed ({}); using local summary", e);
                Ok((fallback_summary(window), false))
            }
        }
    }

    fn format_summary(
        &self,
        summary: &str,
        window: &[Content],
        window_tokens: u32,
        total_tokens: u32,
        trigger: &str,
        pass: u32,
    ) -> String {
        let first = window.first().map(|c| role_label(c.role)).unwrap_or("none");
        let last = window.last().map(|c| role_label(c.role)).unwrap_or("none");
        format!(
            "{}{} | span: {} contents ({}→{}); was ≈{} tokens of ≈{}]\n\
             Triggered by: {} (pass {}).\n\n\
             {}\n\n\
             Use this summary instead of asking the user to repeat earlier details. \
             Assume the compressed messages already occurred.",
            SUMMARY_PREFIX,
            self.count + 1,
            window.len(),
            first,
            last,
            window_tokens,
            total_tokens,
            trigger_label(trigger),
            pass + 1,
            summary
        )
    }
}

/// True for contents produced by [`ContextCompressor`].
pub fn is_summary(content: &Content) -> bool {
    content.role == Role::Model && content.text().starts_with(SUMMARY_PREFIX)
}

fn trigger_label(trigger: &str) -> &str {
    if trigger.is_empty() { "automatic" } else { trigger }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
        Role::Tool => "tool",
        Role::System => "system",
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Plain-text rendering of one content, tool payloads included.
fn render_content(content: &Content) -> String {
    let mut pieces = Vec::new();
    let text = content.text();
    if !text.trim().is_empty() {
        pieces.push(text.trim().to_string());
    }
    for part in &content.parts {
        match part {
            Part::FunctionCall(call) => pieces.push(format!(
                "called {}({})",
                call.name,
                clip(&call.args_value().to_string(), TRANSCRIPT_PAYLOAD_CHARS)
            )),
            Part::FunctionResponse(response) => pieces.push(format!(
                "{} returned {}",
                response.name,
                clip(
                    &serde_json::Value::Object(response.response.clone()).to_string(),
                    TRANSCRIPT_PAYLOAD_CHARS
                )
            )),
            Part::Text(_) => {}
        }
    }
    pieces.join("\n")
}

fn render_transcript(window: &[Content]) -> String {
    window
        .iter()
        .map(|content| {
            let label = role_label(content.role).to_uppercase();
            let body = render_content(content);
            if body.is_empty() {
                format!("{}: (no textual content)", label)
            } else {
                format!("{}: {}", label, body)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summary built without the model: the first line of up to ten contents.
fn fallback_summary(window: &[Content]) -> String {
    let snippets: Vec<String> = window
        .iter()
        .filter_map(|content| {
            let rendered = render_content(content);
            let head = rendered.lines().next()?.trim();
            if head.is_empty() {
                return None;
            }
            let head: String = head.chars().take(FALLBACK_SNIPPET_CHARS).collect();
            Some(format!("- {}: {}", role_label(content.role), head))
        })
        .take(FALLBACK_MAX_SNIPPETS)
        .collect();

    if snippets.is_empty() {
        return "Earlier conversation compressed. No textual content captured.".to_string();
    }
    format!("Key points kept due to local fallback:\n{}", snippets.join("\n"))
}

/// Cuts `summary` to `max_chars`, backing up to the last full line.
fn truncate_summary(summary: &str, max_chars: usize) -> String {
    let summary = summary.trim();
    let Some((cut, _)) = summary.char_indices().nth(max_chars) else {
        return summary.to_string();
    };
    let clipped = &summary[..cut];
    let clipped = match clipped.rfind('\n') {
        Some(newline) => &clipped[..newline],
        None => clipped,
    };
    clipped.trim_end().to_string()
}
