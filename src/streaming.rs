//! Streaming support: SSE framing and chunk aggregation.
//!
//! A streamed chat completion arrives as Server-Sent Events:
//!
//! ```text
//! data: {"choices":[{"index":0,"delta":{"role":"assistant","reasoning_content":"Analyzing"}}]}
//!
//! data: {"choices":[{"index":0,"delta":{"content":"Answer."}}]}
//!
//! data: {"choices":[{"index":0,"finish_reason":"stop"}],"usage":{"total_tokens":17}}
//!
//! data: [DONE]
//! ```
//!
//! Two layers turn that into message-model responses:
//!
//! 1. [`SseDecoder`] splits raw bytes into event payloads. Bytes are buffered
//!    until a blank line closes an event, so a chunk boundary may fall anywhere,
//!    including inside a multi-byte character.
//! 2. [`StreamingState::apply_chunk`] folds each parsed chunk into per-choice
//!    [`StreamingChoiceState`] and renders the *cumulative* completion so far.
//!
//! [`response_stream`] wires both together over any byte stream and maps every
//! cumulative completion through the same rules as a non-streaming response.
//! The state lives inside that one stream and is dropped with it.

use crate::types::GenerateContentResponse;
use crate::wire::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatResponseMessage, WireContent,
    WireContentItem, WireFunction, WireToolCall, WireUsage, normalize_content,
    to_generate_content_response,
};
use crate::{Error, Result};
use futures::stream::{self, Stream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Stream of cumulative responses produced by `generate_content_stream`
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<GenerateContentResponse>> + Send>>;

/// End-of-stream sentinel payload
pub const DONE_SENTINEL: &str = "[DONE]";

// ============================================================================
// SSE FRAMING
// ============================================================================

/// A decoded SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Joined `data:` payload of one event
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and drains every complete event.
    ///
    /// Events without a `data:` line are dropped. After the sentinel nothing
    /// more is produced.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some((end, separator_len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + separator_len).take(end).collect();
            if let Some(frame) = self.decode_event(&event) {
                let is_done = frame == SseFrame::Done;
                frames.push(frame);
                if is_done {
                    self.buffer.clear();
                    break;
                }
            }
        }
        frames
    }

    /// Flushes a trailing event that was never closed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.done {
            return None;
        }
        let remaining = std::mem::take(&mut self.buffer);
        if String::from_utf8_lossy(&remaining).trim().is_empty() {
            return None;
        }
        self.decode_event(&remaining)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_event(&mut self, event: &[u8]) -> Option<SseFrame> {
        let text = String::from_utf8_lossy(event);
        let payload = extract_sse_data(&text)?;
        let trimmed = payload.trim();
        if trimmed == DONE_SENTINEL {
            self.done = true;
            return Some(SseFrame::Done);
        }
        Some(SseFrame::Data(trimmed.to_string()))
    }
}

/// Position and length of the first blank-line separator (`\n\n` or `\r\n\r\n`).
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Joins the `data:` lines of one event with `\n`. Comment lines (`:`) are ignored.
pub fn extract_sse_data(event: &str) -> Option<String> {
    let data: Vec<&str> = event
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.starts_with(':') && !line.trim().is_empty())
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();

    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

// ============================================================================
// CHUNK AGGREGATION
// ============================================================================

/// A tool call assembled from deltas
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialToolCall {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Accumulator for one candidate index
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingChoiceState {
    pub index: u32,
    pub role: String,
    pub content: Vec<WireContentItem>,
    pub reasoning: Vec<WireContentItem>,
    /// Keyed by position within the delta's `tool_calls` array
    pub tool_calls: BTreeMap<u32, PartialToolCall>,
    /// Sticky once set
    pub finish_reason: Option<String>,
}

impl StreamingChoiceState {
    fn new(index: u32) -> Self {
        Self {
            index,
            role: "assistant".to_string(),
            content: Vec::new(),
            reasoning: Vec::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: None,
        }
    }

    fn render(&self) -> ChatChoice {
        let tool_calls: Vec<WireToolCall> = self
            .tool_calls
            .values()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: call.kind.clone(),
                function: Some(WireFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                }),
            })
            .collect();

        ChatChoice {
            index: self.index,
            message: Some(ChatResponseMessage {
                role: Some(self.role.clone()),
                content: Some(if self.content.is_empty() {
                    WireContent::Text(String::new())
                } else {
                    WireContent::Items(self.content.clone())
                }),
                reasoning_content: (!self.reasoning.is_empty())
                    .then(|| WireContent::Items(self.reasoning.clone())),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            }),
            finish_reason: self.finish_reason.clone(),
        }
    }
}

/// Aggregation state for one streamed request
#[derive(Debug, Clone, Default)]
pub struct StreamingState {
    id: Option<String>,
    model: Option<String>,
    usage: Option<WireUsage>,
    choices: BTreeMap<u32, StreamingChoiceState>,
}

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn choice(&self, index: u32) -> Option<&StreamingChoiceState> {
        self.choices.get(&index)
    }

    /// Folds one chunk in and returns the cumulative completion so far.
    pub fn apply_chunk(
        &mut self,
        chunk: ChatCompletionChunk,
        requested_model: &str,
    ) -> ChatCompletionResponse {
        if chunk.id.is_some() {
            self.id = chunk.id;
        }
        if chunk.model.is_some() {
            self.model = chunk.model;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let index = choice.index.unwrap_or(0);
            let state = self
                .choices
                .entry(index)
                .or_insert_with(|| StreamingChoiceState::new(index));

            if let Some(delta) = choice.delta {
                if let Some(role) = delta.role.filter(|r| !r.is_empty()) {
                    state.role = role;
                }
                if let Some(content) = &delta.content {
                    state.content.extend(normalize_content(content));
                }
                if let Some(reasoning) = &delta.reasoning_content {
                    state.reasoning.extend(normalize_content(reasoning));
                }

                // Keyed by array position; some backends send a drifting `index`
                for (position, call) in delta.tool_calls.into_iter().flatten().enumerate() {
                    let entry = state
                        .tool_calls
                        .entry(position as u32)
                        .or_insert_with(|| PartialToolCall {
                            kind: Some("function".to_string()),
                            ..Default::default()
                        });

                    if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                        entry.id = Some(id);
                    }
                    if call.kind.is_some() {
                        entry.kind = call.kind;
                    }
                    if let Some(function) = call.function {
                        if entry.name.is_none() {
                            entry.name = function.name.filter(|n| !n.is_empty());
                        }
                        if let Some(fragment) = function.arguments {
                            entry.arguments.get_or_insert_with(String::new).push_str(&fragment);
                        }
                    }
                }
            }

            if choice.finish_reason.is_some() {
                state.finish_reason = choice.finish_reason;
            }
        }

        ChatCompletionResponse {
            id: self.id.clone(),
            model: Some(
                self.model
                    .clone()
                    .unwrap_or_else(|| requested_model.to_string()),
            ),
            choices: self.choices.values().map(StreamingChoiceState::render).collect(),
            usage: self.usage.clone(),
        }
    }
}

/// Pure reducer form of [`StreamingState::apply_chunk`].
pub fn apply_chunk(
    mut state: StreamingState,
    chunk: ChatCompletionChunk,
    requested_model: &str,
) -> (StreamingState, ChatCompletionResponse) {
    let aggregated = state.apply_chunk(chunk, requested_model);
    (state, aggregated)
}

// ============================================================================
// RESPONSE STREAM
// ============================================================================

struct StreamDriver<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    state: StreamingState,
    pending: VecDeque<GenerateContentResponse>,
    requested_model: String,
    abort: Option<CancellationToken>,
    finished: bool,
}

enum Pulled<T> {
    Item(Option<T>),
    Cancelled,
}

impl<S> StreamDriver<S> {
    fn handle(&mut self, frame: SseFrame) {
        match frame {
            SseFrame::Done => self.finished = true,
            SseFrame::Data(payload) => {
                match serde_json::from_str::<ChatCompletionChunk>(&payload) {
                    Ok(chunk) => {
                        let aggregated = self.state.apply_chunk(chunk, &self.requested_model);
                        self.pending.push_back(to_generate_content_response(
                            &aggregated,
                            &self.requested_model,
                        ));
                    }
                    Err(e) => {
                        log::debug!("Skipping malformed SSE event ({}): {}", e, payload);
                    }
                }
            }
        }
    }
}

/// Turns an SSE byte stream into a stream of cumulative responses.
///
/// Malformed events are skipped. The stream ends at the sentinel or at the end
/// of the body; cancelling `abort` yields a final [`Error::Cancelled`].
pub fn response_stream<S, B>(
    body: S,
    requested_model: impl Into<String>,
    abort: Option<CancellationToken>,
) -> ResponseStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let driver = StreamDriver {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        state: StreamingState::new(),
        pending: VecDeque::new(),
        requested_model: requested_model.into(),
        abort,
        finished: false,
    };

    Box::pin(stream::unfold(driver, |mut d| async move {
        loop {
            if let Some(response) = d.pending.pop_front() {
                return Some((Ok(response), d));
            }
            if d.finished {
                return None;
            }

            let pulled = match d.abort.clone() {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Pulled::Cancelled,
                    item = d.body.next() => Pulled::Item(item),
                },
                None => Pulled::Item(d.body.next().await),
            };

            match pulled {
                Pulled::Cancelled => {
                    d.finished = true;
                    d.pending.clear();
                    return Some((Err(Error::Cancelled), d));
                }
                Pulled::Item(Some(Ok(bytes))) => {
                    for frame in d.decoder.feed(bytes.as_ref()) {
                        d.handle(frame);
                    }
                }
                Pulled::Item(Some(Err(e))) => {
                    d.finished = true;
                    return Some((Err(e), d));
                }
                Pulled::Item(None) => {
                    if let Some(frame) = d.decoder.finish() {
                        d.handle(frame);
                    }
                    d.finished = true;
                }
            }
        }
    }))
}
