//! Backend-neutral message model
//!
//! Conversation turns are [`Content`] values: a role plus an ordered list of
//! [`Part`]s. A part is exactly one of a text span, a model-proposed function
//! call, or a tool's function response. None of these types know anything about
//! the wire format; `wire.rs` translates at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Author of a [`Content`] turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
    System,
}

/// One text span. `thought` marks reasoning output that is not part of the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
}

/// A function call proposed by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    /// Parsed arguments; `None` when the model's argument text was not a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl FunctionCall {
    pub fn new(id: Option<String>, name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id,
            name: name.into(),
            args: Some(args),
        }
    }

    /// Arguments as a JSON value, `{}` when absent.
    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone().unwrap_or_default())
    }
}

/// The result of a tool call, reported back to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Map<String, Value>,
}

impl FunctionResponse {
    /// Successful result. Non-object outputs are wrapped as `{"output": value}`.
    pub fn success(id: Option<String>, name: impl Into<String>, output: Value) -> Self {
        let response = match output {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("output".to_string(), other);
                map
            }
        };
        Self {
            id,
            name: name.into(),
            response,
        }
    }

    /// Error result carrying `{"error": true, "message": ...}`.
    pub fn error(id: Option<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut response = Map::new();
        response.insert("error".to_string(), Value::Bool(true));
        response.insert("message".to_string(), Value::String(message.into()));
        Self {
            id,
            name: name.into(),
            response,
        }
    }

    /// Adds an extra field to the response payload.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.response.insert(key.into(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.response.get("error"), Some(Value::Bool(true)))
    }

    pub fn message(&self) -> Option<&str> {
        self.response.get("message").and_then(Value::as_str)
    }
}

/// A single element of a [`Content`] turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text(TextPart),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(TextPart {
            text: text.into(),
            thought: false,
        })
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Part::Text(TextPart {
            text: text.into(),
            thought: true,
        })
    }

    pub fn as_text(&self) -> Option<&TextPart> {
        match self {
            Part::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse(r) => Some(r),
            _ => None,
        }
    }
}

/// One turn of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    /// A tool turn holding function responses in the given order.
    pub fn tool_responses(responses: Vec<FunctionResponse>) -> Self {
        Self::new(
            Role::Tool,
            responses.into_iter().map(Part::FunctionResponse).collect(),
        )
    }

    /// Concatenated non-thought text.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .filter(|t| !t.thought)
            .map(|t| t.text.as_str())
            .collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call)
    }
}

/// Wire finish reasons mapped into the internal vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    FinishReasonUnspecified,
}

/// Token accounting. All counts are optional and never negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_prompt_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<u32>,
}

impl UsageMetadata {
    /// Adds another turn's counts. A field stays `None` only if both sides are `None`.
    pub fn accumulate(&mut self, other: &UsageMetadata) {
        fn add(a: Option<u32>, b: Option<u32>) -> Option<u32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
            }
        }
        self.prompt_token_count = add(self.prompt_token_count, other.prompt_token_count);
        self.candidates_token_count =
            add(self.candidates_token_count, other.candidates_token_count);
        self.total_token_count = add(self.total_token_count, other.total_token_count);
        self.tool_use_prompt_token_count =
            add(self.tool_use_prompt_token_count, other.tool_use_prompt_token_count);
        self.thoughts_token_count = add(self.thoughts_token_count, other.thoughts_token_count);
    }
}

/// One alternative completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub index: u32,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    pub fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Non-thought text of the first candidate.
    pub fn text(&self) -> String {
        self.first_candidate()
            .map(|c| c.content.text())
            .unwrap_or_default()
    }

    /// Function calls of the first candidate, in part order.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.first_candidate()
            .map(|c| c.content.function_calls().cloned().collect())
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.first_candidate().and_then(|c| c.finish_reason)
    }
}

/// A tool made available to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionCallingMode {
    #[default]
    Auto,
    Any,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub mode: FunctionCallingMode,
    #[serde(default)]
    pub allowed_function_names: Vec<String>,
}

/// Per-request generation options
#[derive(Debug, Clone, Default)]
pub struct GenerateContentConfig {
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
    /// Passed through to the backend untouched
    pub thinking: Option<Value>,
    pub tools: Vec<FunctionDeclaration>,
    pub tool_config: Option<ToolConfig>,
    /// Cancels the in-flight HTTP request or stream
    pub abort_signal: Option<CancellationToken>,
}

impl GenerateContentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = stop;
        self
    }

    pub fn with_thinking(mut self, thinking: Value) -> Self {
        self.thinking = Some(thinking);
        self
    }

    pub fn with_tools(mut self, tools: Vec<FunctionDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_config(mut self, tool_config: ToolConfig) -> Self {
        self.tool_config = Some(tool_config);
        self
    }

    pub fn with_abort_signal(mut self, token: CancellationToken) -> Self {
        self.abort_signal = Some(token);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenerateContentRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub config: GenerateContentConfig,
}

impl GenerateContentRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            config: GenerateContentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GenerateContentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn abort_signal(&self) -> Option<&CancellationToken> {
        self.config.abort_signal.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct CountTokensRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub abort_signal: Option<CancellationToken>,
}

impl CountTokensRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            abort_signal: None,
        }
    }

    pub fn with_abort_signal(mut self, token: CancellationToken) -> Self {
        self.abort_signal = Some(token);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct EmbedContentRequest {
    pub model: String,
    pub contents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedContentResponse {
    pub embeddings: Vec<Vec<f32>>,
}
