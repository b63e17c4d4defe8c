//! Chat-completions wire format
//!
//! Request/response shapes of the OpenAI-style `/chat/completions` protocol and
//! the translation between them and the message model in `types.rs`. Everything
//! in this module is pure: no I/O, so marshalling and mapping rules are tested
//! directly.

use crate::types::{
    Candidate, Content, FinishReason, FunctionCall, FunctionCallingMode, FunctionDeclaration,
    GenerateContentRequest, GenerateContentResponse, Part, Role, ToolConfig, UsageMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// `content` / `reasoning_content` arrive either as a plain string or as an
/// array of typed items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Items(Vec<WireContentItem>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireContentItem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl WireContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: Some("text".to_string()),
            text: Some(text.into()),
            content: None,
        }
    }

    fn value(&self) -> Option<&str> {
        self.text.as_deref().or(self.content.as_deref())
    }
}

/// Flattens either content shape into its non-empty items, in order.
pub fn normalize_content(content: &WireContent) -> Vec<WireContentItem> {
    match content {
        WireContent::Text(text) if text.is_empty() => Vec::new(),
        WireContent::Text(text) => vec![WireContentItem::text(text.clone())],
        WireContent::Items(items) => items
            .iter()
            .filter(|item| item.value().is_some_and(|v| !v.is_empty()))
            .cloned()
            .collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<WireFunction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<WireContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<WireContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatResponseMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Non-streaming response body, also the shape the aggregator renders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<WireFunction>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<WireContent>,
    #[serde(default)]
    pub reasoning_content: Option<WireContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One SSE payload of a streaming response
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

// ============================================================================
// REQUEST MARSHALLING
// ============================================================================

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Model => "assistant",
        Role::System => "system",
        Role::User | Role::Tool => "user",
    }
}

/// Builds the request body for `POST /chat/completions`.
pub fn build_request_body(
    request: &GenerateContentRequest,
    user_prompt_id: &str,
    stream: bool,
) -> ChatCompletionRequest {
    let config = &request.config;

    let mut messages = Vec::new();
    if let Some(system) = config.system_instruction.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::plain("system", system));
    }
    messages.extend(convert_contents(&request.contents));

    let tools = convert_tools(&config.tools);
    let tool_choice = if tools.is_empty() {
        None
    } else {
        Some(convert_tool_choice(config.tool_config.as_ref()))
    };

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream,
        user: user_prompt_id.to_string(),
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        max_tokens: config.max_output_tokens,
        stop: (!config.stop_sequences.is_empty()).then(|| config.stop_sequences.clone()),
        thinking: config.thinking.clone(),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
    }
}

/// Maps message-model history onto the wire message array.
///
/// A function response's `tool_call_id` is its explicit id, else its tool
/// name, else the id of the most recent call still unanswered.
pub fn convert_contents(contents: &[Content]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    // (wire id, name) of calls not yet answered, oldest first
    let mut outstanding: Vec<(String, String)> = Vec::new();

    for content in contents {
        let text: String = content
            .parts
            .iter()
            .filter_map(Part::as_text)
            .filter(|t| !t.thought && !t.text.trim().is_empty())
            .map(|t| t.text.as_str())
            .collect();
        if !text.is_empty() {
            messages.push(ChatMessage::plain(wire_role(content.role), text));
        }

        let calls: Vec<&FunctionCall> = content.function_calls().collect();
        if !calls.is_empty() {
            let tool_calls = calls
                .iter()
                .enumerate()
                .map(|(position, call)| {
                    let id = call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("{}-{}", call.name, position));
                    outstanding.push((id.clone(), call.name.clone()));
                    WireToolCall {
                        id: Some(id),
                        kind: Some("function".to_string()),
                        function: Some(WireFunction {
                            name: Some(call.name.clone()),
                            arguments: Some(stringify_arguments(call.args.as_ref())),
                        }),
                    }
                })
                .collect();
            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: String::new(),
                tool_calls: Some(tool_calls),
                tool_call_id: None,
                name: None,
            });
        }

        for response in content.parts.iter().filter_map(Part::as_function_response) {
            let tool_call_id = match &response.id {
                Some(id) => {
                    outstanding.retain(|(pending, _)| pending != id);
                    Some(id.clone())
                }
                None => take_outstanding(&mut outstanding, &response.name),
            };
            messages.push(ChatMessage {
                role: "tool".to_string(),
                content: Value::Object(response.response.clone()).to_string(),
                tool_calls: None,
                tool_call_id,
                name: Some(response.name.clone()),
            });
        }
    }

    messages
}

fn take_outstanding(outstanding: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    if !name.is_empty() {
        // The name answers the latest call of that name; it stays the wire id
        if let Some(pos) = outstanding.iter().rposition(|(_, n)| n == name) {
            outstanding.remove(pos);
        }
        return Some(name.to_string());
    }
    outstanding.pop().map(|(id, _)| id)
}

fn stringify_arguments(args: Option<&Map<String, Value>>) -> String {
    match args {
        Some(map) => Value::Object(map.clone()).to_string(),
        None => "{}".to_string(),
    }
}

pub fn convert_tools(declarations: &[FunctionDeclaration]) -> Vec<ToolDefinition> {
    declarations
        .iter()
        .map(|decl| ToolDefinition {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: decl.name.clone(),
                description: decl.description.clone(),
                parameters: decl.parameters.clone(),
            },
        })
        .collect()
}

pub fn convert_tool_choice(tool_config: Option<&ToolConfig>) -> Value {
    match tool_config {
        Some(cfg) if cfg.mode == FunctionCallingMode::None => Value::String("none".to_string()),
        Some(cfg) if cfg.allowed_function_names.len() == 1 => serde_json::json!({
            "type": "function",
            "function": { "name": cfg.allowed_function_names[0] }
        }),
        _ => Value::String("auto".to_string()),
    }
}

// ============================================================================
// RESPONSE MAPPING
// ============================================================================

/// Wire finish reason to the internal vocabulary. Unknown or absent values map to `None`.
pub fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason? {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::MaxTokens),
        "content_filter" => Some(FinishReason::Safety),
        "tool_calls" => Some(FinishReason::FinishReasonUnspecified),
        _ => None,
    }
}

/// Parses tool-call argument text; only a JSON object counts.
pub fn parse_arguments(arguments: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn map_usage(usage: &WireUsage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens,
        tool_use_prompt_token_count: usage.tool_prompt_tokens,
        thoughts_token_count: usage.thoughts_tokens,
    }
}

fn content_parts(content: Option<&WireContent>, thought: bool) -> impl Iterator<Item = Part> {
    content
        .map(normalize_content)
        .unwrap_or_default()
        .into_iter()
        .filter_map(move |item| {
            item.value().map(|text| {
                if thought {
                    Part::thought(text)
                } else {
                    Part::text(text)
                }
            })
        })
}

/// Builds candidate content: text, then reasoning, then tool calls.
///
/// Never returns an empty part list.
fn build_candidate_content(message: Option<&ChatResponseMessage>) -> Content {
    let mut parts = Vec::new();

    if let Some(message) = message {
        parts.extend(content_parts(message.content.as_ref(), false));
        parts.extend(content_parts(message.reasoning_content.as_ref(), true));

        for call in message.tool_calls.iter().flatten() {
            if call.kind.as_deref().is_some_and(|k| k != "function") {
                continue;
            }
            let function = call.function.clone().unwrap_or_default();
            parts.push(Part::FunctionCall(FunctionCall {
                id: call.id.clone().filter(|id| !id.is_empty()),
                name: function.name.unwrap_or_default(),
                args: function
                    .arguments
                    .as_deref()
                    .filter(|a| !a.is_empty())
                    .and_then(parse_arguments),
            }));
        }
    }

    if parts.is_empty() {
        parts.push(Part::text(""));
    }

    Content::model(parts)
}

/// Maps a (complete or aggregated) chat-completions payload to the message model.
pub fn to_generate_content_response(
    payload: &ChatCompletionResponse,
    requested_model: &str,
) -> GenerateContentResponse {
    let candidates = payload
        .choices
        .iter()
        .map(|choice| Candidate {
            index: choice.index,
            content: build_candidate_content(choice.message.as_ref()),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
        })
        .collect();

    GenerateContentResponse {
        response_id: payload.id.clone(),
        model_version: Some(
            payload
                .model
                .clone()
                .unwrap_or_else(|| requested_model.to_string()),
        ),
        candidates,
        usage_metadata: payload.usage.as_ref().map(map_usage),
    }
}

/// Extracts a human-readable message from an error body.
pub fn extract_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FunctionResponse, GenerateContentConfig};
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_finish_reason_table() {
        assert_eq!(map_finish_reason(Some("stop")), Some(FinishReason::Stop));
        assert_eq!(map_finish_reason(Some("length")), Some(FinishReason::MaxTokens));
        assert_eq!(map_finish_reason(Some("content_filter")), Some(FinishReason::Safety));
        assert_eq!(
            map_finish_reason(Some("tool_calls")),
            Some(FinishReason::FinishReasonUnspecified)
        );
        assert_eq!(map_finish_reason(Some("unknown-value")), None);
        assert_eq!(map_finish_reason(None), None);
    }

    #[test]
    fn test_system_instruction_leads() {
        let request = GenerateContentRequest::new("glm-4.6", vec![Content::user("Hi")])
            .with_config(GenerateContentConfig::new().with_system_instruction("Be brief"));
        let body = build_request_body(&request, "prompt-1", false);

        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0], ChatMessage::plain("system", "Be brief"));
        assert_eq!(body.messages[1], ChatMessage::plain("user", "Hi"));
        assert_eq!(body.user, "prompt-1");
        assert!(!body.stream);
    }

    #[test]
    fn test_text_parts_concatenate_in_order() {
        let contents = vec![Content::model(vec![
            Part::text("Hello, "),
            Part::thought("internal"),
            Part::text("   "),
            Part::text("world"),
        ])];
        let messages = convert_contents(&contents);
        assert_eq!(messages, vec![ChatMessage::plain("assistant", "Hello, world")]);
    }

    #[test]
    fn test_function_calls_become_one_assistant_message() {
        let contents = vec![Content::model(vec![
            Part::FunctionCall(FunctionCall::new(
                Some("call_a".into()),
                "read_file",
                args(json!({"path": "a.txt"})),
            )),
            Part::FunctionCall(FunctionCall {
                id: None,
                name: "list_dir".into(),
                args: None,
            }),
        ])];
        let messages = convert_contents(&contents);
        assert_eq!(messages.len(), 1);

        let calls = messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_deref(), Some("call_a"));
        assert_eq!(
            calls[0].function.as_ref().unwrap().arguments.as_deref(),
            Some(r#"{"path":"a.txt"}"#)
        );
        assert_eq!(calls[1].id.as_deref(), Some("list_dir-1"));
        assert_eq!(calls[1].function.as_ref().unwrap().arguments.as_deref(), Some("{}"));
    }

    fn tool_call_ids(contents: &[Content]) -> Vec<Option<String>> {
        convert_contents(contents)
            .into_iter()
            .filter(|m| m.role == "tool")
            .map(|m| m.tool_call_id)
            .collect()
    }

    #[test]
    fn test_tool_call_id_fallback_chain() {
        let calls = || {
            Content::model(vec![
                Part::FunctionCall(FunctionCall::new(Some("call_abc".into()), "beta", Map::new())),
                Part::FunctionCall(FunctionCall::new(Some("call_def".into()), "gamma", Map::new())),
            ])
        };
        // (response id, response name, expected tool_call_id)
        let cases = [
            (Some("call_def"), "beta", "call_def"),
            (None, "beta", "beta"),
            (None, "unknown", "unknown"),
            (None, "", "call_def"),
        ];

        for (id, name, expected) in cases {
            let contents = vec![
                calls(),
                Content::tool_responses(vec![FunctionResponse::success(
                    id.map(String::from),
                    name,
                    json!({"ok": true}),
                )]),
            ];
            assert_eq!(
                tool_call_ids(&contents),
                vec![Some(expected.to_string())],
                "id={id:?} name={name:?}"
            );
        }
    }

    #[test]
    fn test_tool_call_id_chain_across_a_batch() {
        let contents = vec![
            Content::model(vec![
                Part::FunctionCall(FunctionCall::new(Some("id-1".into()), "alpha", Map::new())),
                Part::FunctionCall(FunctionCall::new(Some("id-2".into()), "beta", Map::new())),
                Part::FunctionCall(FunctionCall::new(Some("id-3".into()), "gamma", Map::new())),
            ]),
            Content::tool_responses(vec![
                FunctionResponse::success(Some("id-1".into()), "alpha", json!({"ok": 1})),
                FunctionResponse::success(None, "beta", json!({"ok": 2})),
                FunctionResponse::success(None, "", json!({"ok": 3})),
                FunctionResponse::success(None, "", json!({"ok": 4})),
            ]),
        ];

        // The nameless responses take the unanswered calls, newest first
        assert_eq!(
            tool_call_ids(&contents),
            vec![
                Some("id-1".to_string()),
                Some("beta".to_string()),
                Some("id-3".to_string()),
                None,
            ]
        );
        assert_eq!(convert_contents(&contents)[1].content, r#"{"ok":1}"#);
    }

    #[test]
    fn test_tools_and_tool_choice() {
        let decl = FunctionDeclaration {
            name: "write_file".into(),
            description: "Write a file".into(),
            parameters: json!({"type": "object", "properties": {}}),
        };
        let request = GenerateContentRequest::new("m", vec![Content::user("x")]).with_config(
            GenerateContentConfig::new()
                .with_tools(vec![decl.clone()])
                .with_tool_config(ToolConfig {
                    mode: FunctionCallingMode::Any,
                    allowed_function_names: vec!["write_file".into()],
                }),
        );
        let body = serde_json::to_value(build_request_body(&request, "p", true)).unwrap();

        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "write_file");
        assert_eq!(
            body["tool_choice"],
            json!({"type": "function", "function": {"name": "write_file"}})
        );
        assert_eq!(body["stream"], true);

        assert_eq!(convert_tool_choice(None), json!("auto"));
        assert_eq!(
            convert_tool_choice(Some(&ToolConfig {
                mode: FunctionCallingMode::None,
                allowed_function_names: vec![],
            })),
            json!("none")
        );
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let request = GenerateContentRequest::new("m", vec![Content::user("x")]);
        let body = serde_json::to_value(build_request_body(&request, "p", false)).unwrap();
        let obj = body.as_object().unwrap();
        for key in ["temperature", "top_p", "top_k", "max_tokens", "stop", "thinking", "tools", "tool_choice"] {
            assert!(!obj.contains_key(key), "{key} should be omitted");
        }
    }

    #[test]
    fn test_generation_options_are_mapped() {
        let request = GenerateContentRequest::new("m", vec![Content::user("x")]).with_config(
            GenerateContentConfig::new()
                .with_temperature(0.5)
                .with_top_k(40)
                .with_max_output_tokens(256)
                .with_stop_sequences(vec!["END".into()])
                .with_thinking(json!({"type": "enabled"})),
        );
        let body = serde_json::to_value(build_request_body(&request, "p", false)).unwrap();
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop"], json!(["END"]));
        assert_eq!(body["thinking"], json!({"type": "enabled"}));
    }

    #[test]
    fn test_non_streaming_mapping() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "glm-4.6",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello from GLM-4.6!",
                    "reasoning_content": [{"type": "text", "text": "thinking"}]
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        }))
        .unwrap();

        let response = to_generate_content_response(&payload, "requested");
        assert_eq!(response.response_id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(response.model_version.as_deref(), Some("glm-4.6"));

        let candidate = &response.candidates[0];
        assert_eq!(candidate.content.role, Role::Model);
        assert_eq!(candidate.content.parts[0], Part::text("Hello from GLM-4.6!"));
        assert_eq!(candidate.content.parts[1], Part::thought("thinking"));
        assert_eq!(candidate.finish_reason, Some(FinishReason::Stop));

        let usage = response.usage_metadata.unwrap();
        assert_eq!(usage.total_token_count, Some(8));
        assert_eq!(usage.thoughts_token_count, None);
    }

    #[test]
    fn test_tool_call_mapping_tolerates_bad_arguments() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "c1", "type": "function",
                         "function": {"name": "write_file", "arguments": "{\"path\":\"/tmp/file\",\"content\":\"Hello\"}"}},
                        {"id": "c2", "type": "function",
                         "function": {"name": "broken", "arguments": "{not json"}},
                        {"id": "c3", "type": "retrieval", "function": {"name": "skip"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();

        let response = to_generate_content_response(&payload, "glm-4.6");
        assert_eq!(response.model_version.as_deref(), Some("glm-4.6"));

        let calls = response.function_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(
            calls[0].args,
            Some(args(json!({"path": "/tmp/file", "content": "Hello"})))
        );
        assert_eq!(calls[1].name, "broken");
        assert_eq!(calls[1].args, None);
        assert_eq!(
            response.finish_reason(),
            Some(FinishReason::FinishReasonUnspecified)
        );
    }

    #[test]
    fn test_empty_message_yields_single_empty_text_part() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": ""}}]
        }))
        .unwrap();
        let response = to_generate_content_response(&payload, "m");
        assert_eq!(response.candidates[0].content.parts, vec![Part::text("")]);
        assert_eq!(response.candidates[0].finish_reason, None);
    }

    #[test]
    fn test_array_content_items() {
        let content = WireContent::Items(vec![
            WireContentItem::text("a"),
            WireContentItem::text(""),
            WireContentItem {
                kind: None,
                text: None,
                content: Some("b".into()),
            },
        ]);
        let items = normalize_content(&content);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].content.as_deref(), Some("b"));
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"Invalid API key"}}"#).as_deref(),
            Some("Invalid API key")
        );
        assert_eq!(extract_error_message("plain text"), None);
        assert_eq!(extract_error_message(r#"{"error":"x"}"#), None);
    }
}
