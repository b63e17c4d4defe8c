//! # Tool contract
//!
//! The scheduler knows a tool only as a name, a description, a parameter
//! schema and an async `execute(args, abort)` callable. This module provides
//! that contract ([`Tool`]), a fluent builder ([`tool()`]) and a
//! [`ToolRegistry`] the scheduler looks tools up in.
//!
//! ## Schema formats
//!
//! Tools accept three schema notations, all normalised to JSON Schema:
//!
//! - **Simple notation**: `{"path": "string", "limit": "integer"}`
//! - **Extended properties**: `{"limit": {"type": "integer", "optional": true}}`
//! - **Full JSON Schema**: anything with `"type"` and `"properties"` passes through
//!
//! Arguments proposed by the model are checked against the normalised schema
//! with [`Tool::validate`] before any policy or confirmation step.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use turnwise::{tool, Error};
//! use serde_json::json;
//!
//! let read_file = tool("read_file", "Read a file from the workspace")
//!     .param("path", "string")
//!     .build(|args, _abort| async move {
//!         let path = args["path"]
//!             .as_str()
//!             .ok_or_else(|| Error::tool("path must be a string"))?;
//!         Ok(json!({"path": path, "content": ""}))
//!     });
//! ```

use crate::types::FunctionDeclaration;
use crate::{Error, Result};
use jsonschema::JSONSchema;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Type alias for tool handler functions.
///
/// ```text
/// Arc<
///   dyn Fn(Value, CancellationToken)
///     -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
///     + Send + Sync>
/// ```
///
/// The token is the owning turn's abort token. Long-running handlers should
/// watch it; the scheduler also stops awaiting the handler once it fires.
pub type ToolHandler = Arc<
    dyn Fn(Value, CancellationToken) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// A tool the model may call.
///
/// Cloning is cheap: the handler and the compiled validator are shared.
#[derive(Clone)]
pub struct Tool {
    name: String,

    /// Sent to the model; it decides when to call the tool from this text.
    description: String,

    /// Normalised JSON Schema for the arguments object
    input_schema: Value,

    /// Compiled form of `input_schema`, or the reason it did not compile
    validator: std::result::Result<Arc<JSONSchema>, String>,

    handler: ToolHandler,
}

impl Tool {
    /// Create a tool from a schema in any of the supported notations.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use turnwise::Tool;
    /// use serde_json::json;
    ///
    /// let search = Tool::new(
    ///     "grep",
    ///     "Search files for a pattern",
    ///     json!({
    ///         "pattern": {"type": "string", "description": "Regex to look for"},
    ///         "max_results": {"type": "integer", "optional": true, "default": 50}
    ///     }),
    ///     |args, _abort| async move { Ok(json!({"matches": [], "query": args["pattern"]})) },
    /// );
    /// ```
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let input_schema = normalize_schema(input_schema);
        let validator = JSONSchema::compile(&input_schema)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        if let Err(reason) = &validator {
            log::warn!("Schema for tool '{}' does not compile: {}", name, reason);
        }

        Self {
            name,
            description: description.into(),
            input_schema,
            validator,
            handler: Arc::new(move |args, abort| Box::pin(handler(args, abort))),
        }
    }

    /// Checks `arguments` against the parameter schema.
    ///
    /// The error lists every failing instance path, e.g.
    /// `"/limit: \"ten\" is not of type \"integer\""`.
    pub fn validate(&self, arguments: &Value) -> Result<()> {
        let validator = self.validator.as_ref().map_err(|reason| {
            Error::validation(format!("tool '{}' has an invalid schema: {}", self.name, reason))
        })?;

        if let Err(errors) = validator.validate(arguments) {
            let details: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    let path = if path.is_empty() { "/".to_string() } else { path };
                    format!("{}: {}", path, e)
                })
                .collect();
            return Err(Error::validation(details.join("; ")));
        }
        Ok(())
    }

    /// Runs the handler.
    pub async fn execute(&self, arguments: Value, abort: CancellationToken) -> Result<Value> {
        (self.handler)(arguments, abort).await
    }

    /// Declaration sent to the model with each request.
    pub fn to_declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Normalise the supported schema notations to JSON Schema.
///
/// A property is required unless it is marked `"optional": true`,
/// `"required": false`, or carries a `"default"`; `"required": true` always
/// wins. The per-property `optional`/`required` flags are stripped.
fn normalize_schema(schema: Value) -> Value {
    let Value::Object(obj) = schema else {
        return json!({"type": "object", "properties": {}, "required": []});
    };
    if obj.contains_key("type") && obj.contains_key("properties") {
        return Value::Object(obj);
    }

    let mut properties = Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        match param_type {
            Value::String(type_str) => {
                properties.insert(param_name.clone(), type_to_json_schema(&type_str));
                required.push(param_name);
            }
            Value::Object(mut prop) => {
                let is_optional = prop
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let is_required = prop.remove("required").and_then(|v| v.as_bool());
                let has_default = prop.contains_key("default");

                properties.insert(param_name.clone(), Value::Object(prop));

                let required_here = match is_required {
                    Some(explicit) => explicit,
                    None => !is_optional && !has_default,
                };
                if required_here {
                    required.push(param_name);
                }
            }
            // Anything else carries no type information
            _ => {}
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// Maps friendly type names to a JSON Schema type; unknown names become `"string"`.
fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    json!({ "type": json_type })
}

/// Fluent builder for [`Tool`].
///
/// Use either `.param()` for simple required parameters or `.schema()` for
/// anything richer; `.schema()` replaces earlier params.
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Map<String, Value>,
    full_schema: Option<Value>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: Map::new(),
            full_schema: None,
        }
    }

    /// Sets the complete schema, in any supported notation.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema.clear();
        self.full_schema = Some(schema);
        self
    }

    /// Adds a required parameter in simple notation.
    ///
    /// A non-object schema set earlier is discarded.
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if let Some(Value::Object(existing)) = self.full_schema.take() {
            self.schema = existing;
        }
        self.schema
            .insert(name.to_string(), Value::String(type_str.to_string()));
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let schema = self
            .full_schema
            .unwrap_or_else(|| Value::Object(self.schema));
        Tool::new(self.name, self.description, schema, handler)
    }
}

/// Start building a tool.
///
/// ```rust,no_run
/// use turnwise::tool;
/// use serde_json::json;
///
/// let echo = tool("echo", "Echo back the input")
///     .param("message", "string")
///     .build(|args, _abort| async move { Ok(args) });
/// ```
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}

/// Tools available to a conversation, kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Tool) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            log::warn!("Tool '{}' registered twice; keeping the newer one", name);
        } else {
            self.order.push(name);
        }
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Looks a tool up, failing with the error reported back to the model.
    pub fn require(&self, name: &str) -> Result<&Tool> {
        self.get(name)
            .ok_or_else(|| Error::tool(format!("Tool '{}' not found", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(Tool::to_declaration)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl FromIterator<Tool> for ToolRegistry {
    fn from_iter<I: IntoIterator<Item = Tool>>(iter: I) -> Self {
        let mut registry = Self::new();
        for tool in iter {
            registry.register(tool);
        }
        registry
    }
}
