//! Convert inbound requests of each dialect into a canonical upstream request.
//!
//! Handles system prompts, multi-part content (text, images), tool use, tool
//! results, and tool choice mapping. A single Anthropic message can expand into
//! several canonical messages (a user message with `tool_result` blocks becomes
//! separate `tool`-role messages). None of these functions fail: malformed but
//! parseable payloads are canonicalized on a best-effort basis.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::anthropic_types::{Message, MessagesRequest};
use super::canonical::{
    CanonicalContent, CanonicalMessage, ChatCompletionRequest, ContentPart, Role, StreamOptions,
    ToolCall, ToolDefinition,
};
use super::content::{block_type, extract_system_text, flatten_text, image_block_to_part, normalize, str_field};
use super::openai_types::{ChatMessage, ChatRequest};
use super::responses_types::ResponsesRequest;

/// Sampling values applied when the client leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDefaults {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u64 {
    4096
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request envelopes
// ---------------------------------------------------------------------------

/// OpenAI Chat Completions request to upstream request. `model` is the resolved upstream id.
pub fn chat_to_upstream(
    req: &ChatRequest,
    model: String,
    defaults: &RequestDefaults,
) -> ChatCompletionRequest {
    let tools = convert_openai_tools(&req.tools);
    let tool_choice = forward_tool_choice(&tools, req.tool_choice.clone());

    ChatCompletionRequest {
        model,
        messages: openai_to_canonical(&req.messages),
        temperature: req.temperature.unwrap_or(defaults.temperature),
        max_tokens: req.max_tokens.unwrap_or(defaults.max_tokens),
        stream: req.stream,
        stream_options: stream_options(req.stream),
        tools,
        tool_choice,
        top_p: req.top_p,
        stop: req.stop.clone(),
    }
}

/// Anthropic Messages request to upstream request.
pub fn anthropic_to_upstream(
    req: &MessagesRequest,
    model: String,
    defaults: &RequestDefaults,
) -> ChatCompletionRequest {
    let tools = convert_anthropic_tools(&req.tools);
    let tool_choice = forward_tool_choice(
        &tools,
        req.tool_choice.as_ref().and_then(convert_anthropic_tool_choice),
    );

    let stop = if req.stop_sequences.is_empty() {
        None
    } else {
        Some(json!(req.stop_sequences))
    };

    ChatCompletionRequest {
        model,
        messages: anthropic_to_canonical(&req.messages, req.system.as_ref()),
        temperature: req.temperature.unwrap_or(defaults.temperature),
        max_tokens: req
            .max_tokens
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_tokens),
        stream: req.stream,
        stream_options: stream_options(req.stream),
        tools,
        tool_choice,
        top_p: req.top_p,
        stop,
    }
}

/// OpenAI Responses request to upstream request.
pub fn responses_to_upstream(
    req: &ResponsesRequest,
    model: String,
    defaults: &RequestDefaults,
) -> ChatCompletionRequest {
    let tools = convert_responses_tools(&req.tools);
    let tool_choice = forward_tool_choice(
        &tools,
        req.tool_choice.as_ref().map(convert_responses_tool_choice),
    );

    ChatCompletionRequest {
        model,
        messages: responses_input_to_canonical(req.input.as_ref(), req.instructions.as_deref()),
        temperature: req.temperature.unwrap_or(defaults.temperature),
        max_tokens: req.max_output_tokens.unwrap_or(defaults.max_tokens),
        stream: req.stream,
        stream_options: stream_options(req.stream),
        tools,
        tool_choice,
        top_p: req.top_p,
        stop: None,
    }
}

fn stream_options(stream: bool) -> Option<StreamOptions> {
    stream.then_some(StreamOptions {
        include_usage: true,
    })
}

/// Upstream rejects `tool_choice` without tools, so it only rides along with them.
fn forward_tool_choice(tools: &[ToolDefinition], choice: Option<Value>) -> Option<Value> {
    if tools.is_empty() {
        None
    } else {
        choice
    }
}

// ---------------------------------------------------------------------------
// OpenAI Chat
// ---------------------------------------------------------------------------

pub fn openai_to_canonical(messages: &[ChatMessage]) -> Vec<CanonicalMessage> {
    messages
        .iter()
        .map(|msg| CanonicalMessage {
            role: Role::from(msg.role.as_str()),
            content: msg.content.as_ref().map(openai_content),
            tool_calls: msg
                .tool_calls
                .as_ref()
                .map(openai_tool_calls)
                .unwrap_or_default(),
            tool_call_id: msg.tool_call_id.as_ref().and_then(scalar_to_string),
        })
        .collect()
}

fn openai_content(content: &Value) -> CanonicalContent {
    match content {
        Value::String(text) => CanonicalContent::Text(text.clone()),
        Value::Array(_) => normalize(content),
        other => CanonicalContent::Text(other.to_string()),
    }
}

fn openai_tool_calls(value: &Value) -> Vec<ToolCall> {
    let Some(calls) = value.as_array() else {
        tracing::debug!("Ignoring non-array tool_calls");
        return Vec::new();
    };

    calls
        .iter()
        .filter_map(Value::as_object)
        .map(|call| {
            let function = call.get("function").and_then(Value::as_object);
            let arguments = match function.and_then(|f| f.get("arguments")) {
                Some(Value::String(args)) if !args.is_empty() => args.clone(),
                Some(obj @ Value::Object(_)) => obj.to_string(),
                _ => "{}".to_string(),
            };
            ToolCall {
                id: non_empty_str(call.get("id")).unwrap_or_else(|| fresh_id("call")),
                name: function
                    .map(|f| str_field(f, "name"))
                    .unwrap_or_default(),
                arguments,
            }
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Anthropic Messages
// ---------------------------------------------------------------------------

/// Translate Anthropic messages (plus the optional top-level `system`) into canonical messages.
pub fn anthropic_to_canonical(messages: &[Message], system: Option<&Value>) -> Vec<CanonicalMessage> {
    let mut result = Vec::with_capacity(messages.len() + 1);

    let system_text = extract_system_text(system);
    if !system_text.is_empty() {
        result.push(CanonicalMessage::new(Role::System, system_text));
    }

    for msg in messages {
        let role = Role::from(msg.role.as_str());
        match &msg.content {
            Value::String(text) => result.push(CanonicalMessage::new(role, text.as_str())),
            Value::Array(blocks) => translate_blocks(role, blocks, &mut result),
            // Any other shape, `null` included, travels as its JSON text
            other => result.push(CanonicalMessage::new(role, other.to_string())),
        }
    }

    result
}

/// Blocks of one Anthropic message, partitioned by kind.
#[derive(Default)]
struct PartitionedBlocks {
    parts: Vec<ContentPart>,
    tool_calls: Vec<ToolCall>,
    tool_results: Vec<CanonicalMessage>,
}

fn partition_blocks(blocks: &[Value]) -> PartitionedBlocks {
    let mut out = PartitionedBlocks::default();

    for block in blocks.iter().filter_map(Value::as_object) {
        match block_type(block) {
            "text" => out.parts.push(ContentPart::text(str_field(block, "text"))),
            "image" => out.parts.extend(image_block_to_part(block)),
            "tool_use" => out.tool_calls.push(tool_use_to_call(block)),
            "tool_result" => {
                let content = flatten_text(block.get("content").unwrap_or(&Value::Null));
                out.tool_results
                    .push(CanonicalMessage::tool_result(str_field(block, "tool_use_id"), content));
            }
            other => tracing::debug!(block_type = other, "Skipping unsupported content block"),
        }
    }

    out
}

fn translate_blocks(role: Role, blocks: &[Value], out: &mut Vec<CanonicalMessage>) {
    let PartitionedBlocks {
        parts,
        tool_calls,
        tool_results,
    } = partition_blocks(blocks);

    match role {
        Role::Assistant => out.push(CanonicalMessage {
            role,
            content: (!parts.is_empty()).then(|| CanonicalContent::from_parts(parts)),
            tool_calls,
            tool_call_id: None,
        }),
        Role::User => {
            out.extend(tool_results);
            if !parts.is_empty() {
                out.push(CanonicalMessage::new(role, CanonicalContent::from_parts(parts)));
            }
        }
        _ => {
            if !parts.is_empty() {
                out.push(CanonicalMessage::new(role, CanonicalContent::from_parts(parts)));
            }
        }
    }
}

fn tool_use_to_call(block: &Map<String, Value>) -> ToolCall {
    let arguments = match block.get("input") {
        Some(input @ Value::Object(_)) => input.to_string(),
        _ => "{}".to_string(),
    };
    ToolCall {
        id: non_empty_str(block.get("id")).unwrap_or_else(|| fresh_id("toolu")),
        name: str_field(block, "name"),
        arguments,
    }
}

/// Anthropic tool definitions. Entries without a name are dropped.
pub fn convert_anthropic_tools(tools: &[Value]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|tool| {
            let name = non_empty_str(tool.get("name"))?;
            Some(ToolDefinition {
                name,
                description: str_field(tool, "description"),
                parameters: schema_or_default(tool.get("input_schema")),
            })
        })
        .collect()
}

/// Map Anthropic `tool_choice` onto the chat-completions vocabulary.
pub fn convert_anthropic_tool_choice(choice: &Value) -> Option<Value> {
    let choice = choice.as_object()?;
    match block_type(choice) {
        "auto" => Some(json!("auto")),
        "any" => Some(json!("required")),
        "none" => Some(json!("none")),
        "tool" => {
            let name = non_empty_str(choice.get("name"))?;
            Some(json!({"type": "function", "function": {"name": name}}))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// OpenAI tools (Chat and Responses)
// ---------------------------------------------------------------------------

/// Chat-style tools: only `{type: "function", function: {...}}` entries with a name survive.
pub fn convert_openai_tools(tools: &[Value]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .filter_map(Value::as_object)
        .filter(|tool| block_type(tool) == "function")
        .filter_map(|tool| tool.get("function").and_then(Value::as_object))
        .filter_map(function_definition)
        .collect()
}

/// Responses tools accept both the nested chat form and the flat
/// `{type: "function", name, parameters}` form.
pub fn convert_responses_tools(tools: &[Value]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .filter_map(Value::as_object)
        .filter(|tool| block_type(tool) == "function")
        .filter_map(|tool| match tool.get("function").and_then(Value::as_object) {
            Some(nested) => function_definition(nested),
            None => function_definition(tool),
        })
        .collect()
}

fn function_definition(function: &Map<String, Value>) -> Option<ToolDefinition> {
    let name = non_empty_str(function.get("name"))?;
    Some(ToolDefinition {
        name,
        description: str_field(function, "description"),
        parameters: schema_or_default(function.get("parameters")),
    })
}

fn convert_responses_tool_choice(choice: &Value) -> Value {
    match choice.as_object() {
        Some(obj) if block_type(obj) == "function" && !obj.contains_key("function") => {
            json!({"type": "function", "function": {"name": str_field(obj, "name")}})
        }
        _ => choice.clone(),
    }
}

fn schema_or_default(schema: Option<&Value>) -> Value {
    match schema {
        Some(schema @ Value::Object(_)) => schema.clone(),
        _ => json!({"type": "object", "properties": {}}),
    }
}

// ---------------------------------------------------------------------------
// OpenAI Responses input
// ---------------------------------------------------------------------------

/// Translate Responses `input` (and `instructions`) into canonical messages.
pub fn responses_input_to_canonical(
    input: Option<&Value>,
    instructions: Option<&str>,
) -> Vec<CanonicalMessage> {
    let mut messages = Vec::new();

    if let Some(instructions) = instructions.filter(|s| !s.is_empty()) {
        messages.push(CanonicalMessage::new(Role::System, instructions));
    }

    match input {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => messages.push(CanonicalMessage::new(Role::User, text.as_str())),
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::Object(obj) => messages.push(input_item_to_message(obj)),
                    Value::String(text) => {
                        messages.push(CanonicalMessage::new(Role::User, text.as_str()));
                    }
                    other => tracing::debug!(item = %other, "Skipping unsupported input item"),
                }
            }
        }
        Some(other) => messages.push(CanonicalMessage::new(Role::User, other.to_string())),
    }

    messages
}

fn input_item_to_message(item: &Map<String, Value>) -> CanonicalMessage {
    let role = non_empty_str(item.get("role")).unwrap_or_else(|| "user".to_string());
    let role = Role::from(role.as_str());

    match block_type(item) {
        "message" => CanonicalMessage::new(role, normalize(item.get("content").unwrap_or(&Value::Null))),
        "input_text" => CanonicalMessage::new(Role::User, str_field(item, "text")),
        "output_text" => CanonicalMessage::new(Role::Assistant, str_field(item, "text")),
        _ => {
            if let Some(content) = item.get("content") {
                CanonicalMessage::new(role, normalize(content))
            } else if let Some(text) = item.get("text").and_then(Value::as_str) {
                CanonicalMessage::new(role, text)
            } else {
                CanonicalMessage::new(role, Value::Object(item.clone()).to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn fresh_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
