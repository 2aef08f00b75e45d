//! Canonical message model.
//!
//! Every inbound dialect converges on these types, and they serialize
//! directly into the upstream chat-completions wire shape. A
//! [`ChatCompletionRequest`] is what the upstream transport receives.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::openai_types::ChatUsage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Roles we do not interpret (`developer`, `function`, ...) are forwarded untouched.
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Other(other) => other,
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Role::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }
}

impl CanonicalContent {
    /// Build content from parts, collapsing a lone text part to a bare string.
    pub fn from_parts(mut parts: Vec<ContentPart>) -> Self {
        if parts.len() == 1 && matches!(parts[0], ContentPart::Text { .. }) {
            if let Some(ContentPart::Text { text }) = parts.pop() {
                return CanonicalContent::Text(text);
            }
        }
        CanonicalContent::Parts(parts)
    }

    pub fn has_image(&self) -> bool {
        match self {
            CanonicalContent::Text(_) => false,
            CanonicalContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
        }
    }

    /// All text carried by this content, parts joined without separators.
    pub fn plain_text(&self) -> String {
        match self {
            CanonicalContent::Text(text) => text.clone(),
            CanonicalContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }
}

impl From<&str> for CanonicalContent {
    fn from(value: &str) -> Self {
        CanonicalContent::Text(value.to_string())
    }
}

impl From<String> for CanonicalContent {
    fn from(value: String) -> Self {
        CanonicalContent::Text(value)
    }
}

/// A function call requested by the model. `arguments` holds JSON object text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireToolCall", from = "WireToolCall")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl From<ToolCall> for WireToolCall {
    fn from(call: ToolCall) -> Self {
        WireToolCall {
            id: call.id,
            kind: function_kind(),
            function: WireFunctionCall {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        ToolCall {
            id: wire.id,
            name: wire.function.name,
            arguments: wire.function.arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireTool", from = "WireTool")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Serialize, Deserialize)]
struct WireTool {
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
}

impl From<ToolDefinition> for WireTool {
    fn from(tool: ToolDefinition) -> Self {
        WireTool {
            kind: function_kind(),
            function: WireFunction {
                name: tool.name,
                description: tool.description,
                parameters: tool.parameters,
            },
        }
    }
}

impl From<WireTool> for ToolDefinition {
    fn from(wire: WireTool) -> Self {
        ToolDefinition {
            name: wire.function.name,
            description: wire.function.description,
            parameters: wire.function.parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: Option<CanonicalContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl CanonicalMessage {
    pub fn new(role: Role, content: impl Into<CanonicalContent>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(CanonicalContent::Text(content.into())),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Token counters for one request. Streaming updates overwrite with the
/// latest upstream snapshot rather than summing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub accepted_prediction_tokens: u64,
    pub rejected_prediction_tokens: u64,
}

impl UsageCounters {
    pub fn from_usage(usage: Option<&ChatUsage>) -> Self {
        let mut counters = Self::default();
        if let Some(usage) = usage {
            counters.apply(usage);
        }
        counters
    }

    /// Overwrite every counter the snapshot reports; absent fields keep their value.
    pub fn apply(&mut self, usage: &ChatUsage) {
        if let Some(v) = usage.prompt_tokens {
            self.prompt_tokens = v;
        }
        if let Some(v) = usage.completion_tokens {
            self.completion_tokens = v;
        }
        if let Some(v) = usage.total_tokens {
            self.total_tokens = v;
        }
        if let Some(v) = usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
        {
            self.cached_tokens = v;
        }
        if let Some(details) = usage.completion_tokens_details.as_ref() {
            if let Some(v) = details.accepted_prediction_tokens {
                self.accepted_prediction_tokens = v;
            }
            if let Some(v) = details.rejected_prediction_tokens {
                self.rejected_prediction_tokens = v;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// The normalized request sent to the upstream provider.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
}

impl ChatCompletionRequest {
    /// Whether any message carries an image part.
    pub fn has_images(&self) -> bool {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .any(CanonicalContent::has_image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_wire_shape() {
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            arguments: "{\"q\":1}".to_string(),
        };
        let wire = serde_json::to_value(&call).unwrap();
        assert_eq!(
            wire,
            json!({"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":1}"}})
        );
    }

    #[test]
    fn test_tool_definition_wire_shape() {
        let tool = ToolDefinition {
            name: "search".to_string(),
            description: "web".to_string(),
            parameters: json!({"type": "object"}),
        };
        let wire = serde_json::to_value(&tool).unwrap();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "search");
        assert_eq!(wire["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_message_serialization_omits_empty_tool_fields() {
        let msg = CanonicalMessage::new(Role::User, "Hi");
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire, json!({"role": "user", "content": "Hi"}));

        let tool = CanonicalMessage::tool_result("call_9", "42");
        let wire = serde_json::to_value(&tool).unwrap();
        assert_eq!(
            wire,
            json!({"role": "tool", "content": "42", "tool_call_id": "call_9"})
        );
    }

    #[test]
    fn test_unknown_role_round_trips() {
        let role: Role = serde_json::from_value(json!("developer")).unwrap();
        assert_eq!(role, Role::Other("developer".to_string()));
        assert_eq!(serde_json::to_value(&role).unwrap(), json!("developer"));
    }

    #[test]
    fn test_from_parts_collapses_single_text() {
        let content = CanonicalContent::from_parts(vec![ContentPart::text("")]);
        assert_eq!(content, CanonicalContent::Text(String::new()));

        let content = CanonicalContent::from_parts(vec![ContentPart::image("data:x")]);
        assert!(content.has_image());
    }

    #[test]
    fn test_usage_snapshot_overwrites_present_fields_only() {
        let mut usage = UsageCounters::default();
        let first: ChatUsage = serde_json::from_value(json!({
            "prompt_tokens": 10,
            "completion_tokens": 2,
            "prompt_tokens_details": {"cached_tokens": 4}
        }))
        .unwrap();
        usage.apply(&first);

        let second: ChatUsage =
            serde_json::from_value(json!({"completion_tokens": 7})).unwrap();
        usage.apply(&second);

        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.cached_tokens, 4);
    }
}
