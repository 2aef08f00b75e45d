use serde_json::{Map, Value};

use super::anthropic_types::{
    ErrorResponse, MessagesResponse, ResponseContentBlock, StopReason, Usage,
};
use super::canonical::UsageCounters;
use super::openai_types::{ChatCompletionResponse, ChatErrorResponse, ChatUsage};
use super::responses_types::{
    InputTokensDetails, OutputItem, OutputTokensDetails, ResponsesUsage,
};

/// Translate an upstream chat completion into an Anthropic Messages response.
/// `original_model` is the model name the client asked for.
pub fn to_anthropic_message(resp: &ChatCompletionResponse, original_model: &str) -> MessagesResponse {
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;

    if let Some(message) = resp.first_message() {
        if let Some(text) = message.text() {
            content.push(ResponseContentBlock::Text {
                text: text.to_string(),
            });
        }

        for call in &message.tool_calls {
            content.push(ResponseContentBlock::ToolUse {
                id: call
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                name: call.function.name.clone().unwrap_or_default(),
                input: parse_arguments(call.function.arguments.as_deref()),
            });
        }

        if !message.tool_calls.is_empty() {
            stop_reason = StopReason::ToolUse;
        }
    }

    let stop_reason = map_finish_reason(resp.finish_reason(), stop_reason);
    let usage = UsageCounters::from_usage(resp.usage.as_ref());

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: Some(0),
            cache_read_input_tokens: Some(usage.cached_tokens),
        },
    }
}

/// Tool-call arguments as a JSON object; unparsable or non-object text yields `{}`.
fn parse_arguments(arguments: Option<&str>) -> Value {
    match arguments.map(serde_json::from_str::<Value>) {
        Some(Ok(obj @ Value::Object(_))) => obj,
        _ => Value::Object(Map::new()),
    }
}

/// Map an upstream `finish_reason` onto the current stop reason.
///
/// `tool_use` always wins. Only `stop` and `length` are translated; any other
/// finish reason keeps `current`.
pub fn map_finish_reason(finish_reason: Option<&str>, current: StopReason) -> StopReason {
    match (current, finish_reason) {
        (StopReason::ToolUse, _) => StopReason::ToolUse,
        (_, Some("stop")) => StopReason::EndTurn,
        (_, Some("length")) => StopReason::MaxTokens,
        (current, _) => current,
    }
}

/// Translate an upstream chat completion into a Responses `output` array.
pub fn to_responses_output(resp: &ChatCompletionResponse) -> Vec<OutputItem> {
    let mut output = Vec::new();
    let Some(message) = resp.first_message() else {
        return output;
    };

    if let Some(text) = message.text() {
        output.push(OutputItem::assistant_text(text));
    }

    for call in &message.tool_calls {
        output.push(OutputItem::FunctionCall {
            id: call
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("fc_{}", uuid::Uuid::new_v4().simple())),
            name: call.function.name.clone().unwrap_or_default(),
            arguments: call
                .function
                .arguments
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "{}".to_string()),
        });
    }

    output
}

/// Responses usage block. Missing fields, or a missing `usage`, read as zero.
pub fn extract_responses_usage(usage: Option<&ChatUsage>) -> ResponsesUsage {
    let counters = UsageCounters::from_usage(usage);
    ResponsesUsage {
        input_tokens: counters.prompt_tokens,
        output_tokens: counters.completion_tokens,
        total_tokens: counters.total_tokens,
        input_tokens_details: InputTokensDetails {
            cached_tokens: counters.cached_tokens,
        },
        output_tokens_details: Some(OutputTokensDetails {
            accepted_prediction_tokens: counters.accepted_prediction_tokens,
            rejected_prediction_tokens: counters.rejected_prediction_tokens,
        }),
    }
}

/// Fill `id` and `created` when upstream left them out and mark the object type.
pub fn finalize_chat_completion(doc: &mut Value, fallback_id: &str, created: i64) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };

    let missing = |v: Option<&Value>| match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        Some(_) => false,
    };

    if missing(obj.get("id")) {
        obj.insert("id".to_string(), Value::from(fallback_id));
    }
    if missing(obj.get("created")) {
        obj.insert("created".to_string(), Value::from(created));
    }
    obj.insert("object".to_string(), Value::from("chat.completion"));
}

/// Translate an OpenAI-style error document into an Anthropic error response.
pub fn openai_error_to_anthropic(err: &ChatErrorResponse) -> ErrorResponse {
    let error_type = match err.error.error_type.as_str() {
        "invalid_request_error" => "invalid_request_error",
        "rate_limit_error" | "rate_limit_exceeded" => "rate_limit_error",
        _ => "api_error",
    };

    ErrorResponse::new(error_type, &err.error.message)
}
