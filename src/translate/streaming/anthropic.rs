//! State machine for translating upstream streaming chunks into Anthropic SSE events.
//!
//! The stream always opens with `message_start` and an empty text block at
//! index 0, and always closes with `content_block_stop`, `message_delta` and
//! `message_stop`. In between, at most one content block is open at a time:
//! starting a `tool_use` block closes the current one, and text arriving while
//! a tool block is open starts a fresh text block.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{parse_chunk, EventSequencer, SseFrame};
use crate::translate::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StopReason,
    StreamEvent, Usage,
};
use crate::translate::canonical::UsageCounters;
use crate::translate::openai_types::{ChatCompletionChunk, ChunkToolCall};
use crate::translate::response::map_finish_reason;

/// A tool call being reassembled from argument fragments.
#[derive(Debug, Clone)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
pub struct AnthropicSequencer {
    message_id: String,
    model: String,
    started: bool,
    finished: bool,
    block_index: usize,
    /// Upstream index of the tool call whose block is currently open.
    open_tool: Option<u32>,
    /// Keyed by the upstream tool-call array index.
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    usage: UsageCounters,
    stop_reason: StopReason,
    text: String,
}

impl AnthropicSequencer {
    /// `model` is echoed in `message_start`; use the name the client asked for.
    pub fn new(model: &str) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            started: false,
            finished: false,
            block_index: 0,
            open_tool: None,
            tool_calls: BTreeMap::new(),
            usage: UsageCounters::default(),
            stop_reason: StopReason::EndTurn,
            text: String::new(),
        }
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn start_events(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        vec![
            StreamEvent::MessageStart {
                message: MessagesResponse {
                    id: self.message_id.clone(),
                    response_type: "message".to_string(),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage::default(),
                },
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Text {
                    text: String::new(),
                },
            },
        ]
    }

    /// Process a single upstream chunk, returning zero or more Anthropic events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = self.start_events();

        if let Some(ref usage) = chunk.usage {
            self.usage.apply(usage);
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        match choice.finish_reason.as_deref() {
            Some("tool_calls") => self.stop_reason = StopReason::ToolUse,
            other => self.stop_reason = map_finish_reason(other, self.stop_reason),
        }

        if let Some(content) = choice.delta.content.as_deref().filter(|s| !s.is_empty()) {
            if self.open_tool.take().is_some() {
                self.open_block(
                    &mut events,
                    ResponseContentBlock::Text {
                        text: String::new(),
                    },
                );
            }

            self.text.push_str(content);
            events.push(StreamEvent::ContentBlockDelta {
                index: self.block_index,
                delta: Delta::TextDelta {
                    text: content.to_string(),
                },
            });
        }

        for call in &choice.delta.tool_calls {
            self.process_tool_call(call, &mut events);
        }

        events
    }

    fn process_tool_call(&mut self, call: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let function = call.function.as_ref();
        let fragment = function
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty());

        if let Some(id) = call.id.as_deref().filter(|id| !id.is_empty()) {
            let name = function
                .and_then(|f| f.name.clone())
                .unwrap_or_default();

            self.open_block(
                events,
                ResponseContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.clone(),
                    input: Value::Object(Map::new()),
                },
            );
            self.open_tool = Some(call.index);
            self.tool_calls.insert(
                call.index,
                ToolCallAccumulator {
                    id: id.to_string(),
                    name,
                    arguments: String::new(),
                },
            );
        } else if !self.tool_calls.contains_key(&call.index) {
            tracing::debug!(index = call.index, "Dropping fragment for unknown tool call");
            return;
        }

        let Some(fragment) = fragment else {
            return;
        };
        if let Some(acc) = self.tool_calls.get_mut(&call.index) {
            acc.arguments.push_str(fragment);
        }
        // A closed block only keeps the fragment in the accumulated output
        if self.open_tool != Some(call.index) {
            tracing::debug!(index = call.index, "Tool call fragment arrived after its block closed");
            return;
        }
        events.push(StreamEvent::ContentBlockDelta {
            index: self.block_index,
            delta: Delta::InputJsonDelta {
                partial_json: fragment.to_string(),
            },
        });
    }

    /// Close the current block and open `block` at the next index.
    fn open_block(&mut self, events: &mut Vec<StreamEvent>, block: ResponseContentBlock) {
        events.push(StreamEvent::ContentBlockStop {
            index: self.block_index,
        });
        self.block_index += 1;
        events.push(StreamEvent::ContentBlockStart {
            index: self.block_index,
            content_block: block,
        });
    }

    /// Call once the upstream stream has ended, cleanly or not.
    pub fn finish_events(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = self.start_events();
        self.finished = true;

        events.push(StreamEvent::ContentBlockStop {
            index: self.block_index,
        });
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: self.stop_reason,
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.usage.completion_tokens,
                cache_read_input_tokens: self.usage.cached_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);

        events
    }
}

fn to_frames(events: Vec<StreamEvent>) -> Vec<SseFrame> {
    events
        .iter()
        .map(|event| SseFrame::named(event.event_name(), event))
        .collect()
}

impl EventSequencer for AnthropicSequencer {
    fn start(&mut self) -> Vec<SseFrame> {
        to_frames(self.start_events())
    }

    fn on_data(&mut self, data: &str) -> Vec<SseFrame> {
        match parse_chunk(data) {
            Some(chunk) => to_frames(self.process_chunk(&chunk)),
            None => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<SseFrame> {
        to_frames(self.finish_events())
    }

    fn usage(&self) -> UsageCounters {
        self.usage
    }

    fn output(&self) -> Value {
        let tool_calls: Vec<Value> = self
            .tool_calls
            .values()
            .map(|tc| json!({"id": tc.id, "name": tc.name, "arguments": tc.arguments}))
            .collect();
        json!({
            "role": "assistant",
            "content": self.text,
            "tool_calls": tool_calls,
            "stop_reason": self.stop_reason.as_str(),
        })
    }
}
