use serde_json::{json, Value};

use super::{parse_chunk, EventSequencer, SseFrame};
use crate::translate::canonical::UsageCounters;
use crate::translate::openai_types::ChatCompletionChunk;
use crate::translate::responses_types::{
    new_response_id, InputTokensDetails, OutputContent, OutputItem, ResponseObject,
    ResponsesStreamEvent, ResponsesUsage,
};

/// Re-emits upstream chunks as Responses API stream events.
///
/// Only text is streamed. Tool-call deltas are dropped; streaming clients that
/// need tool calls should use the non-streaming endpoint.
#[derive(Debug)]
pub struct ResponsesSequencer {
    response_id: String,
    created_at: i64,
    model: String,
    text: String,
    usage: UsageCounters,
    started: bool,
    finished: bool,
}

impl ResponsesSequencer {
    pub fn new(model: &str) -> Self {
        Self {
            response_id: new_response_id(),
            created_at: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            text: String::new(),
            usage: UsageCounters::default(),
            started: false,
            finished: false,
        }
    }

    fn envelope(&self, status: &str, output: Vec<OutputItem>, usage: Option<ResponsesUsage>) -> ResponseObject {
        ResponseObject {
            id: self.response_id.clone(),
            object: "response".to_string(),
            created_at: self.created_at,
            status: status.to_string(),
            model: self.model.clone(),
            output,
            usage,
        }
    }

    pub fn start_events(&mut self) -> Vec<ResponsesStreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        vec![
            ResponsesStreamEvent::Created {
                response: self.envelope("in_progress", Vec::new(), None),
            },
            ResponsesStreamEvent::OutputItemAdded {
                output_index: 0,
                item: OutputItem::Message {
                    role: "assistant".to_string(),
                    content: Vec::new(),
                },
            },
            ResponsesStreamEvent::ContentPartAdded {
                output_index: 0,
                content_index: 0,
                part: OutputContent::OutputText {
                    text: String::new(),
                },
            },
        ]
    }

    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<ResponsesStreamEvent> {
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

        if !choice.delta.tool_calls.is_empty() {
            tracing::debug!(
                count = choice.delta.tool_calls.len(),
                "Tool-call deltas are not streamed on the Responses endpoint"
            );
        }

        if let Some(delta) = choice.delta.content.as_deref().filter(|s| !s.is_empty()) {
            self.text.push_str(delta);
            events.push(ResponsesStreamEvent::OutputTextDelta {
                output_index: 0,
                content_index: 0,
                delta: delta.to_string(),
            });
        }

        events
    }

    pub fn finish_events(&mut self) -> Vec<ResponsesStreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = self.start_events();
        self.finished = true;

        let part = OutputContent::OutputText {
            text: self.text.clone(),
        };
        let item = OutputItem::assistant_text(self.text.clone());
        let usage = ResponsesUsage {
            input_tokens: self.usage.prompt_tokens,
            output_tokens: self.usage.completion_tokens,
            total_tokens: self.usage.total_tokens,
            input_tokens_details: InputTokensDetails {
                cached_tokens: self.usage.cached_tokens,
            },
            output_tokens_details: None,
        };

        events.push(ResponsesStreamEvent::OutputTextDone {
            output_index: 0,
            content_index: 0,
            text: self.text.clone(),
        });
        events.push(ResponsesStreamEvent::ContentPartDone {
            output_index: 0,
            content_index: 0,
            part,
        });
        events.push(ResponsesStreamEvent::OutputItemDone {
            output_index: 0,
            item: item.clone(),
        });
        events.push(ResponsesStreamEvent::Completed {
            response: self.envelope("completed", vec![item], Some(usage)),
        });

        events
    }
}

fn to_frames(events: Vec<ResponsesStreamEvent>) -> Vec<SseFrame> {
    events
        .iter()
        .map(|event| SseFrame::named(event.event_name(), event))
        .collect()
}

impl EventSequencer for ResponsesSequencer {
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
        json!({"role": "assistant", "content": self.text})
    }
}
