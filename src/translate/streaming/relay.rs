use serde::Deserialize;
use serde_json::{json, Value};

use super::{EventSequencer, SseFrame};
use crate::translate::canonical::UsageCounters;
use crate::translate::openai_types::ChatCompletionChunk;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Forwards upstream chunks unchanged apart from a stable `id` and `created`.
#[derive(Debug)]
pub struct OpenAiRelay {
    fallback_id: String,
    created: i64,
    text: String,
    usage: UsageCounters,
    done_sent: bool,
}

impl OpenAiRelay {
    pub fn new() -> Self {
        Self {
            fallback_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            text: String::new(),
            usage: UsageCounters::default(),
            done_sent: false,
        }
    }

    /// Inject `id` and `created` where upstream left them out, and track the
    /// text and usage for telemetry. Returns `None` for non-object payloads.
    pub fn relay(&mut self, data: &str) -> Option<String> {
        let mut doc: Value = match serde_json::from_str(data) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping unparsable upstream chunk");
                return None;
            }
        };
        let obj = doc.as_object_mut()?;

        if obj.get("id").map_or(true, Value::is_null) {
            obj.insert("id".to_string(), Value::from(self.fallback_id.as_str()));
        }
        if obj.get("created").map_or(true, Value::is_null) {
            obj.insert("created".to_string(), Value::from(self.created));
        }

        if let Ok(chunk) = ChatCompletionChunk::deserialize(&doc) {
            if let Some(ref usage) = chunk.usage {
                self.usage.apply(usage);
            }
            if let Some(content) = chunk.choices.first().and_then(|c| c.delta.content.as_deref()) {
                self.text.push_str(content);
            }
        }

        Some(doc.to_string())
    }
}

impl Default for OpenAiRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSequencer for OpenAiRelay {
    fn start(&mut self) -> Vec<SseFrame> {
        Vec::new()
    }

    fn on_data(&mut self, data: &str) -> Vec<SseFrame> {
        self.relay(data).map(SseFrame::data).into_iter().collect()
    }

    fn on_done(&mut self) -> Vec<SseFrame> {
        if self.done_sent {
            return Vec::new();
        }
        self.done_sent = true;
        vec![SseFrame::data(DONE_SENTINEL)]
    }

    fn finish(&mut self) -> Vec<SseFrame> {
        self.on_done()
    }

    fn usage(&self) -> UsageCounters {
        self.usage
    }

    fn output(&self) -> Value {
        json!({"role": "assistant", "content": self.text})
    }
}
