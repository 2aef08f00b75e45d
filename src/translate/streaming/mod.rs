//! Streaming re-emitters.
//!
//! Each sequencer consumes upstream chat-completion chunks one at a time and
//! produces the SSE frames of one client dialect. A sequencer is owned by the
//! task driving a single response and is discarded when the stream ends.
//!
//! Lifecycle: [`EventSequencer::start`] once, [`EventSequencer::on_data`] per
//! upstream `data:` payload, [`EventSequencer::on_done`] if upstream sent
//! `[DONE]`, then [`EventSequencer::finish`] exactly once, whether the upstream
//! ended cleanly, failed, or never produced a chunk.

mod anthropic;
mod relay;
mod responses;

pub use anthropic::AnthropicSequencer;
pub use relay::{OpenAiRelay, DONE_SENTINEL};
pub use responses::ResponsesSequencer;

use serde::Serialize;
use serde_json::Value;

use super::canonical::UsageCounters;
use super::openai_types::ChatCompletionChunk;

/// One server-sent event: an optional `event:` name and its `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseFrame {
    pub fn named(event: &'static str, payload: &impl Serialize) -> Self {
        let data = serde_json::to_string(payload).unwrap_or_else(|e| {
            tracing::warn!(event, error = %e, "Failed to serialize stream event");
            "{}".to_string()
        });
        Self {
            event: Some(event),
            data,
        }
    }

    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

pub trait EventSequencer: Send {
    /// Frames emitted before the upstream call is made.
    fn start(&mut self) -> Vec<SseFrame>;

    /// Frames for one upstream `data:` payload. Unparsable payloads yield nothing.
    fn on_data(&mut self, data: &str) -> Vec<SseFrame>;

    /// Upstream sent its `[DONE]` terminator.
    fn on_done(&mut self) -> Vec<SseFrame> {
        Vec::new()
    }

    /// Closing frames, built from whatever was accumulated.
    fn finish(&mut self) -> Vec<SseFrame>;

    /// Latest usage snapshot seen on the stream.
    fn usage(&self) -> UsageCounters;

    /// Summary of the generated output, for telemetry.
    fn output(&self) -> Value;
}

fn parse_chunk(data: &str) -> Option<ChatCompletionChunk> {
    match serde_json::from_str(data) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparsable upstream chunk");
            None
        }
    }
}
