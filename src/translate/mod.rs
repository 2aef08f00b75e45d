//! Dialect translation.
//!
//! Converts OpenAI Chat, OpenAI Responses and Anthropic Messages requests into
//! one canonical upstream request, and converts upstream responses and
//! streaming chunks back into each client dialect. Nothing here performs I/O.

pub mod anthropic_types;
pub mod canonical;
pub mod content;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod responses_types;
pub mod streaming;
