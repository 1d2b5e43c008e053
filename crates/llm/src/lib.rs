#![deny(unsafe_code)]

//! Transport adapter for the streaming chat endpoint.
//!
//! Shapes the in-memory transcript into the `{prompt, messages, input}` wire
//! request, negotiates the reply stream flavor via `Accept`, decodes the
//! structured event stream, and deduplicates inbound citations.

pub mod http;
pub mod payload;
pub mod provider;
pub mod sources;

pub use http::{HttpChatProvider, SseFrameBuffer};
pub use payload::{
    ChatRequestBody, WireContent, WireMessage, WirePart, build_chat_request, content_from_parts,
    parts_from_content, wire_message_from,
};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEventMapped, StreamEventPayload, StreamMode,
    StreamRequest, make_event_stream,
};
pub use sources::{ChatSource, dedupe_sources, strip_trailing_source_links};
