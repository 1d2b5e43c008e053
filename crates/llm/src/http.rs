use futures::StreamExt;
use serde::Deserialize;
use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use vellum_chat::{Message, StreamTarget};

use super::payload::build_chat_request;
use super::provider::{
    LlmProvider, MissingApiKeySnafu, MissingEndpointSnafu, ProviderConfig, ProviderError,
    ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEventMapped, StreamEventPayload,
    StreamMode, StreamRequest, make_event_stream,
};
use super::sources::ChatSource;

/// Streaming chat provider over the `{prompt, messages, input}` HTTP
/// endpoint.
///
/// `stream_chat` returns immediately with an event receiver and a detached
/// worker future; the caller spawns the worker and reads mapped events until
/// a terminal payload arrives.
pub struct HttpChatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "http-provider-new",
                provider_id: config.provider_id.clone(),
            }
        );
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-provider-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn emit(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: &StreamTarget,
        payload: StreamEventPayload,
    ) -> bool {
        event_tx
            .send(StreamEventMapped {
                target: target.clone(),
                payload,
            })
            .is_ok()
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target.clone();
        let model = request.model.clone().or_else(|| config.default_model.clone());
        let body = build_chat_request(request.prompt.clone(), &request.messages, model);

        let response = client
            .post(&config.endpoint)
            .bearer_auth(&config.api_key)
            .header(reqwest::header::ACCEPT, request.mode.accept_header())
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(source) => {
                let error = ProviderError::HttpClient {
                    stage: "send-chat-request",
                    source,
                };
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    error = %error,
                    "failed to open chat stream"
                );
                Self::emit(&event_tx, &target, StreamEventPayload::Error(error.to_string()));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let payload = response.text().await.unwrap_or_default();
            let error = ProviderError::EndpointStatus {
                stage: "chat-http-status",
                status: status.as_u16(),
                body: payload,
            };
            tracing::warn!(
                target = ?target,
                status = status.as_u16(),
                "chat endpoint rejected the request"
            );
            Self::emit(&event_tx, &target, StreamEventPayload::Error(error.to_string()));
            return;
        }

        let mut byte_stream = response.bytes_stream();
        let mut frames = SseFrameBuffer::default();
        let mut cancelled = false;
        let mut terminal_seen = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "chat stream cancelled");
                    break;
                }
                chunk = byte_stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => match request.mode {
                            StreamMode::Events => {
                                for data in frames.push(&bytes) {
                                    if data == "[DONE]" {
                                        continue;
                                    }

                                    let event = match serde_json::from_str::<SseEvent>(&data) {
                                        Ok(event) => event,
                                        Err(error) => {
                                            tracing::debug!(
                                                target = ?target,
                                                error = %error,
                                                "skipping undecodable stream event"
                                            );
                                            continue;
                                        }
                                    };

                                    let Some(payload) = map_sse_event(event) else {
                                        continue;
                                    };
                                    let is_terminal = matches!(
                                        payload,
                                        StreamEventPayload::Finish { .. }
                                            | StreamEventPayload::Error(_)
                                    );
                                    if !Self::emit(&event_tx, &target, payload) {
                                        return;
                                    }
                                    if is_terminal {
                                        terminal_seen = true;
                                    }
                                }
                            }
                            StreamMode::Text => {
                                let text = String::from_utf8_lossy(&bytes).to_string();
                                if !text.is_empty()
                                    && !Self::emit(
                                        &event_tx,
                                        &target,
                                        StreamEventPayload::Delta(text),
                                    )
                                {
                                    return;
                                }
                            }
                        },
                        Some(Err(source)) => {
                            let error = ProviderError::HttpClient {
                                stage: "stream-chunk",
                                source,
                            };
                            tracing::warn!(
                                target = ?target,
                                error = %error,
                                "chat stream emitted an error chunk"
                            );
                            Self::emit(
                                &event_tx,
                                &target,
                                StreamEventPayload::Error(error.to_string()),
                            );
                            terminal_seen = true;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !terminal_seen {
            // A raw text stream ending cleanly is a success; an event stream
            // ending without a finish event is a cancellation ack or hang-up.
            let payload = if !cancelled && request.mode == StreamMode::Text {
                StreamEventPayload::Finish {
                    reason: "stop".to_string(),
                    message: None,
                }
            } else {
                StreamEventPayload::Closed
            };
            let _ = Self::emit(&event_tx, &target, payload);
        }
    }
}

impl LlmProvider for HttpChatProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            super::provider::EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

/// One structured event decoded from an SSE `data:` payload.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SseEvent {
    #[serde(rename = "text-delta")]
    TextDelta { delta: String },
    #[serde(rename = "source-url")]
    SourceUrl {
        id: String,
        url: String,
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(rename = "source-document")]
    SourceDocument {
        id: String,
        #[serde(rename = "mediaType")]
        media_type: String,
        title: String,
        #[serde(default)]
        filename: Option<String>,
    },
    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "finishReason", default)]
        finish_reason: Option<String>,
        #[serde(default)]
        message: Option<Message>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

fn map_sse_event(event: SseEvent) -> Option<StreamEventPayload> {
    let payload = match event {
        SseEvent::TextDelta { delta } => {
            if delta.is_empty() {
                return None;
            }
            StreamEventPayload::Delta(delta)
        }
        SseEvent::SourceUrl { id, url, title } => {
            StreamEventPayload::Source(ChatSource::Url { id, url, title })
        }
        SseEvent::SourceDocument {
            id,
            media_type,
            title,
            filename,
        } => StreamEventPayload::Source(ChatSource::Document {
            id,
            media_type,
            title,
            filename,
        }),
        SseEvent::Finish {
            finish_reason,
            message,
        } => StreamEventPayload::Finish {
            reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
            message,
        },
        SseEvent::Error { error_text } => StreamEventPayload::Error(error_text),
    };

    Some(payload)
}

/// Incremental server-sent-event frame splitter.
///
/// Frames are separated by blank lines; within a frame, `data:` line
/// payloads are concatenated with newlines. Chunk boundaries may fall
/// anywhere, including inside a frame separator.
#[derive(Debug, Default)]
pub struct SseFrameBuffer {
    buffer: String,
}

impl SseFrameBuffer {
    /// Feeds raw bytes in, returns every completed frame's data payload.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(chunk).replace('\r', "");
        self.buffer.push_str(&text);

        let mut frames = Vec::new();
        while let Some(split) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..split + 2).collect();
            if let Some(data) = Self::frame_data(&frame) {
                frames.push(data);
            }
        }

        frames
    }

    fn frame_data(frame: &str) -> Option<String> {
        let mut data_lines = Vec::new();

        for line in frame.lines() {
            if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        if data_lines.is_empty() {
            None
        } else {
            Some(data_lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frames_across_chunk_boundaries() {
        let mut frames = SseFrameBuffer::default();

        assert!(frames.push(b"data: {\"type\":\"text-de").is_empty());
        let complete = frames.push(b"lta\",\"delta\":\"hi\"}\n\ndata: [DONE]\n\n");

        assert_eq!(
            complete,
            vec![
                "{\"type\":\"text-delta\",\"delta\":\"hi\"}".to_string(),
                "[DONE]".to_string(),
            ]
        );
    }

    #[test]
    fn handles_crlf_and_multi_line_data() {
        let mut frames = SseFrameBuffer::default();
        let complete = frames.push(b"data: line one\r\ndata: line two\r\n\r\n");

        assert_eq!(complete, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn ignores_comment_only_frames() {
        let mut frames = SseFrameBuffer::default();
        let complete = frames.push(b": keep-alive\n\ndata: x\n\n");

        assert_eq!(complete, vec!["x".to_string()]);
    }

    #[test]
    fn decodes_each_structured_event_kind() {
        let delta: SseEvent =
            serde_json::from_str("{\"type\":\"text-delta\",\"delta\":\"abc\"}").expect("delta");
        assert!(matches!(
            map_sse_event(delta),
            Some(StreamEventPayload::Delta(text)) if text == "abc"
        ));

        let source: SseEvent = serde_json::from_str(
            "{\"type\":\"source-url\",\"id\":\"s1\",\"url\":\"https://a.example\"}",
        )
        .expect("source");
        assert!(matches!(
            map_sse_event(source),
            Some(StreamEventPayload::Source(ChatSource::Url { url, .. }))
                if url == "https://a.example"
        ));

        let finish: SseEvent =
            serde_json::from_str("{\"type\":\"finish\",\"finishReason\":\"stop\"}").expect("finish");
        assert!(matches!(
            map_sse_event(finish),
            Some(StreamEventPayload::Finish { reason, message: None }) if reason == "stop"
        ));

        let error: SseEvent =
            serde_json::from_str("{\"type\":\"error\",\"errorText\":\"boom\"}").expect("error");
        assert!(matches!(
            map_sse_event(error),
            Some(StreamEventPayload::Error(text)) if text == "boom"
        ));
    }

    #[test]
    fn empty_deltas_are_dropped() {
        let delta: SseEvent =
            serde_json::from_str("{\"type\":\"text-delta\",\"delta\":\"\"}").expect("delta");
        assert!(map_sse_event(delta).is_none());
    }

    #[test]
    fn finish_event_can_carry_the_assembled_message() {
        let raw = "{\"type\":\"finish\",\"finishReason\":\"stop\",\"message\":{\"id\":\"m1\",\"createdAt\":9,\"role\":\"assistant\",\"parts\":[{\"type\":\"text\",\"text\":\"done\"}]}}";
        let finish: SseEvent = serde_json::from_str(raw).expect("finish");

        match map_sse_event(finish) {
            Some(StreamEventPayload::Finish {
                message: Some(message),
                ..
            }) => {
                assert_eq!(message.id.as_str(), "m1");
                assert_eq!(message.parts.len(), 1);
            }
            other => panic!("expected finish with message, got {other:?}"),
        }
    }

    #[test]
    fn provider_construction_requires_credentials() {
        let missing_key = HttpChatProvider::new(ProviderConfig::new(
            "chat",
            "",
            "https://chat.example/api/chat",
            None,
        ));
        assert!(matches!(
            missing_key,
            Err(ProviderError::MissingApiKey { .. })
        ));

        let missing_endpoint =
            HttpChatProvider::new(ProviderConfig::new("chat", "sk-test", "", None));
        assert!(matches!(
            missing_endpoint,
            Err(ProviderError::MissingEndpoint { .. })
        ));
    }
}
