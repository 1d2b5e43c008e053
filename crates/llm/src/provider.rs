use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use vellum_chat::{Message, StreamTarget};

use super::sources::ChatSource;

/// Connection settings for the streaming chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model,
        }
    }
}

/// Reply stream flavor, negotiated via the `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Structured incremental events (deltas, sources, finish).
    #[default]
    Events,
    /// Raw incremental text, no structure.
    Text,
}

impl StreamMode {
    pub fn accept_header(&self) -> &'static str {
        match self {
            Self::Events => "text/event-stream",
            Self::Text => "text/plain",
        }
    }
}

/// One streaming send: the full transcript plus persona prompt, bound to a
/// stream target captured at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub prompt: String,
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub mode: StreamMode,
}

impl StreamRequest {
    pub fn new(target: StreamTarget, prompt: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            target,
            prompt: prompt.into(),
            messages,
            model: None,
            mode: StreamMode::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Payload of one mapped provider event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventPayload {
    /// Incremental assistant text.
    Delta(String),
    /// A citation announced mid-stream.
    Source(ChatSource),
    /// Terminal success, optionally carrying the fully assembled message.
    Finish {
        reason: String,
        message: Option<Message>,
    },
    /// Terminal failure.
    Error(String),
    /// The stream closed without a terminal finish (cancellation ack or a
    /// provider hang-up). Never commits.
    Closed,
}

/// Provider event routed to the target captured at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("missing endpoint URL for provider '{provider_id}'"))]
    MissingEndpoint {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat endpoint returned status {status}: {body}"))]
    EndpointStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
}

/// Receiver half of a provider stream. Dropping it cancels the worker.
pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// A started stream: the event receiver plus the detached worker future the
/// caller must spawn (or drive) to completion.
pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEventMapped> {
        self.events.try_recv().ok()
    }

    /// Signals the worker to stop delivering chunks. Returns false when the
    /// worker already finished or was cancelled before.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A streaming chat backend.
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the channel trio backing a provider stream: the event sender a
/// worker writes to, the receiver handed to the caller, and the cancel
/// signal the worker selects on. Custom [`LlmProvider`] implementations use
/// this to construct their handles.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
